#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use linkup_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::auth::{SecretPair, TokenSecrets, TokenTtls};

/// Default config path: `~/.linkup/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".linkup").join("config.toml"))
}

/// Default sqlite database under the config directory.
pub fn default_database_url() -> anyhow::Result<String> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	let path = home.join(".linkup").join("linkup.db");
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).with_context(|| format!("create data dir {}", parent.display()))?;
	}
	Ok(format!("sqlite://{}?mode=rwc", path.display()))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// REST API bind address (host:port).
	pub api_bind: Option<String>,
	/// Directory for stored objects (group images).
	pub uploads_dir: Option<PathBuf>,
	/// Event rate limiting: per-connection burst size.
	pub event_rate_limit_burst: u32,
	/// Event rate limiting: per-connection events per minute.
	pub event_rate_limit_per_minute: u32,
}

/// Credential signing settings. Each audience level carries an independent
/// access/refresh secret pair.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	pub bearer_access_secret: Option<SecretString>,
	pub bearer_refresh_secret: Option<SecretString>,
	pub system_access_secret: Option<SecretString>,
	pub system_refresh_secret: Option<SecretString>,
	pub access_ttl_secs: Option<u64>,
	pub refresh_ttl_secs: Option<u64>,
}

impl AuthSettings {
	/// Resolve the signing secrets, generating ephemeral ones for anything
	/// unset. Ephemeral secrets do not survive a restart, so every issued
	/// token dies with the process.
	pub fn token_secrets(&self) -> TokenSecrets {
		let mut generated = false;
		let mut resolve = |configured: &Option<SecretString>| match configured {
			Some(secret) => secret.clone(),
			None => {
				generated = true;
				SecretString::new(uuid::Uuid::new_v4().to_string())
			}
		};

		let secrets = TokenSecrets {
			bearer: SecretPair {
				access: resolve(&self.bearer_access_secret),
				refresh: resolve(&self.bearer_refresh_secret),
			},
			system: SecretPair {
				access: resolve(&self.system_access_secret),
				refresh: resolve(&self.system_refresh_secret),
			},
		};

		if generated {
			warn!("auth: one or more signing secrets unset; generated ephemeral dev secrets");
		}

		secrets
	}

	pub fn token_ttls(&self) -> TokenTtls {
		let defaults = TokenTtls::default();
		TokenTtls {
			access: self.access_ttl_secs.map(Duration::from_secs).unwrap_or(defaults.access),
			refresh: self.refresh_ttl_secs.map(Duration::from_secs).unwrap_or(defaults.refresh),
		}
	}
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	api_bind: Option<String>,
	uploads_dir: Option<String>,
	event_rate_limit_burst: Option<u32>,
	event_rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	bearer_access_secret: Option<String>,
	bearer_refresh_secret: Option<String>,
	system_access_secret: Option<String>,
	system_refresh_secret: Option<String>,
	access_ttl_secs: Option<u64>,
	refresh_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

fn secret_of(value: Option<String>) -> Option<SecretString> {
	value.filter(|s| !s.trim().is_empty()).map(SecretString::new)
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				api_bind: file.server.api_bind.filter(|s| !s.trim().is_empty()),
				uploads_dir: file.server.uploads_dir.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				event_rate_limit_burst: file.server.event_rate_limit_burst.unwrap_or(20),
				event_rate_limit_per_minute: file.server.event_rate_limit_per_minute.unwrap_or(120),
			},
			auth: AuthSettings {
				bearer_access_secret: secret_of(file.auth.bearer_access_secret),
				bearer_refresh_secret: secret_of(file.auth.bearer_refresh_secret),
				system_access_secret: secret_of(file.auth.system_access_secret),
				system_refresh_secret: secret_of(file.auth.system_refresh_secret),
				access_ttl_secs: file.auth.access_ttl_secs.filter(|v| *v > 0),
				refresh_ttl_secs: file.auth.refresh_ttl_secs.filter(|v| *v > 0),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("LINKUP_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINKUP_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINKUP_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINKUP_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINKUP_API_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.api_bind = Some(v);
			info!("server config: api_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINKUP_UPLOADS_DIR") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.uploads_dir = Some(PathBuf::from(v));
			info!("server config: uploads_dir overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINKUP_EVENT_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.event_rate_limit_burst = burst;
		info!(burst, "server config: event_rate_limit_burst overridden by env");
	}

	if let Ok(v) = std::env::var("LINKUP_EVENT_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.event_rate_limit_per_minute = rate;
		info!(rate, "server config: event_rate_limit_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("LINKUP_BEARER_ACCESS_SECRET") {
		if let Some(secret) = secret_of(Some(v)) {
			cfg.auth.bearer_access_secret = Some(secret);
			info!("auth config: bearer_access_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINKUP_BEARER_REFRESH_SECRET") {
		if let Some(secret) = secret_of(Some(v)) {
			cfg.auth.bearer_refresh_secret = Some(secret);
			info!("auth config: bearer_refresh_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINKUP_SYSTEM_ACCESS_SECRET") {
		if let Some(secret) = secret_of(Some(v)) {
			cfg.auth.system_access_secret = Some(secret);
			info!("auth config: system_access_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINKUP_SYSTEM_REFRESH_SECRET") {
		if let Some(secret) = secret_of(Some(v)) {
			cfg.auth.system_refresh_secret = Some(secret);
			info!("auth config: system_refresh_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LINKUP_ACCESS_TTL_SECS")
		&& let Ok(ttl) = v.trim().parse::<u64>()
		&& ttl > 0
	{
		cfg.auth.access_ttl_secs = Some(ttl);
		info!(ttl, "auth config: access_ttl_secs overridden by env");
	}

	if let Ok(v) = std::env::var("LINKUP_REFRESH_TTL_SECS")
		&& let Ok(ttl) = v.trim().parse::<u64>()
		&& ttl > 0
	{
		cfg.auth.refresh_ttl_secs = Some(ttl);
		info!(ttl, "auth config: refresh_ttl_secs overridden by env");
	}

	if let Ok(v) = std::env::var("LINKUP_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}
