#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use linkup_util::endpoint::QuicEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::quic::config::QuicServerConfig;
use crate::server::accounts::AccountService;
use crate::server::chat_store::ChatStore;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::gateway::ChatGateway;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::outbox::{OutboundQueue, spawn_outbox_worker};
use crate::server::presence::{PresenceConfig, PresenceRegistry};
use crate::server::rest::{ApiState, spawn_api_server};
use crate::server::revocation::RevocationStore;
use crate::server::rooms::{RoomHub, RoomHubConfig};
use crate::server::session::SessionAuthenticator;
use crate::server::storage::LocalObjectStore;
use crate::server::users::UserStore;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: linkup_server [--bind quic://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: quic://127.0.0.1:4433)\n\
\t         Format: quic://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "quic://127.0.0.1:4433".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,linkup_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("linkup_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let database_url = match server_cfg.persistence.database_url.clone() {
		Some(url) => url,
		None => crate::config::default_database_url()?,
	};

	let users = Arc::new(UserStore::connect(&database_url).await?);
	let chats = Arc::new(ChatStore::connect(&database_url).await?);
	let revocations = Arc::new(RevocationStore::connect(&database_url).await?);
	info!("stores connected");

	let secrets = server_cfg.auth.token_secrets();
	let ttls = server_cfg.auth.token_ttls();

	let (outbox, outbox_rx) = OutboundQueue::new();
	let _outbox_worker = spawn_outbox_worker(outbox_rx);

	let uploads_dir = match server_cfg.server.uploads_dir.clone() {
		Some(dir) => dir,
		None => {
			let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
			home.join(".linkup").join("uploads")
		}
	};
	let images = Arc::new(LocalObjectStore::new(uploads_dir));

	// One registry and one room hub own all live-connection state; every
	// connection task and the REST surface get handles to the same instance.
	let presence = PresenceRegistry::new(PresenceConfig::default());
	let rooms = RoomHub::new(RoomHubConfig::default());

	let gateway = Arc::new(ChatGateway::new(
		Arc::clone(&users),
		Arc::clone(&chats),
		presence.clone(),
		rooms.clone(),
		images,
	));

	let authenticator = Arc::new(SessionAuthenticator::new(
		Arc::clone(&users),
		Arc::clone(&revocations),
		secrets.clone(),
	));

	let accounts = Arc::new(AccountService::new(
		Arc::clone(&users),
		Arc::clone(&revocations),
		secrets,
		ttls,
		outbox,
	));

	if let Some(bind) = server_cfg.server.api_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				let state = Arc::new(ApiState {
					authenticator: Arc::clone(&authenticator),
					accounts: Arc::clone(&accounts),
					gateway: Arc::clone(&gateway),
					chats: Arc::clone(&chats),
					users: Arc::clone(&users),
				});
				spawn_api_server(addr, state);
			}
			Err(e) => warn!(error = %e, %bind, "invalid api bind address (expected host:port)"),
		}
	} else {
		warn!("no api_bind configured; REST surface disabled");
	}

	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %bind_addr,
			cert_der_len = server_cert_der.len(),
			"linkup_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let conn_settings = ConnectionSettings {
		event_rate_limit_burst: server_cfg.server.event_rate_limit_burst,
		event_rate_limit_per_minute: server_cfg.server.event_rate_limit_per_minute,
		..ConnectionSettings::default()
	};

	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("linkup_server_connections_total").increment(1);

		let authenticator = Arc::clone(&authenticator);
		let gateway = Arc::clone(&gateway);
		let conn_settings = conn_settings.clone();

		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					tracing::info!(conn_id, remote = %connection.remote_address(), "accepted connection");

					if let Err(e) = handle_connection(conn_id, connection, authenticator, gateway, conn_settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
