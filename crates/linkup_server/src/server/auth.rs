#![forbid(unsafe_code)]

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use linkup_domain::{AudienceLevel, TokenClass, UserId};
use linkup_util::secret::SecretString;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::time::unix_secs_now;

/// Version tag written into every issued token.
const TOKEN_PREFIX: &str = "v1";

/// Claims carried by a signed credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
	/// Subject (user) id.
	pub sub: UserId,
	/// Issued-at, Unix seconds.
	pub iat: u64,
	/// Expiry, Unix seconds.
	pub exp: u64,
	/// Token id, shared by the access/refresh pair it was issued with.
	pub jti: String,
	/// Audience level the pair was issued under.
	pub level: AudienceLevel,
}

/// Single-category verification failure. Callers do not get finer granularity
/// than "this credential does not verify".
#[derive(Debug, thiserror::Error)]
#[error("invalid credential: {0}")]
pub struct CredentialError(String);

impl CredentialError {
	fn new(msg: impl Into<String>) -> Self {
		Self(msg.into())
	}
}

/// Access/refresh signing secrets for one audience level.
#[derive(Debug, Clone)]
pub struct SecretPair {
	pub access: SecretString,
	pub refresh: SecretString,
}

/// All signing secrets, one pair per audience level.
#[derive(Debug, Clone)]
pub struct TokenSecrets {
	pub bearer: SecretPair,
	pub system: SecretPair,
}

impl TokenSecrets {
	pub fn pair_for(&self, level: AudienceLevel) -> &SecretPair {
		match level {
			AudienceLevel::Bearer => &self.bearer,
			AudienceLevel::System => &self.system,
		}
	}

	pub fn secret_for(&self, level: AudienceLevel, class: TokenClass) -> &SecretString {
		let pair = self.pair_for(level);
		match class {
			TokenClass::Access => &pair.access,
			TokenClass::Refresh => &pair.refresh,
		}
	}
}

/// Token lifetimes for issued pairs.
#[derive(Debug, Clone)]
pub struct TokenTtls {
	pub access: Duration,
	pub refresh: Duration,
}

impl Default for TokenTtls {
	fn default() -> Self {
		Self {
			access: Duration::from_secs(15 * 60),
			refresh: Duration::from_secs(30 * 24 * 60 * 60),
		}
	}
}

/// An issued access/refresh pair. Both halves share one token id so revoking
/// the pair is a single revocation-store write.
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
	pub access_token: String,
	pub refresh_token: String,
}

/// Sign claims into a compact `v1.<payload>.<sig>` token.
pub fn issue_token(claims: &Claims, secret: &SecretString) -> String {
	let payload = serde_json::to_vec(claims).expect("claims serialize");
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.expose().as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
	format!("{TOKEN_PREFIX}.{payload_b64}.{sig_b64}")
}

/// Verify a compact token against one secret. Rejects on malformed structure,
/// signature mismatch and expiry.
pub fn verify_token(token: &str, secret: &SecretString) -> Result<Claims, CredentialError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != TOKEN_PREFIX {
		return Err(CredentialError::new("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|_| CredentialError::new("undecodable token payload"))?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.expose().as_bytes());
	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|_| CredentialError::new("undecodable token signature"))?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(CredentialError::new("invalid token signature"));
	}

	let claims: Claims = serde_json::from_slice(&payload).map_err(|_| CredentialError::new("unparsable token claims"))?;
	if claims.exp <= unix_secs_now() {
		return Err(CredentialError::new("token expired"));
	}

	Ok(claims)
}

/// Issue a fresh access/refresh pair for one subject. Returns the pair and
/// the shared token id.
pub fn issue_credentials(
	subject: UserId,
	level: AudienceLevel,
	secrets: &TokenSecrets,
	ttls: &TokenTtls,
) -> (Credentials, String) {
	let now = unix_secs_now();
	let jti = uuid::Uuid::new_v4().to_string();
	let pair = secrets.pair_for(level);

	let access_claims = Claims {
		sub: subject,
		iat: now,
		exp: now + ttls.access.as_secs(),
		jti: jti.clone(),
		level,
	};
	let refresh_claims = Claims {
		exp: now + ttls.refresh.as_secs(),
		..access_claims.clone()
	};

	let credentials = Credentials {
		access_token: issue_token(&access_claims, &pair.access),
		refresh_token: issue_token(&refresh_claims, &pair.refresh),
	};

	(credentials, jti)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
