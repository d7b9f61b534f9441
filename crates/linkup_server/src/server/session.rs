#![forbid(unsafe_code)]

use std::sync::Arc;

use linkup_domain::{ApiError, AudienceLevel, TokenClass};

use crate::server::auth::{Claims, TokenSecrets, verify_token};
use crate::server::revocation::RevocationStore;
use crate::server::users::{UserSnapshot, UserStore};

/// The authenticated identity attached to a request or connection for the
/// remainder of its lifetime. Verification runs once per HTTP request and
/// once per connection handshake, never per event.
#[derive(Debug, Clone)]
pub struct AuthContext {
	pub user: UserSnapshot,
	pub claims: Claims,
}

/// Turns a raw credential header into an authenticated identity. Used
/// identically by the HTTP middleware path and the connection handshake.
pub struct SessionAuthenticator {
	users: Arc<UserStore>,
	revocations: Arc<RevocationStore>,
	secrets: TokenSecrets,
}

impl SessionAuthenticator {
	pub fn new(users: Arc<UserStore>, revocations: Arc<RevocationStore>, secrets: TokenSecrets) -> Self {
		Self {
			users,
			revocations,
			secrets,
		}
	}

	pub fn secrets(&self) -> &TokenSecrets {
		&self.secrets
	}

	/// Authenticate `<Level> <token>` against the expected token class. Each
	/// gate rejects immediately with its own reason.
	pub async fn authenticate(&self, header: &str, class: TokenClass) -> Result<AuthContext, ApiError> {
		let header = header.trim();
		let (level_raw, token) = header
			.split_once(' ')
			.ok_or_else(|| ApiError::malformed_credential("missing token parts"))?;

		let token = token.trim();
		if level_raw.is_empty() || token.is_empty() {
			return Err(ApiError::malformed_credential("missing token parts"));
		}

		let level: AudienceLevel = level_raw
			.parse()
			.map_err(|_| ApiError::malformed_credential("unknown audience level"))?;

		// Verify against the secret for the *expected* class; a refresh token
		// presented where an access token is required fails the signature.
		let secret = self.secrets.secret_for(level, class);
		let claims = verify_token(token, secret).map_err(|e| ApiError::expired_or_revoked(e.to_string()))?;

		if self.revocations.is_revoked(&claims.jti).await? {
			return Err(ApiError::expired_or_revoked("credential has been revoked"));
		}

		let user = self
			.users
			.find_by_id(claims.sub, false)
			.await?
			.ok_or_else(|| ApiError::unknown_subject("not a registered account"))?;

		// Tokens minted before the subject's last credentials change are dead
		// even if never individually revoked.
		if let Some(changed_at_ms) = user.credentials_changed_at
			&& (claims.iat as i64).saturating_mul(1000) < changed_at_ms
		{
			return Err(ApiError::stale_credential("credentials changed after issuance"));
		}

		Ok(AuthContext { user, claims })
	}
}
