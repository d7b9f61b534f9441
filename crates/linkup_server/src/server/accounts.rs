#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use linkup_domain::{ApiError, AudienceLevel, LogoutFlag, Role, UserId};
use rand::Rng as _;
use tracing::info;

use crate::server::auth::{Credentials, TokenSecrets, TokenTtls, issue_credentials};
use crate::server::outbox::{OutboundIntent, OutboundQueue};
use crate::server::revocation::RevocationStore;
use crate::server::session::AuthContext;
use crate::server::users::{NewUser, UserSnapshot, UserStore};
use crate::util::time::unix_ms_now;

/// Lifetime of a second-factor login code.
const LOGIN_CODE_TTL: Duration = Duration::from_secs(2 * 60);

/// Outcome of a password login.
#[derive(Debug)]
pub enum LoginOutcome {
	/// Credentials issued immediately.
	Credentials(Credentials),
	/// The account requires a second factor; credentials are withheld until
	/// the out-of-band code is confirmed.
	SecondFactorRequired,
}

/// Signup, login and logout flows around the credential codec.
pub struct AccountService {
	users: Arc<UserStore>,
	revocations: Arc<RevocationStore>,
	secrets: TokenSecrets,
	ttls: TokenTtls,
	outbox: OutboundQueue,
}

impl AccountService {
	pub fn new(
		users: Arc<UserStore>,
		revocations: Arc<RevocationStore>,
		secrets: TokenSecrets,
		ttls: TokenTtls,
		outbox: OutboundQueue,
	) -> Self {
		Self {
			users,
			revocations,
			secrets,
			ttls,
			outbox,
		}
	}

	/// Create an account. The password never leaves this function unhashed.
	/// Field presence is the caller's validation concern.
	pub async fn signup(&self, username: &str, email: &str, password: &str) -> Result<UserSnapshot, ApiError> {
		let username = username.trim();
		let email = email.trim();

		let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(ApiError::upstream)?;

		let user = self
			.users
			.create(NewUser {
				username: username.to_string(),
				email: email.to_string(),
				password_hash,
				role: Role::User,
			})
			.await?;

		info!(user = %user.id, "account created");
		Ok(user)
	}

	/// Verify a password. Issues the pair directly, or withholds it behind a
	/// one-time code for accounts with the second factor enabled.
	pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, ApiError> {
		let record = self
			.users
			.find_auth_by_email(email.trim(), false)
			.await?
			.ok_or_else(|| ApiError::not_found("invalid login data"))?;

		let ok = bcrypt::verify(password, &record.password_hash).map_err(ApiError::upstream)?;
		if !ok {
			return Err(ApiError::not_found("invalid login data"));
		}

		if record.snapshot.two_step_enabled {
			let code = generate_login_code();
			let code_hash = bcrypt::hash(&code, bcrypt::DEFAULT_COST).map_err(ApiError::upstream)?;
			let expires_at = unix_ms_now() + LOGIN_CODE_TTL.as_millis() as i64;

			self.users
				.set_login_code(record.snapshot.id, &code_hash, expires_at)
				.await?;
			self.outbox.publish(OutboundIntent::LoginCode {
				to: record.email.clone(),
				code,
			});

			info!(user = %record.snapshot.id, "second factor required; code issued");
			return Ok(LoginOutcome::SecondFactorRequired);
		}

		Ok(LoginOutcome::Credentials(self.issue(record.snapshot.id, AudienceLevel::Bearer)))
	}

	/// Confirm the out-of-band code and release the withheld credentials.
	pub async fn confirm_login(&self, email: &str, code: &str) -> Result<Credentials, ApiError> {
		let record = self
			.users
			.find_auth_by_email(email.trim(), false)
			.await?
			.ok_or_else(|| ApiError::not_found("invalid login data"))?;

		let (Some(code_hash), Some(expires_at)) = (&record.login_code_hash, record.login_code_expires_at) else {
			return Err(ApiError::unauthorized("no pending login code"));
		};

		if expires_at < unix_ms_now() {
			return Err(ApiError::unauthorized("invalid or expired code"));
		}

		let ok = bcrypt::verify(code, code_hash).map_err(ApiError::upstream)?;
		if !ok {
			return Err(ApiError::unauthorized("invalid or expired code"));
		}

		self.users.clear_login_code(record.snapshot.id).await?;

		Ok(self.issue(record.snapshot.id, AudienceLevel::Bearer))
	}

	/// Rotate a pair: issue fresh credentials, then revoke the presented
	/// token id so the old pair dies with one store write.
	pub async fn refresh(&self, ctx: &AuthContext) -> Result<Credentials, ApiError> {
		let credentials = self.issue(ctx.user.id, ctx.claims.level);

		self.revocations
			.revoke(&ctx.claims.jti, ctx.user.id, self.pair_natural_expiry_ms(ctx))
			.await?;

		Ok(credentials)
	}

	/// Targeted or global logout.
	pub async fn logout(&self, ctx: &AuthContext, flag: LogoutFlag) -> Result<(), ApiError> {
		match flag {
			LogoutFlag::SignOut => {
				// O(1) per token: void this pair until its natural expiry.
				self.revocations
					.revoke(&ctx.claims.jti, ctx.user.id, self.pair_natural_expiry_ms(ctx))
					.await?;
			}
			LogoutFlag::SignOutEverywhere => {
				// O(1) per subject: every outstanding token becomes stale.
				self.users.bump_credentials_changed(ctx.user.id, unix_ms_now()).await?;
			}
		}

		info!(user = %ctx.user.id, ?flag, "logout");
		Ok(())
	}

	fn issue(&self, subject: UserId, level: AudienceLevel) -> Credentials {
		let (credentials, _jti) = issue_credentials(subject, level, &self.secrets, &self.ttls);
		credentials
	}

	/// The revocation record must outlive both halves of the pair. The
	/// refresh half is the longer-lived one, and it shares the presented
	/// token's issue instant and id.
	fn pair_natural_expiry_ms(&self, ctx: &AuthContext) -> i64 {
		let refresh_exp = ctx.claims.iat.saturating_add(self.ttls.refresh.as_secs());
		(refresh_exp.max(ctx.claims.exp) as i64).saturating_mul(1000)
	}
}

fn generate_login_code() -> String {
	format!("{:06}", rand::rng().random_range(0..1_000_000))
}
