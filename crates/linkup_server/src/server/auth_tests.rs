#![forbid(unsafe_code)]

use linkup_domain::{AudienceLevel, UserId};

use crate::server::auth::{Claims, issue_credentials, issue_token, verify_token};
use crate::server::test_support::{test_secrets, test_ttls};
use crate::util::time::unix_secs_now;

fn claims_for(sub: UserId, level: AudienceLevel) -> Claims {
	let now = unix_secs_now();
	Claims {
		sub,
		iat: now,
		exp: now + 600,
		jti: uuid::Uuid::new_v4().to_string(),
		level,
	}
}

#[test]
fn issue_then_verify_roundtrips_subject() {
	let secrets = test_secrets();
	let subject = UserId::new_v4();

	for level in [AudienceLevel::Bearer, AudienceLevel::System] {
		let claims = claims_for(subject, level);
		let secret = &secrets.pair_for(level).access;

		let token = issue_token(&claims, secret);
		let verified = verify_token(&token, secret).expect("verify");

		assert_eq!(verified.sub, subject);
		assert_eq!(verified.level, level);
		assert_eq!(verified.jti, claims.jti);
	}
}

#[test]
fn verify_rejects_wrong_secret() {
	let secrets = test_secrets();
	let claims = claims_for(UserId::new_v4(), AudienceLevel::Bearer);

	let token = issue_token(&claims, &secrets.bearer.access);

	// Refresh secret, system secrets: all must fail for an access token.
	assert!(verify_token(&token, &secrets.bearer.refresh).is_err());
	assert!(verify_token(&token, &secrets.system.access).is_err());
}

#[test]
fn verify_rejects_tampered_payload() {
	let secrets = test_secrets();
	let claims = claims_for(UserId::new_v4(), AudienceLevel::Bearer);

	let token = issue_token(&claims, &secrets.bearer.access);
	let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();

	let other = claims_for(UserId::new_v4(), AudienceLevel::Bearer);
	let forged = issue_token(&other, &secrets.bearer.access);
	parts[1] = forged.split('.').nth(1).unwrap().to_string();

	let spliced = parts.join(".");
	assert!(verify_token(&spliced, &secrets.bearer.access).is_err());
}

#[test]
fn verify_rejects_expired_and_malformed() {
	let secrets = test_secrets();
	let now = unix_secs_now();

	let expired = Claims {
		sub: UserId::new_v4(),
		iat: now - 120,
		exp: now - 60,
		jti: uuid::Uuid::new_v4().to_string(),
		level: AudienceLevel::Bearer,
	};
	let token = issue_token(&expired, &secrets.bearer.access);
	assert!(verify_token(&token, &secrets.bearer.access).is_err());

	assert!(verify_token("", &secrets.bearer.access).is_err());
	assert!(verify_token("v1.onlytwo", &secrets.bearer.access).is_err());
	assert!(verify_token("v2.a.b", &secrets.bearer.access).is_err());
	assert!(verify_token("v1.!!!.###", &secrets.bearer.access).is_err());
}

#[test]
fn issued_pair_shares_one_token_id() {
	let secrets = test_secrets();
	let ttls = test_ttls();
	let subject = UserId::new_v4();

	let (credentials, jti) = issue_credentials(subject, AudienceLevel::Bearer, &secrets, &ttls);

	let access = verify_token(&credentials.access_token, &secrets.bearer.access).expect("verify access");
	let refresh = verify_token(&credentials.refresh_token, &secrets.bearer.refresh).expect("verify refresh");

	assert_eq!(access.jti, jti);
	assert_eq!(refresh.jti, jti);
	assert_eq!(access.sub, subject);
	assert_eq!(refresh.sub, subject);
	assert!(refresh.exp > access.exp);
}
