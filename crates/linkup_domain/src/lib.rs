#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers and tags from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown audience level: {0}")]
	UnknownLevel(String),
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Logical user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
	/// Create a new random user id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}

	/// Parse from the canonical hyphenated form.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected uuid, got: {s}")))
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::parse(s)
	}
}

/// Group conversation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub uuid::Uuid);

impl GroupId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}

	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected uuid, got: {s}")))
	}
}

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for GroupId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		GroupId::parse(s)
	}
}

/// Broadcast room identifier backing a group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	User,
	Admin,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::User => "user",
			Role::Admin => "admin",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match s.to_ascii_lowercase().as_str() {
			"user" => Ok(Role::User),
			"admin" => Ok(Role::Admin),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Trust tier a credential was issued under. Each level owns an independent
/// access/refresh signing secret pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceLevel {
	Bearer,
	System,
}

impl AudienceLevel {
	/// The literal tag used in `Authorization: <Level> <token>` headers.
	pub const fn header_tag(self) -> &'static str {
		match self {
			AudienceLevel::Bearer => "Bearer",
			AudienceLevel::System => "System",
		}
	}
}

impl fmt::Display for AudienceLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.header_tag())
	}
}

impl FromStr for AudienceLevel {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match s {
			"Bearer" => Ok(AudienceLevel::Bearer),
			"System" => Ok(AudienceLevel::System),
			other => Err(ParseIdError::UnknownLevel(other.to_string())),
		}
	}
}

/// Which half of an issued credential pair a caller must present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenClass {
	Access,
	Refresh,
}

/// Logout scope requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutFlag {
	/// Revoke the presented token pair only.
	SignOut,
	/// Invalidate every outstanding token for the subject.
	SignOutEverywhere,
}

/// Error taxonomy shared by the HTTP boundary and the connection gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	MalformedCredential,
	ExpiredOrRevokedCredential,
	StaleCredential,
	UnknownSubject,
	Unauthorized,
	NotFound,
	Conflict,
	UpstreamFailure,
}

impl ErrorKind {
	/// Stable wire identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			ErrorKind::MalformedCredential => "malformed_credential",
			ErrorKind::ExpiredOrRevokedCredential => "expired_or_revoked_credential",
			ErrorKind::StaleCredential => "stale_credential",
			ErrorKind::UnknownSubject => "unknown_subject",
			ErrorKind::Unauthorized => "unauthorized",
			ErrorKind::NotFound => "not_found",
			ErrorKind::Conflict => "conflict",
			ErrorKind::UpstreamFailure => "upstream_failure",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A classified, user-presentable failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ApiError {
	pub kind: ErrorKind,
	pub message: String,
}

impl ApiError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
		}
	}

	pub fn malformed_credential(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::MalformedCredential, message)
	}

	pub fn expired_or_revoked(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::ExpiredOrRevokedCredential, message)
	}

	pub fn stale_credential(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::StaleCredential, message)
	}

	pub fn unknown_subject(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::UnknownSubject, message)
	}

	pub fn unauthorized(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Unauthorized, message)
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::NotFound, message)
	}

	pub fn conflict(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Conflict, message)
	}

	/// Wrap a store/object-storage failure.
	pub fn upstream(err: impl fmt::Display) -> Self {
		Self::new(ErrorKind::UpstreamFailure, err.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_id_parse_roundtrip() {
		let id = UserId::new_v4();
		let parsed = UserId::parse(&id.to_string()).unwrap();
		assert_eq!(parsed, id);
	}

	#[test]
	fn rejects_empty_and_garbage_ids() {
		assert_eq!(UserId::parse(""), Err(ParseIdError::Empty));
		assert!(UserId::parse("not-a-uuid").is_err());
		assert!(RoomId::new("   ").is_err());
	}

	#[test]
	fn audience_level_header_tags() {
		assert_eq!("Bearer".parse::<AudienceLevel>().unwrap(), AudienceLevel::Bearer);
		assert_eq!("System".parse::<AudienceLevel>().unwrap(), AudienceLevel::System);
		// Tags are case-sensitive header literals.
		assert!("bearer".parse::<AudienceLevel>().is_err());
		assert_eq!(AudienceLevel::System.header_tag(), "System");
	}

	#[test]
	fn role_parse_and_display() {
		assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
		assert_eq!(Role::User.to_string(), "user");
		assert!("root".parse::<Role>().is_err());
	}

	#[test]
	fn error_kind_wire_names() {
		assert_eq!(ErrorKind::StaleCredential.as_str(), "stale_credential");
		let err = ApiError::not_found("no such room");
		assert_eq!(err.kind, ErrorKind::NotFound);
		assert_eq!(err.to_string(), "not_found: no such room");
	}
}
