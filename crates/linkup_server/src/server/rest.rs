#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use linkup_domain::{ApiError, ErrorKind, GroupId, LogoutFlag, TokenClass, UserId};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::accounts::{AccountService, LoginOutcome};
use crate::server::chat_store::{ChatStore, Conversation, ConversationHistory, Page, StoredMessage};
use crate::server::gateway::{ChatGateway, UploadedImage};
use crate::server::multipart::{boundary_from_content_type, parse_multipart};
use crate::server::session::{AuthContext, SessionAuthenticator};
use crate::server::users::{UserSnapshot, UserStore};

/// Largest request body the API accepts (group images included).
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Shared state behind the REST surface.
pub struct ApiState {
	pub authenticator: Arc<SessionAuthenticator>,
	pub accounts: Arc<AccountService>,
	pub gateway: Arc<ChatGateway>,
	pub chats: Arc<ChatStore>,
	pub users: Arc<UserStore>,
}

pub fn spawn_api_server(bind: SocketAddr, state: Arc<ApiState>) {
	tokio::spawn(async move {
		if let Err(err) = run_api_server(bind, state).await {
			warn!(error = %err, "api server stopped");
		}
	});
}

async fn run_api_server(bind: SocketAddr, state: Arc<ApiState>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "api server listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = Arc::clone(&state);
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "api connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, state: Arc<ApiState>) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (parts, body) = req.into_parts();

	let declared_len = parts
		.headers
		.get(hyper::header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<usize>().ok());
	if declared_len.is_some_and(|len| len > MAX_BODY_BYTES) {
		return Ok(status_response(StatusCode::PAYLOAD_TOO_LARGE, "body too large"));
	}

	let body = body.collect().await?.to_bytes();
	if body.len() > MAX_BODY_BYTES {
		return Ok(status_response(StatusCode::PAYLOAD_TOO_LARGE, "body too large"));
	}

	metrics::counter!("linkup_server_api_requests_total").increment(1);

	let path = parts.uri.path().trim_matches('/').to_string();
	let segments: Vec<&str> = if path.is_empty() { Vec::new() } else { path.split('/').collect() };

	let outcome = route(&parts, &segments, &body, &state).await;

	match outcome {
		Ok(response) => Ok(response),
		Err(e) => {
			metrics::counter!("linkup_server_api_errors_total", "kind" => e.kind.as_str()).increment(1);
			Ok(error_response(&e))
		}
	}
}

async fn route(
	parts: &hyper::http::request::Parts,
	segments: &[&str],
	body: &Bytes,
	state: &Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, ApiError> {
	match (parts.method.as_str(), segments) {
		("POST", ["auth", "signup"]) => signup(body, state).await,
		("POST", ["auth", "login"]) => login(body, state).await,
		("POST", ["auth", "login", "confirm"]) => confirm_login(body, state).await,
		("POST", ["auth", "refresh"]) => refresh(parts, state).await,
		("POST", ["auth", "logout"]) => logout(parts, body, state).await,
		("GET", ["chats", user_id]) => direct_history(parts, user_id, state).await,
		("GET", ["chats", "group", group_id]) => group_history(parts, group_id, state).await,
		("POST", ["chats", "group"]) => create_group(parts, body, state).await,
		("PUT", ["contacts", user_id]) => add_contact(parts, user_id, state).await,
		_ => Ok(status_response(StatusCode::NOT_FOUND, "no such route")),
	}
}

async fn authenticate(
	parts: &hyper::http::request::Parts,
	state: &Arc<ApiState>,
	class: TokenClass,
) -> Result<AuthContext, ApiError> {
	let header = parts
		.headers
		.get(hyper::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.ok_or_else(|| ApiError::malformed_credential("missing authorization"))?;

	state.authenticator.authenticate(header, class).await
}

#[derive(Deserialize)]
struct SignupBody {
	username: String,
	email: String,
	password: String,
}

async fn signup(body: &Bytes, state: &Arc<ApiState>) -> Result<Response<Full<Bytes>>, ApiError> {
	let Ok(input) = serde_json::from_slice::<SignupBody>(body) else {
		return Ok(status_response(StatusCode::BAD_REQUEST, "invalid signup body"));
	};
	if input.username.trim().is_empty() || input.email.trim().is_empty() || input.password.is_empty() {
		return Ok(status_response(StatusCode::BAD_REQUEST, "missing signup fields"));
	}

	let user = state.accounts.signup(&input.username, &input.email, &input.password).await?;

	Ok(json_response(
		StatusCode::CREATED,
		&serde_json::json!({ "data": { "user": user_view(&user) } }),
	))
}

#[derive(Deserialize)]
struct LoginBody {
	email: String,
	password: String,
}

async fn login(body: &Bytes, state: &Arc<ApiState>) -> Result<Response<Full<Bytes>>, ApiError> {
	let Ok(input) = serde_json::from_slice::<LoginBody>(body) else {
		return Ok(status_response(StatusCode::BAD_REQUEST, "invalid login body"));
	};

	match state.accounts.login(&input.email, &input.password).await? {
		LoginOutcome::Credentials(credentials) => Ok(json_response(
			StatusCode::OK,
			&serde_json::json!({ "data": { "credentials": credentials } }),
		)),
		LoginOutcome::SecondFactorRequired => Ok(json_response(
			StatusCode::OK,
			&serde_json::json!({ "data": { "status": "second_factor_required" } }),
		)),
	}
}

#[derive(Deserialize)]
struct ConfirmLoginBody {
	email: String,
	code: String,
}

async fn confirm_login(body: &Bytes, state: &Arc<ApiState>) -> Result<Response<Full<Bytes>>, ApiError> {
	let Ok(input) = serde_json::from_slice::<ConfirmLoginBody>(body) else {
		return Ok(status_response(StatusCode::BAD_REQUEST, "invalid confirm body"));
	};

	let credentials = state.accounts.confirm_login(&input.email, &input.code).await?;
	Ok(json_response(
		StatusCode::OK,
		&serde_json::json!({ "data": { "credentials": credentials } }),
	))
}

async fn refresh(parts: &hyper::http::request::Parts, state: &Arc<ApiState>) -> Result<Response<Full<Bytes>>, ApiError> {
	let ctx = authenticate(parts, state, TokenClass::Refresh).await?;
	let credentials = state.accounts.refresh(&ctx).await?;
	Ok(json_response(
		StatusCode::CREATED,
		&serde_json::json!({ "data": { "credentials": credentials } }),
	))
}

#[derive(Deserialize)]
struct LogoutBody {
	flag: LogoutFlag,
}

async fn logout(
	parts: &hyper::http::request::Parts,
	body: &Bytes,
	state: &Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, ApiError> {
	let ctx = authenticate(parts, state, TokenClass::Access).await?;

	let flag = if body.is_empty() {
		LogoutFlag::SignOut
	} else {
		match serde_json::from_slice::<LogoutBody>(body) {
			Ok(input) => input.flag,
			Err(_) => return Ok(status_response(StatusCode::BAD_REQUEST, "invalid logout body")),
		}
	};

	state.accounts.logout(&ctx, flag).await?;
	Ok(json_response(StatusCode::OK, &serde_json::json!({ "data": { "status": "ok" } })))
}

async fn direct_history(
	parts: &hyper::http::request::Parts,
	user_id: &str,
	state: &Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, ApiError> {
	let ctx = authenticate(parts, state, TokenClass::Access).await?;
	let Ok(other) = UserId::parse(user_id) else {
		return Ok(status_response(StatusCode::BAD_REQUEST, "invalid user id"));
	};

	let page = page_from_uri(parts);
	let history = state
		.chats
		.direct_history(ctx.user.id, other, page)
		.await?
		.ok_or_else(|| ApiError::not_found("failed to find matching chat instance"))?;

	Ok(json_response(
		StatusCode::OK,
		&serde_json::json!({ "data": { "chat": chat_view(&history) } }),
	))
}

async fn group_history(
	parts: &hyper::http::request::Parts,
	group_id: &str,
	state: &Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, ApiError> {
	let ctx = authenticate(parts, state, TokenClass::Access).await?;
	let Ok(group) = GroupId::parse(group_id) else {
		return Ok(status_response(StatusCode::BAD_REQUEST, "invalid group id"));
	};

	let page = page_from_uri(parts);
	let history = state
		.chats
		.group_history(group, ctx.user.id, page)
		.await?
		.ok_or_else(|| ApiError::not_found("failed to find matching chat instance"))?;

	Ok(json_response(
		StatusCode::OK,
		&serde_json::json!({ "data": { "chat": chat_view(&history) } }),
	))
}

async fn create_group(
	parts: &hyper::http::request::Parts,
	body: &Bytes,
	state: &Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, ApiError> {
	let ctx = authenticate(parts, state, TokenClass::Access).await?;

	let content_type = parts
		.headers
		.get(hyper::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("");
	let Some(boundary) = boundary_from_content_type(content_type) else {
		return Ok(status_response(StatusCode::BAD_REQUEST, "expected multipart/form-data"));
	};

	let form = match parse_multipart(&boundary, body) {
		Ok(parts) => parts,
		Err(e) => return Ok(status_response(StatusCode::BAD_REQUEST, &format!("invalid multipart body: {e}"))),
	};

	let mut name: Option<String> = None;
	let mut participants: Vec<UserId> = Vec::new();
	let mut image: Option<UploadedImage> = None;

	for part in form {
		match part.name.as_str() {
			"group" if !part.is_file() => name = part.text(),
			"participants" if !part.is_file() => {
				let Some(text) = part.text() else {
					return Ok(status_response(StatusCode::BAD_REQUEST, "invalid participant id"));
				};
				let Ok(id) = UserId::parse(&text) else {
					return Ok(status_response(StatusCode::BAD_REQUEST, "invalid participant id"));
				};
				participants.push(id);
			}
			"attachment" if part.is_file() => {
				let content_type = part.content_type.clone().unwrap_or_else(|| "image/jpeg".to_string());
				if !content_type.starts_with("image/") {
					return Ok(status_response(StatusCode::BAD_REQUEST, "attachment must be an image"));
				}
				image = Some(UploadedImage {
					bytes: part.data,
					content_type,
				});
			}
			_ => {}
		}
	}

	let Some(name) = name.filter(|n| !n.trim().is_empty()) else {
		return Ok(status_response(StatusCode::BAD_REQUEST, "missing group name"));
	};
	if participants.is_empty() {
		return Ok(status_response(StatusCode::BAD_REQUEST, "missing participants"));
	}

	let conversation = state.gateway.create_group(&ctx.user, &name, &participants, image).await?;

	Ok(json_response(
		StatusCode::CREATED,
		&serde_json::json!({ "data": { "chat": conversation_view(&conversation, &[]) } }),
	))
}

async fn add_contact(
	parts: &hyper::http::request::Parts,
	user_id: &str,
	state: &Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, ApiError> {
	let ctx = authenticate(parts, state, TokenClass::Access).await?;
	let Ok(other) = UserId::parse(user_id) else {
		return Ok(status_response(StatusCode::BAD_REQUEST, "invalid user id"));
	};

	if other == ctx.user.id {
		return Ok(status_response(StatusCode::BAD_REQUEST, "cannot add yourself"));
	}

	state
		.users
		.find_by_id(other, false)
		.await?
		.ok_or_else(|| ApiError::not_found("no such user"))?;

	state.users.add_contact(ctx.user.id, other).await?;
	Ok(json_response(StatusCode::OK, &serde_json::json!({ "data": { "status": "ok" } })))
}

fn page_from_uri(parts: &hyper::http::request::Parts) -> Page {
	let query = parts.uri.query().unwrap_or("");
	let mut page = None;
	let mut size = None;
	for pair in query.split('&') {
		match pair.split_once('=') {
			Some(("page", v)) => page = Some(v),
			Some(("size", v)) => size = Some(v),
			_ => {}
		}
	}
	Page::from_query(page, size)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserView {
	id: String,
	username: String,
	role: String,
}

fn user_view(user: &UserSnapshot) -> UserView {
	UserView {
		id: user.id.to_string(),
		username: user.username.clone(),
		role: user.role.to_string(),
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageView {
	id: String,
	content: String,
	created_by: String,
	created_at: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatView {
	id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	group: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	group_image: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	room_id: Option<String>,
	participants: Vec<String>,
	messages: Vec<MessageView>,
}

fn chat_view(history: &ConversationHistory) -> ChatView {
	conversation_view(&history.conversation, &history.messages)
}

fn conversation_view(conversation: &Conversation, messages: &[StoredMessage]) -> ChatView {
	ChatView {
		id: conversation.id.to_string(),
		group: conversation.group_name.clone(),
		group_image: conversation.group_image.clone(),
		room_id: conversation.room_id.as_ref().map(|r| r.as_str().to_string()),
		participants: conversation.participants.iter().map(|p| p.to_string()).collect(),
		messages: messages
			.iter()
			.map(|m| MessageView {
				id: m.id.to_string(),
				content: m.content.clone(),
				created_by: m.author.to_string(),
				created_at: m.created_at,
			})
			.collect(),
	}
}

/// The single boundary translator from the error taxonomy to HTTP.
pub fn status_for(kind: ErrorKind) -> StatusCode {
	match kind {
		ErrorKind::MalformedCredential => StatusCode::BAD_REQUEST,
		ErrorKind::ExpiredOrRevokedCredential => StatusCode::UNAUTHORIZED,
		ErrorKind::StaleCredential => StatusCode::UNAUTHORIZED,
		ErrorKind::UnknownSubject => StatusCode::NOT_FOUND,
		ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
		ErrorKind::NotFound => StatusCode::NOT_FOUND,
		ErrorKind::Conflict => StatusCode::CONFLICT,
		ErrorKind::UpstreamFailure => StatusCode::BAD_GATEWAY,
	}
}

fn error_response(err: &ApiError) -> Response<Full<Bytes>> {
	json_response(
		status_for(err.kind),
		&serde_json::json!({ "error": { "kind": err.kind.as_str(), "message": err.message } }),
	)
}

fn status_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
	json_response(status, &serde_json::json!({ "error": { "kind": "validation_error", "message": message } }))
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
	let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
	Response::builder()
		.status(status)
		.header(hyper::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body)))
		.unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn taxonomy_maps_to_expected_status_codes() {
		assert_eq!(status_for(ErrorKind::MalformedCredential), StatusCode::BAD_REQUEST);
		assert_eq!(status_for(ErrorKind::ExpiredOrRevokedCredential), StatusCode::UNAUTHORIZED);
		assert_eq!(status_for(ErrorKind::StaleCredential), StatusCode::UNAUTHORIZED);
		assert_eq!(status_for(ErrorKind::UnknownSubject), StatusCode::NOT_FOUND);
		assert_eq!(status_for(ErrorKind::Unauthorized), StatusCode::FORBIDDEN);
		assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
		assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
		assert_eq!(status_for(ErrorKind::UpstreamFailure), StatusCode::BAD_GATEWAY);
	}
}
