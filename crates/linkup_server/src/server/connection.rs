#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, anyhow};
use linkup_domain::{ApiError, TokenClass};
use linkup_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use linkup_protocol::{ClientFrame, Hello, ServerFrame, Welcome};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::gateway::ChatGateway;
use crate::server::presence::ConnectionHandle;
use crate::server::session::SessionAuthenticator;
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,

	/// Outbound frame queue depth per connection; overflow drops frames.
	pub outbound_queue_capacity: usize,

	/// Event rate limiting; zero disables it.
	pub event_rate_limit_burst: u32,
	pub event_rate_limit_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			outbound_queue_capacity: 256,
			event_rate_limit_burst: 0,
			event_rate_limit_per_minute: 0,
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Handle one accepted connection: framed handshake, authenticated event
/// loop, unconditional registry cleanup.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	authenticator: Arc<SessionAuthenticator>,
	gateway: Arc<ChatGateway>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("linkup_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("linkup_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let max_frame_bytes = settings.max_frame_bytes as usize;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let (in_tx, mut in_rx) = mpsc::unbounded_channel::<ClientFrame>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("stream read failed")),
			};

			metrics::counter!("linkup_server_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match linkup_protocol::decode_frame::<ClientFrame>(&buf, max_frame_bytes) {
					Ok((frame, used)) => {
						buf.drain(0..used);
						metrics::counter!("linkup_server_frames_in_total").increment(1);

						if in_tx.send(frame).is_err() {
							return Ok(());
						}
					}
					Err(linkup_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("linkup_server_frame_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode frame"));
					}
				}
			}
		}
	});

	// Handshake: the first frame must be hello carrying the credential, and
	// the same taxonomy as HTTP applies before any state is touched.
	let hello = wait_for_hello(&mut in_rx).await?;
	let ctx = match authenticator.authenticate(&hello.authorization, TokenClass::Access).await {
		Ok(ctx) => ctx,
		Err(e) => {
			warn!(conn_id, kind = %e.kind, "handshake rejected");
			metrics::counter!("linkup_server_handshakes_rejected_total").increment(1);
			let frame = encode_frame(
				&ServerFrame::CustomError {
					kind: e.kind,
					message: e.message,
				},
				max_frame_bytes,
			)
			.map_err(|e| anyhow!(e))?;
			let _ = send.write_all(&frame).await;
			return Ok(());
		}
	};

	let user = ctx.user.clone();
	info!(conn_id, user = %user.id, client = %hello.client_name, "handshake accepted");
	metrics::counter!("linkup_server_handshakes_total").increment(1);

	let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(settings.outbound_queue_capacity);
	let writer_task = tokio::spawn(async move {
		while let Some(frame) = out_rx.recv().await {
			let frame = match encode_frame(&frame, max_frame_bytes) {
				Ok(f) => f,
				Err(e) => {
					warn!(conn_id, error = %e, "failed to encode outbound frame");
					continue;
				}
			};

			metrics::counter!("linkup_server_frames_out_total").increment(1);
			metrics::counter!("linkup_server_bytes_out_total").increment(frame.len() as u64);

			if send.write_all(&frame).await.is_err() {
				return;
			}
		}
	});

	let handle = ConnectionHandle::new(conn_id, out_tx.clone());

	// Welcome must be the first frame on the wire, so queue it before the
	// handle becomes visible to presence broadcasts.
	let _ = out_tx
		.send(ServerFrame::Welcome(Welcome {
			server_name: format!("linkup-server/{}", env!("CARGO_PKG_VERSION")),
			subject_id: user.id,
			server_time_unix_ms: unix_ms_now(),
			max_frame_bytes: settings.max_frame_bytes,
		}))
		.await;

	let came_online = gateway.presence().add_handle(user.id, handle.clone()).await;
	if came_online {
		gateway.presence().broadcast(ServerFrame::OnlineUser { user_id: user.id }).await;
	}

	let mut rate_limiter = TokenBucket::new(settings.event_rate_limit_burst, settings.event_rate_limit_per_minute);

	// Events for this connection are handled one at a time in arrival order;
	// events from other connections interleave freely.
	while let Some(frame) = in_rx.recv().await {
		let is_gateway_event = !matches!(frame, ClientFrame::Hello(_) | ClientFrame::Ping { .. });
		if is_gateway_event
			&& let Some(bucket) = rate_limiter.as_mut()
			&& !bucket.allow()
		{
			metrics::counter!("linkup_server_events_rate_limited_total").increment(1);
			emit_error(&out_tx, &ApiError::unauthorized("rate limited")).await;
			continue;
		}

		let result = match frame {
			ClientFrame::Hello(_) => {
				debug!(conn_id, "ignoring duplicate hello");
				Ok(())
			}
			ClientFrame::Ping { client_time_unix_ms } => {
				let _ = out_tx
					.send(ServerFrame::Pong {
						client_time_unix_ms,
						server_time_unix_ms: unix_ms_now(),
					})
					.await;
				Ok(())
			}
			ClientFrame::SendMessage { content, send_to } => {
				gateway.send_direct_message(&user, &content, send_to).await
			}
			ClientFrame::JoinRoom { room_id } => gateway.join_room(&user, handle.clone(), &room_id).await,
			ClientFrame::SendGroupMessage { content, group_id } => {
				gateway.send_group_message(&user, &content, group_id).await
			}
			ClientFrame::SetTyping {
				typing,
				group_id,
				send_to,
			} => gateway.set_typing(&user, typing, group_id, send_to).await,
		};

		// A handler failure is scoped to this connection and this event; the
		// connection itself stays up.
		if let Err(e) = result {
			metrics::counter!("linkup_server_event_errors_total").increment(1);
			debug!(conn_id, user = %user.id, kind = %e.kind, "event handler error");
			emit_error(&out_tx, &e).await;
		}
	}

	// Unconditional cleanup: runs regardless of how the event loop ended.
	// Removal is idempotent, so racing in-flight sends cannot corrupt state.
	gateway.rooms().leave_conn(conn_id).await;
	let went_offline = gateway.presence().remove_handle(user.id, conn_id).await;
	if went_offline {
		gateway.presence().broadcast(ServerFrame::OfflineUser { user_id: user.id }).await;
	}

	drop(handle);
	drop(out_tx);

	let _ = reader_task.await;
	let _ = writer_task.await;

	debug!(conn_id, user = %user.id, "connection closed");
	Ok(())
}

async fn wait_for_hello(in_rx: &mut mpsc::UnboundedReceiver<ClientFrame>) -> anyhow::Result<Hello> {
	while let Some(frame) = in_rx.recv().await {
		if let ClientFrame::Hello(hello) = frame {
			return Ok(hello);
		}
	}
	Err(anyhow!("connection closed before hello"))
}

async fn emit_error(out_tx: &mpsc::Sender<ServerFrame>, err: &ApiError) {
	let _ = out_tx
		.send(ServerFrame::CustomError {
			kind: err.kind,
			message: err.message.clone(),
		})
		.await;
}
