#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use linkup_domain::{RoomId, UserId};
use linkup_protocol::ServerFrame;
use tokio::sync::Mutex;
use tracing::debug;

use crate::server::presence::ConnectionHandle;

/// Configuration for `RoomHub`.
#[derive(Debug, Clone, Default)]
pub struct RoomHubConfig {
	pub debug_logs: bool,
}

/// Per-room hub that fans group events out to subscribed connections.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<RoomId, Vec<Subscriber>>,
}

#[derive(Debug)]
struct Subscriber {
	user: UserId,
	handle: ConnectionHandle,
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe a connection to a room. Re-joining from the same connection
	/// replaces the previous subscription.
	pub async fn join(&self, room: RoomId, user: UserId, handle: ConnectionHandle) {
		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(room.clone()).or_default();

		entry.retain(|s| s.handle.conn_id() != handle.conn_id());
		entry.push(Subscriber { user, handle });

		if self.cfg.debug_logs {
			debug!(room = %room, subs = entry.len(), "room hub: subscribed");
		}
	}

	/// Drop every subscription held by one connection. Idempotent; part of
	/// disconnect cleanup.
	pub async fn leave_conn(&self, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		for entry in inner.rooms.values_mut() {
			entry.retain(|s| s.handle.conn_id() != conn_id);
		}
		inner.rooms.retain(|_, entry| !entry.is_empty());
	}

	/// Fan a frame out to every subscriber of a room.
	pub async fn publish(&self, room: &RoomId, frame: ServerFrame) -> usize {
		self.publish_filtered(room, None, frame).await
	}

	/// Fan a frame out to every subscriber except the given subject's
	/// connections. Multi-tab senders see their own message exactly once,
	/// through the explicit ack rather than the room broadcast.
	pub async fn publish_except_user(&self, room: &RoomId, except: UserId, frame: ServerFrame) -> usize {
		self.publish_filtered(room, Some(except), frame).await
	}

	async fn publish_filtered(&self, room: &RoomId, except: Option<UserId>, frame: ServerFrame) -> usize {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(room) else {
			return 0;
		};

		entry.retain(|s| !s.handle.is_closed());

		let mut delivered = 0usize;
		let mut dropped = 0usize;
		for sub in entry.iter() {
			if Some(sub.user) == except {
				continue;
			}
			if sub.handle.try_send(frame.clone()) {
				delivered += 1;
			} else {
				dropped += 1;
			}
		}

		if self.cfg.debug_logs && dropped > 0 {
			debug!(room = %room, dropped, "room hub: dropped frames for closed or saturated subscribers");
		}

		if entry.is_empty() {
			inner.rooms.remove(room);
		}

		delivered
	}

	/// Snapshot of live subscriber counts (tests and diagnostics).
	pub async fn member_count(&self, room: &RoomId) -> usize {
		let inner = self.inner.lock().await;
		inner.rooms.get(room).map(|entry| entry.len()).unwrap_or(0)
	}
}
