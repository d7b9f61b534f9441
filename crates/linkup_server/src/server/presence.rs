#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use linkup_domain::UserId;
use linkup_protocol::ServerFrame;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// One live bidirectional connection belonging to a subject.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	conn_id: u64,
	sender: mpsc::Sender<ServerFrame>,
}

impl ConnectionHandle {
	pub fn new(conn_id: u64, sender: mpsc::Sender<ServerFrame>) -> Self {
		Self { conn_id, sender }
	}

	pub fn conn_id(&self) -> u64 {
		self.conn_id
	}

	/// Best-effort delivery. A full queue or a closed peer drops the frame.
	pub fn try_send(&self, frame: ServerFrame) -> bool {
		self.sender.try_send(frame).is_ok()
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.sender.is_closed()
	}
}

/// Configuration for `PresenceRegistry`.
#[derive(Debug, Clone, Default)]
pub struct PresenceConfig {
	pub debug_logs: bool,
}

/// Registry of live connections per subject. A subject appears in the map iff
/// it has at least one live handle; the last removal deletes the entry. The
/// registry is an explicitly owned instance handed around by reference, never
/// a process-wide singleton.
#[derive(Debug, Clone)]
pub struct PresenceRegistry {
	inner: Arc<Mutex<Inner>>,
	cfg: PresenceConfig,
}

#[derive(Debug, Default)]
struct Inner {
	handles_by_user: HashMap<UserId, Vec<ConnectionHandle>>,
}

impl PresenceRegistry {
	pub fn new(cfg: PresenceConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Record a handle for a subject. Returns true when this is the subject's
	/// first live handle (the subject just came online).
	pub async fn add_handle(&self, user: UserId, handle: ConnectionHandle) -> bool {
		let mut inner = self.inner.lock().await;
		let entry = inner.handles_by_user.entry(user).or_default();
		entry.retain(|h| !h.is_closed());

		let came_online = entry.is_empty();
		entry.retain(|h| h.conn_id != handle.conn_id());
		entry.push(handle);

		if self.cfg.debug_logs {
			debug!(user = %user, handles = entry.len(), "presence: handle added");
		}

		came_online
	}

	/// Remove one handle. Returns true when the subject's last handle went
	/// away (the subject just went offline). Removing an absent handle is a
	/// no-op, not an error.
	pub async fn remove_handle(&self, user: UserId, conn_id: u64) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.handles_by_user.get_mut(&user) else {
			return false;
		};

		let before = entry.len();
		entry.retain(|h| h.conn_id != conn_id && !h.is_closed());

		if entry.is_empty() {
			inner.handles_by_user.remove(&user);
			if self.cfg.debug_logs {
				debug!(user = %user, "presence: subject offline");
			}
			// Only report offline if this call actually removed something;
			// a repeated removal must not produce a second offline event.
			return before > 0;
		}

		false
	}

	/// Deliver a frame to every live handle of one subject. Handles present
	/// at lookup time are the delivery set; a send racing a disconnect is
	/// silently dropped.
	pub async fn send_to_user(&self, user: UserId, frame: ServerFrame) -> usize {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.handles_by_user.get_mut(&user) else {
			return 0;
		};

		entry.retain(|h| !h.is_closed());

		let mut delivered = 0usize;
		for handle in entry.iter() {
			if handle.try_send(frame.clone()) {
				delivered += 1;
			}
		}

		if entry.is_empty() {
			inner.handles_by_user.remove(&user);
		}

		delivered
	}

	/// Deliver a frame to every live handle of every subject (presence
	/// broadcasts).
	pub async fn broadcast(&self, frame: ServerFrame) -> usize {
		let mut inner = self.inner.lock().await;

		let mut delivered = 0usize;
		for entry in inner.handles_by_user.values_mut() {
			entry.retain(|h| !h.is_closed());
			for handle in entry.iter() {
				if handle.try_send(frame.clone()) {
					delivered += 1;
				}
			}
		}

		inner.handles_by_user.retain(|_, entry| !entry.is_empty());

		delivered
	}

	/// Snapshot of one subject's live handles. An absent subject reads as an
	/// empty set, never an error.
	pub async fn handles_for(&self, user: UserId) -> Vec<ConnectionHandle> {
		let inner = self.inner.lock().await;
		inner
			.handles_by_user
			.get(&user)
			.map(|entry| entry.iter().filter(|h| !h.is_closed()).cloned().collect())
			.unwrap_or_default()
	}

	/// Number of live handles for one subject.
	pub async fn handle_count(&self, user: UserId) -> usize {
		self.handles_for(user).await.len()
	}

	pub async fn is_online(&self, user: UserId) -> bool {
		self.handle_count(user).await > 0
	}
}
