#![forbid(unsafe_code)]

use tokio::sync::mpsc;
use tracing::{info, warn};

/// An outbound side effect the core wants performed. The core's contract is
/// "emits an intent"; delivery itself belongs to an external adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundIntent {
	/// A one-time login code to deliver out of band.
	LoginCode {
		to: String,
		code: String,
	},
}

impl OutboundIntent {
	pub fn kind(&self) -> &'static str {
		match self {
			OutboundIntent::LoginCode { .. } => "login_code",
		}
	}
}

/// Publishing half of the outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
	tx: mpsc::UnboundedSender<OutboundIntent>,
}

impl OutboundQueue {
	pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundIntent>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}

	/// Publish an intent. A closed worker loses the intent; that is logged,
	/// not an error on the publishing path.
	pub fn publish(&self, intent: OutboundIntent) {
		metrics::counter!("linkup_server_outbound_intents_total").increment(1);
		if self.tx.send(intent).is_err() {
			warn!("outbound queue closed; intent dropped");
		}
	}
}

/// Drain the queue. The default worker only records intents; a deployment
/// wires a real delivery adapter in its place.
pub fn spawn_outbox_worker(mut rx: mpsc::UnboundedReceiver<OutboundIntent>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(intent) = rx.recv().await {
			match &intent {
				OutboundIntent::LoginCode { to, .. } => {
					info!(kind = intent.kind(), to = %to, "outbound intent emitted");
				}
			}
		}
	})
}
