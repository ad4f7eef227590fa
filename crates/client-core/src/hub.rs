use tokio::sync::broadcast;

use crate::notice::Notice;

/// Broadcast notice stream handed to observers.
pub type NoticeStream = broadcast::Receiver<Notice>;

/// Fan-out hub for client- and room-level notices.
///
/// Observers subscribe and receive every notice emitted after the
/// subscription; payloads are snapshots, safe to hold across awaits.
#[derive(Clone, Debug)]
pub struct NoticeHub {
    tx: broadcast::Sender<Notice>,
}

impl NoticeHub {
    /// Create a hub with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all notices emitted from now on.
    pub fn subscribe(&self) -> NoticeStream {
        self.tx.subscribe()
    }

    /// Emit a notice to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by
    /// `broadcast`, and a hub with no subscribers drops the notice.
    pub fn emit(&self, notice: Notice) {
        let _ = self.tx.send(notice);
    }
}

impl Default for NoticeHub {
    fn default() -> Self {
        Self::new(256)
    }
}
