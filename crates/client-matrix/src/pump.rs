use std::time::Duration;

use client_core::{ClientError, EventEnvelope, PollBackoff};
use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::MatrixClient;

/// Progress of the one-shot initial synchronisation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SyncState {
    Pending,
    Ready,
    Failed(ClientError),
}

/// Running pump owned by the client; dropped on `stop()`.
pub(crate) struct PumpTask {
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<()>,
    pub(crate) synced: watch::Receiver<SyncState>,
}

/// Handle returned by `start()`; completes once the initial snapshot has
/// been fully folded. Clones all observe the same underlying sync.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    rx: watch::Receiver<SyncState>,
}

impl SyncHandle {
    pub(crate) fn new(rx: watch::Receiver<SyncState>) -> Self {
        Self { rx }
    }

    /// Whether the initial sync already completed successfully.
    pub fn is_synced(&self) -> bool {
        *self.rx.borrow() == SyncState::Ready
    }

    /// Wait for the initial sync to complete.
    pub async fn synced(mut self) -> Result<(), ClientError> {
        loop {
            let state = self.rx.borrow_and_update().clone();
            match state {
                SyncState::Ready => return Ok(()),
                SyncState::Failed(err) => return Err(err),
                SyncState::Pending => {
                    self.rx.changed().await.map_err(|_| {
                        ClientError::transport("event pump stopped before the initial sync completed")
                    })?;
                }
            }
        }
    }
}

/// Drives `initialSync` once, then long-polls `/events` until cancelled.
///
/// Transport failures never surface to observers: they are logged and
/// retried with backoff, with the stream token left untouched.
pub(crate) struct Pump {
    pub(crate) client: MatrixClient,
    pub(crate) cancel: CancellationToken,
    pub(crate) synced_tx: watch::Sender<SyncState>,
    pub(crate) backoff: PollBackoff,
    pub(crate) event_timeout_ms: u64,
    pub(crate) poll_margin_ms: u64,
}

impl Pump {
    pub(crate) async fn run(mut self) {
        let init = tokio::select! {
            _ = self.cancel.cancelled() => return,
            init = self.client.run_initial_sync() => init,
        };
        let mut from = match init {
            Ok(end) => {
                self.client.note_sync_ready();
                let _ = self.synced_tx.send(SyncState::Ready);
                end
            }
            Err(err) => {
                warn!(error = %err, "initial sync failed");
                self.client.note_sync_failed();
                // Clear the pump slot before the failure becomes observable
                // so a retrying `start()` never sees a stale task.
                self.client.clear_pump().await;
                let _ = self.synced_tx.send(SyncState::Failed(err));
                return;
            }
        };

        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = self.poll_once(&from) => outcome,
            };

            match outcome {
                Ok(next) => {
                    if self.backoff.succeeded() {
                        self.client.note_poll_recovered();
                    }
                    from = next;
                }
                Err(err) => {
                    warn!(error = %err, "event poll failed; backing off");
                    if self.backoff.attempt() == 0 {
                        self.client.note_poll_failed();
                    }
                    if matches!(err, ClientError::Protocol(_)) {
                        self.client.emit_error(err, "event stream");
                    }
                    let delay = self.backoff.next_delay(None);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!("event pump stopped");
    }

    /// One long-poll: dispatch every event in array order, then return the
    /// next stream token. Bounded locally slightly beyond the server's own
    /// timeout so a hung poll cannot stall the pump.
    async fn poll_once(&self, from: &str) -> Result<String, ClientError> {
        let query = [
            ("from".to_owned(), from.to_owned()),
            ("timeout".to_owned(), self.event_timeout_ms.to_string()),
        ];
        let bound = Duration::from_millis(self.event_timeout_ms + self.poll_margin_ms);
        let response = time::timeout(
            bound,
            self.client.transport().get_json("/events", &query),
        )
        .await
        .map_err(|_| ClientError::transport("long-poll exceeded the local time bound"))??
        .ok_or_else(|| ClientError::protocol("empty events response"))?;

        let chunk = response
            .get("chunk")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ClientError::protocol("events response missing 'chunk'"))?;
        let end = response
            .get("end")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ClientError::protocol("events response missing 'end'"))?;

        for raw in chunk {
            match EventEnvelope::from_value(raw) {
                Ok(envelope) => self.client.apply_event(&envelope),
                Err(err) => warn!(error = %err, "stream event dropped"),
            }
        }
        Ok(end)
    }
}
