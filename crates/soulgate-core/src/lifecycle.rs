//! The per-upload lifecycle task.
//!
//! One task owns each accepted upload from queue registration to terminal
//! persistence. The protocol library's progress and state callbacks arrive
//! as messages on a bounded channel consumed by the same task, so delivery
//! order is preserved without any per-transfer locking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use soulgate_events::{Event, EventBus, TransferOutcome};
use soulgate_proto::{
    CompletedTransfer, FileHost, InputStream, InputStreamFactory, ProtoError, ProtoResult,
    RelayService, ResolvedFile, SlotHooks, SoulClient, TransferGovernor, UploadEvent, UploadHooks,
    UploadRequest,
};
use soulgate_telemetry::Metrics;
use soulgate_transfers::{Transfer, TransferStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::CoreContext;
use crate::queue::UploadQueue;
use crate::registry::CancellationRegistry;

/// Progress callbacks persist at most this often; the terminal write always
/// lands.
const PROGRESS_PERSIST_INTERVAL: Duration = Duration::from_millis(250);

/// Callback channel depth; the library parks if the lifecycle task falls
/// this far behind.
const UPLOAD_EVENT_CAPACITY: usize = 64;

/// Dependencies shared by every lifecycle task.
pub struct UploadRunnerDeps {
    /// Process-wide context (options snapshot, shutdown flag).
    pub context: Arc<CoreContext>,
    /// Durable record store.
    pub store: TransferStore,
    /// Protocol library operations.
    pub client: Arc<dyn SoulClient>,
    /// The slot scheduler.
    pub queue: Arc<UploadQueue>,
    /// Pacing source handed to the library.
    pub governor: Arc<dyn TransferGovernor>,
    /// Stream source for relay-hosted files, when configured.
    pub relay: Option<Arc<dyn RelayService>>,
    /// Cancellation handles for in-flight tasks.
    pub registry: Arc<CancellationRegistry>,
    /// Event bus for higher layers.
    pub events: EventBus,
    /// Shared metrics handle.
    pub metrics: Metrics,
}

/// Spawns and drives one task per accepted upload.
pub struct UploadRunner {
    deps: UploadRunnerDeps,
}

impl UploadRunner {
    /// Construct a runner over its shared dependencies.
    #[must_use]
    pub const fn new(deps: UploadRunnerDeps) -> Self {
        Self { deps }
    }

    /// Launch the lifecycle task for a freshly persisted upload record.
    pub fn spawn(self: &Arc<Self>, transfer: Transfer, resolved: ResolvedFile) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.run(transfer, resolved).await;
        })
    }

    async fn run(&self, mut transfer: Transfer, resolved: ResolvedFile) {
        let deps = &self.deps;
        let token = deps.registry.register(transfer.id);
        let username = transfer.username.clone();
        let filename = transfer.remote_path.clone();

        deps.queue.enqueue(&username, &filename);
        self.update_gauges();

        let Some(stream_factory) = self.stream_factory_for(&resolved, &filename) else {
            self.finish(
                &mut transfer,
                TransferOutcome::Errored,
                Some("relay host unavailable".to_string()),
            )
            .await;
            let _ = deps.queue.complete(&username, &filename);
            deps.registry.remove(transfer.id);
            self.update_gauges();
            return;
        };

        let (event_sender, mut event_receiver) = mpsc::channel(UPLOAD_EVENT_CAPACITY);
        let hooks = UploadHooks {
            stream_factory,
            governor: deps.governor.clone(),
            slots: Arc::new(QueueSlots {
                queue: deps.queue.clone(),
                username: username.clone(),
                filename: filename.clone(),
            }),
            events: event_sender,
        };
        let request = UploadRequest {
            username: username.clone(),
            remote_path: filename.clone(),
            size: transfer.size,
        };

        let upload = deps.client.upload(request, hooks, token.clone());
        tokio::pin!(upload);

        let mut last_progress_write: Option<tokio::time::Instant> = None;
        let mut events_open = true;
        let result = loop {
            tokio::select! {
                event = event_receiver.recv(), if events_open => match event {
                    Some(event) => {
                        self.handle_upload_event(&mut transfer, event, &mut last_progress_write)
                            .await;
                    }
                    None => events_open = false,
                },
                result = &mut upload => break result,
            }
        };

        // Apply callbacks that were already queued when the upload returned.
        while let Ok(event) = event_receiver.try_recv() {
            self.handle_upload_event(&mut transfer, event, &mut last_progress_write)
                .await;
        }

        match result {
            Ok(report) => self.finish_from_report(&mut transfer, report).await,
            Err(ProtoError::Cancelled) => {
                self.finish(
                    &mut transfer,
                    TransferOutcome::Cancelled,
                    Some("Transfer cancelled".to_string()),
                )
                .await;
            }
            Err(ProtoError::TimedOut) => {
                self.finish(
                    &mut transfer,
                    TransferOutcome::TimedOut,
                    Some("Transfer timed out".to_string()),
                )
                .await;
            }
            Err(error) => {
                self.finish(&mut transfer, TransferOutcome::Errored, Some(error.to_string()))
                    .await;
            }
        }

        // The library's slot-released hook normally returned the slot; this
        // is the backstop for early failures.
        let _ = deps.queue.complete(&username, &filename);
        deps.registry.remove(transfer.id);
        if let (FileHost::Relay { .. }, Some(relay)) = (&resolved.host, &deps.relay)
            && let Err(error) = relay.close_stream(&filename).await
        {
            debug!(%error, filename, "failed to close relay stream");
        }
        self.update_gauges();
    }

    fn stream_factory_for(
        &self,
        resolved: &ResolvedFile,
        remote_path: &str,
    ) -> Option<Arc<dyn InputStreamFactory>> {
        match &resolved.host {
            FileHost::Local => Some(Arc::new(LocalFileSource {
                path: resolved.local_path.clone(),
            })),
            FileHost::Relay { .. } => self.deps.relay.as_ref().map(|relay| {
                Arc::new(RelaySource {
                    relay: relay.clone(),
                    remote_path: remote_path.to_string(),
                }) as Arc<dyn InputStreamFactory>
            }),
        }
    }

    async fn handle_upload_event(
        &self,
        transfer: &mut Transfer,
        event: UploadEvent,
        last_progress_write: &mut Option<tokio::time::Instant>,
    ) {
        match event {
            UploadEvent::Progress { bytes_transferred } => {
                transfer.bytes_transferred = bytes_transferred;
                let now = tokio::time::Instant::now();
                let due = last_progress_write
                    .is_none_or(|at| now.duration_since(at) >= PROGRESS_PERSIST_INTERVAL);
                if due {
                    *last_progress_write = Some(now);
                    self.persist(transfer).await;
                }
                self.deps.events.publish(Event::TransferProgress {
                    transfer_id: transfer.id,
                    bytes_transferred,
                    size: transfer.size,
                });
            }
            UploadEvent::StateChanged { phase, outcome } => {
                if let Err(error) = transfer.transition(phase, outcome) {
                    warn!(transfer_id = %transfer.id, error, "ignoring illegal state callback");
                    return;
                }
                self.persist(transfer).await;
                self.deps.events.publish(Event::TransferStateChanged {
                    transfer_id: transfer.id,
                    phase,
                    outcome,
                });
                self.update_gauges();
            }
        }
    }

    /// Persist the record unless shutdown has begun; the next startup's
    /// cleanup re-dispositions anything dropped here.
    async fn persist(&self, transfer: &Transfer) {
        if self.deps.context.is_shutting_down() {
            return;
        }
        if let Err(error) = self.deps.store.update(transfer).await {
            warn!(transfer_id = %transfer.id, %error, "failed to persist transfer update");
        }
    }

    async fn finish_from_report(&self, transfer: &mut Transfer, report: CompletedTransfer) {
        transfer.bytes_transferred = report.bytes_transferred;
        transfer.start_offset = report.start_offset;
        transfer.average_speed = Some(report.average_speed);
        let outcome = if matches!(report.outcome, TransferOutcome::None) {
            TransferOutcome::Succeeded
        } else {
            report.outcome
        };
        let exception = if matches!(outcome, TransferOutcome::Succeeded) {
            None
        } else {
            Some(format!("Transfer ended {}", outcome.as_str()))
        };
        self.finish(transfer, outcome, exception).await;

        if matches!(outcome, TransferOutcome::Succeeded)
            && let Err(error) = self
                .deps
                .client
                .send_upload_speed(speed_as_u64(report.average_speed))
                .await
        {
            debug!(%error, "failed to report upload speed");
        }
    }

    async fn finish(
        &self,
        transfer: &mut Transfer,
        outcome: TransferOutcome,
        exception: Option<String>,
    ) {
        transfer.complete(outcome, exception);
        self.persist(transfer).await;
        self.deps.metrics.record_upload_completed(outcome.as_str());
        self.deps.events.publish(Event::UploadComplete {
            timestamp: transfer.ended_at.unwrap_or_else(Utc::now),
            local_path: transfer.local_path.clone(),
            remote_path: transfer.remote_path.clone(),
            transfer_id: transfer.id,
        });
    }

    fn update_gauges(&self) {
        let depth = i64::try_from(self.deps.queue.depth()).unwrap_or(i64::MAX);
        let active = i64::try_from(self.deps.queue.active_count()).unwrap_or(i64::MAX);
        self.deps.metrics.set_queue_depth(depth);
        self.deps.metrics.set_active_uploads(active);
    }
}

/// Slot hooks bridging the protocol library to the queue.
struct QueueSlots {
    queue: Arc<UploadQueue>,
    username: String,
    filename: String,
}

#[async_trait]
impl SlotHooks for QueueSlots {
    async fn await_slot(&self) -> ProtoResult<()> {
        let receiver = self
            .queue
            .await_start(&self.username, &self.filename)
            .map_err(ProtoError::from)?;
        receiver.await.map_err(|_| ProtoError::Cancelled)
    }

    fn slot_released(&self) {
        let _ = self.queue.complete(&self.username, &self.filename);
    }
}

/// Opens a local shared file at the requested offset.
struct LocalFileSource {
    path: String,
}

#[async_trait]
impl InputStreamFactory for LocalFileSource {
    async fn open(&self, start_offset: u64) -> ProtoResult<InputStream> {
        use tokio::io::AsyncSeekExt;

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|error| ProtoError::failed("open_local_file", error))?;
        file.seek(std::io::SeekFrom::Start(start_offset))
            .await
            .map_err(|error| ProtoError::failed("seek_local_file", error))?;
        Ok(Box::new(file))
    }
}

/// Opens a stream for a relay-hosted file.
struct RelaySource {
    relay: Arc<dyn RelayService>,
    remote_path: String,
}

#[async_trait]
impl InputStreamFactory for RelaySource {
    async fn open(&self, start_offset: u64) -> ProtoResult<InputStream> {
        self.relay.open_stream(&self.remote_path, start_offset).await
    }
}

fn speed_as_u64(speed: f64) -> u64 {
    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "speeds are non-negative and far below 2^53"
    )]
    {
        speed.max(0.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_conversion_clamps_negatives() {
        assert_eq!(speed_as_u64(-1.5), 0);
        assert_eq!(speed_as_u64(0.0), 0);
        assert_eq!(speed_as_u64(1_536.9), 1_536);
    }
}
