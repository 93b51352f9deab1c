#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]
#![allow(unexpected_cfgs)]

//! Core event bus for the Soulgate daemon.
//!
//! The bus provides a typed event enum, sequential identifiers, and support
//! for replaying recent events to subscribers that reconnect with a last-seen
//! id. Internally it uses `tokio::broadcast` with a bounded buffer; when the
//! channel overflows the oldest events are dropped.
//!
//! This crate also hosts the transfer state vocabulary shared by the
//! persistence layer and the protocol contracts, so neither has to depend on
//! the other.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender;
use tokio_stream::wrappers::BroadcastStream;
use tracing::error;
use uuid::Uuid;

/// Stream of event envelopes handed to subscribers.
///
/// Items are `Result` values: a subscriber that falls behind the broadcast
/// buffer observes a lagged error and continues with the next event.
pub type EventStream = BroadcastStream<EventEnvelope>;

/// Identifier assigned to each event emitted by the daemon.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Direction of a transfer relative to this host.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Bytes leave this host towards a remote peer.
    Upload,
    /// Bytes arrive on this host from a remote peer.
    Download,
}

impl TransferDirection {
    /// Render the direction as its lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl FromStr for TransferDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            other => Err(format!("invalid transfer direction '{other}'")),
        }
    }
}

/// Lifecycle phase of a transfer.
///
/// A transfer moves strictly forward through these phases; `Completed` is
/// terminal and the only phase that carries a non-`None` [`TransferOutcome`].
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    /// The request was accepted but not yet queued.
    Requested,
    /// Waiting for an upload slot on this host.
    Queued,
    /// Handshaking with the remote peer.
    Initializing,
    /// Bytes are moving.
    InProgress,
    /// Finished, one way or another; see the outcome.
    Completed,
}

impl TransferPhase {
    /// Render the phase as its lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Queued => "queued",
            Self::Initializing => "initializing",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    /// Whether this phase is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl FromStr for TransferPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "queued" => Ok(Self::Queued),
            "initializing" => Ok(Self::Initializing),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(format!("invalid transfer phase '{other}'")),
        }
    }
}

/// Disposition of a completed transfer.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    /// Not finished yet; the only outcome legal outside `Completed`.
    None,
    /// All bytes delivered.
    Succeeded,
    /// Failed with an error captured on the record.
    Errored,
    /// Cancelled by the operator or the remote peer.
    Cancelled,
    /// The protocol library gave up waiting.
    TimedOut,
    /// Refused at admission time.
    Rejected,
    /// Torn down without a cleaner disposition (e.g. unclean shutdown).
    Aborted,
}

impl TransferOutcome {
    /// Render the outcome as its lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Succeeded => "succeeded",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Rejected => "rejected",
            Self::Aborted => "aborted",
        }
    }
}

impl FromStr for TransferOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "succeeded" => Ok(Self::Succeeded),
            "errored" => Ok(Self::Errored),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            "rejected" => Ok(Self::Rejected),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("invalid transfer outcome '{other}'")),
        }
    }
}

/// Whether a `(phase, outcome)` pair is legal.
///
/// Exactly the terminal phase carries a real outcome; every earlier phase
/// carries `None`.
#[must_use]
pub const fn state_pair_is_legal(phase: TransferPhase, outcome: TransferOutcome) -> bool {
    match phase {
        TransferPhase::Completed => !matches!(outcome, TransferOutcome::None),
        _ => matches!(outcome, TransferOutcome::None),
    }
}

/// Typed domain events surfaced across the daemon.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// An upload request passed admission and a record was created.
    UploadEnqueued {
        /// Identifier of the freshly created transfer record.
        transfer_id: Uuid,
        /// Remote peer that requested the file.
        username: String,
        /// Filename as the peer sees it.
        filename: String,
    },
    /// A transfer moved to a new phase.
    TransferStateChanged {
        /// Identifier of the transfer.
        transfer_id: Uuid,
        /// Phase after the transition.
        phase: TransferPhase,
        /// Outcome after the transition (`None` until terminal).
        outcome: TransferOutcome,
    },
    /// Periodic progress update while a transfer is moving bytes.
    TransferProgress {
        /// Identifier of the transfer.
        transfer_id: Uuid,
        /// Bytes moved so far.
        bytes_transferred: u64,
        /// Total expected bytes.
        size: u64,
    },
    /// An upload reached a terminal state.
    UploadComplete {
        /// When the upload ended.
        timestamp: DateTime<Utc>,
        /// Resolved path on this host, when the file was local.
        local_path: Option<String>,
        /// Path as the remote peer addressed it.
        remote_path: String,
        /// Identifier of the transfer record.
        transfer_id: Uuid,
    },
    /// Configuration update was applied.
    SettingsChanged {
        /// Description of the applied configuration change.
        description: String,
    },
    /// A share rescan was requested.
    ShareScanRequested {
        /// Why the rescan was requested.
        reason: String,
    },
    /// A user was added to the watched set.
    UserWatched {
        /// The watched username.
        username: String,
    },
}

impl Event {
    /// Machine-friendly discriminator for stream consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UploadEnqueued { .. } => "upload_enqueued",
            Self::TransferStateChanged { .. } => "transfer_state_changed",
            Self::TransferProgress { .. } => "transfer_progress",
            Self::UploadComplete { .. } => "upload_complete",
            Self::SettingsChanged { .. } => "settings_changed",
            Self::ShareScanRequested { .. } => "share_scan_requested",
            Self::UserWatched { .. } => "user_watched",
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    buffer: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// The broadcast channel uses the same capacity as the in-memory replay
    /// buffer, ensuring dropped events impact both structures consistently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default in-memory buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event to the bus, assigning it a sequential identifier.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut buffer = self.lock_buffer();
            if buffer.len() == self.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying any buffered events newer than
    /// `since_id` ahead of live traffic.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let receiver = self.sender.subscribe();
        if let Some(since) = since_id {
            self.replay(since);
        }
        BroadcastStream::new(receiver)
    }

    /// Push buffered events back through the channel for the subscriber that
    /// just attached. Replayed envelopes keep their original ids.
    fn replay(&self, since_id: EventId) {
        let backlog: Vec<EventEnvelope> = {
            let buffer = self.lock_buffer();
            buffer
                .iter()
                .filter(|item| item.id > since_id)
                .cloned()
                .collect()
        };
        for envelope in backlog {
            if self.sender.send(envelope).is_err() {
                break;
            }
        }
    }

    /// Return a snapshot of buffered events newer than the supplied identifier.
    #[must_use]
    pub fn backlog_since(&self, since_id: EventId) -> Vec<EventEnvelope> {
        let buffer = self.lock_buffer();
        buffer
            .iter()
            .filter(|item| item.id > since_id)
            .cloned()
            .collect()
    }

    /// Returns the last assigned identifier, if any events have been published.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let buffer = self.lock_buffer();
        buffer.back().map(|event| event.id)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("event buffer mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn state_pair_legality() {
        use TransferOutcome as O;
        use TransferPhase as P;

        for phase in [P::Requested, P::Queued, P::Initializing, P::InProgress] {
            assert!(state_pair_is_legal(phase, O::None));
            assert!(!state_pair_is_legal(phase, O::Succeeded));
            assert!(!state_pair_is_legal(phase, O::Errored));
        }

        assert!(!state_pair_is_legal(P::Completed, O::None));
        for outcome in [
            O::Succeeded,
            O::Errored,
            O::Cancelled,
            O::TimedOut,
            O::Rejected,
            O::Aborted,
        ] {
            assert!(state_pair_is_legal(P::Completed, outcome));
        }
    }

    #[test]
    fn state_labels_round_trip() {
        for phase in [
            TransferPhase::Requested,
            TransferPhase::Queued,
            TransferPhase::Initializing,
            TransferPhase::InProgress,
            TransferPhase::Completed,
        ] {
            assert_eq!(phase.as_str().parse::<TransferPhase>(), Ok(phase));
        }
        for outcome in [
            TransferOutcome::None,
            TransferOutcome::Succeeded,
            TransferOutcome::Errored,
            TransferOutcome::Cancelled,
            TransferOutcome::TimedOut,
            TransferOutcome::Rejected,
            TransferOutcome::Aborted,
        ] {
            assert_eq!(outcome.as_str().parse::<TransferOutcome>(), Ok(outcome));
        }
        assert!("sideways".parse::<TransferPhase>().is_err());
        assert!("lost".parse::<TransferOutcome>().is_err());
    }

    fn sample_progress_event(id: usize) -> Event {
        Event::TransferProgress {
            transfer_id: Uuid::from_u128(id as u128 + 1),
            bytes_transferred: (id * 1_000) as u64,
            size: 500_000,
        }
    }

    #[test]
    fn event_kinds_cover_all_variants() {
        let transfer_id = Uuid::new_v4();
        let events = [
            Event::UploadEnqueued {
                transfer_id,
                username: "alice".to_string(),
                filename: "@@music\\a.mp3".to_string(),
            },
            Event::TransferStateChanged {
                transfer_id,
                phase: TransferPhase::Queued,
                outcome: TransferOutcome::None,
            },
            Event::TransferProgress {
                transfer_id,
                bytes_transferred: 10,
                size: 100,
            },
            Event::UploadComplete {
                timestamp: Utc::now(),
                local_path: Some("/srv/share/a.mp3".to_string()),
                remote_path: "@@music\\a.mp3".to_string(),
                transfer_id,
            },
            Event::SettingsChanged {
                description: "groups".to_string(),
            },
            Event::ShareScanRequested {
                reason: "size mismatch".to_string(),
            },
            Event::UserWatched {
                username: "alice".to_string(),
            },
        ];

        let expected = [
            "upload_enqueued",
            "transfer_state_changed",
            "transfer_progress",
            "upload_complete",
            "settings_changed",
            "share_scan_requested",
            "user_watched",
        ];
        for (event, kind) in events.iter().zip(expected) {
            assert_eq!(event.kind(), kind);
        }
    }

    #[tokio::test]
    async fn sequential_ids_and_replay() {
        let bus = EventBus::with_capacity(16);

        let mut last_id = 0;
        for i in 0..5 {
            last_id = bus.publish(sample_progress_event(i));
        }
        assert_eq!(last_id, 5);

        let mut stream = bus.subscribe(Some(2));
        let mut received = Vec::new();
        for _ in 0..3 {
            match stream.next().await {
                Some(Ok(event)) => received.push(event),
                Some(Err(_)) => {}
                None => break,
            }
        }

        assert_eq!(received.len(), 3);
        assert_eq!(received.first().map(|event| event.id), Some(3));
        assert_eq!(received.last().map(|event| event.id), Some(5));
    }

    #[tokio::test]
    async fn last_event_id_reflects_recent_publish() {
        let bus = EventBus::with_capacity(2);
        assert!(bus.last_event_id().is_none(), "no events published yet");
        let published = bus.publish(sample_progress_event(0));
        assert_eq!(bus.last_event_id(), Some(published));
    }

    #[tokio::test]
    async fn backlog_since_filters_older_events() {
        let bus = EventBus::with_capacity(8);
        for i in 0..4 {
            let _ = bus.publish(sample_progress_event(i));
        }
        let backlog = bus.backlog_since(2);
        assert_eq!(backlog.len(), 2);
        assert!(backlog.iter().all(|event| event.id > 2));
    }

    #[tokio::test]
    async fn stream_returns_none_after_sender_dropped() {
        let mut stream = {
            let bus = EventBus::with_capacity(1);
            let stream = bus.subscribe(None);
            drop(bus);
            stream
        };
        assert!(
            stream.next().await.is_none(),
            "closing the sender should end the stream"
        );
    }
}
