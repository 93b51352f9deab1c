//! The durable transfer record and the filter vocabulary for querying it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use soulgate_events::{TransferDirection, TransferOutcome, TransferPhase, state_pair_is_legal};
use uuid::Uuid;

/// Durable record of a single upload or download.
///
/// One row exists per accepted request; superseded rows stay behind with
/// `removed` set so history and limit accounting survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    /// Unique identifier assigned at creation.
    pub id: Uuid,
    /// Direction relative to this host.
    pub direction: TransferDirection,
    /// Remote peer on the other end.
    pub username: String,
    /// Filename as the peer addresses it; the wire identifier.
    pub remote_path: String,
    /// Physical path resolved at start time, when the file is local.
    pub local_path: Option<String>,
    /// Expected size in bytes.
    pub size: u64,
    /// Offset the remote asked the transfer to start from.
    pub start_offset: u64,
    /// Bytes moved so far.
    pub bytes_transferred: u64,
    /// Current lifecycle phase.
    pub phase: TransferPhase,
    /// Disposition; `None` until the phase is terminal.
    pub outcome: TransferOutcome,
    /// When the request was accepted.
    pub requested_at: DateTime<Utc>,
    /// When the transfer first entered the queued phase.
    pub enqueued_at: Option<DateTime<Utc>>,
    /// When bytes started moving.
    pub started_at: Option<DateTime<Utc>>,
    /// When the transfer reached a terminal phase.
    pub ended_at: Option<DateTime<Utc>>,
    /// Human-readable failure reason, when there is one.
    pub exception: Option<String>,
    /// Achieved speed in bytes per second, terminal only.
    pub average_speed: Option<f64>,
    /// Soft-delete marker.
    pub removed: bool,
}

impl Transfer {
    /// Construct a freshly accepted upload record, queued on this host.
    #[must_use]
    pub fn new_upload(username: impl Into<String>, remote_path: impl Into<String>, size: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            direction: TransferDirection::Upload,
            username: username.into(),
            remote_path: remote_path.into(),
            local_path: None,
            size,
            start_offset: 0,
            bytes_transferred: 0,
            phase: TransferPhase::Queued,
            outcome: TransferOutcome::None,
            requested_at: now,
            enqueued_at: Some(now),
            started_at: None,
            ended_at: None,
            exception: None,
            average_speed: None,
            removed: false,
        }
    }

    /// Apply a phase transition, stamping the phase-entry timestamps.
    ///
    /// # Errors
    ///
    /// Returns an error when the `(phase, outcome)` pair is illegal.
    pub fn transition(&mut self, phase: TransferPhase, outcome: TransferOutcome) -> Result<(), String> {
        if !state_pair_is_legal(phase, outcome) {
            return Err(format!(
                "illegal transfer state ({}, {})",
                phase.as_str(),
                outcome.as_str()
            ));
        }
        match phase {
            TransferPhase::Queued if self.enqueued_at.is_none() => {
                self.enqueued_at = Some(Utc::now());
            }
            TransferPhase::InProgress if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            TransferPhase::Completed if self.ended_at.is_none() => {
                self.ended_at = Some(Utc::now());
            }
            _ => {}
        }
        self.phase = phase;
        self.outcome = outcome;
        Ok(())
    }

    /// Move the record to a terminal state with the supplied disposition.
    pub fn complete(&mut self, outcome: TransferOutcome, exception: Option<String>) {
        self.phase = TransferPhase::Completed;
        self.outcome = if matches!(outcome, TransferOutcome::None) {
            TransferOutcome::Errored
        } else {
            outcome
        };
        self.ended_at = Some(Utc::now());
        self.exception = exception;
    }

    /// Whether the record is in a terminal phase.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Filter describing which transfer rows an operation should see.
///
/// The store translates the populated fields into SQL; unset fields do not
/// constrain the query. Removed rows are excluded unless requested, matching
/// the soft-delete contract.
#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    /// Restrict to one direction.
    pub direction: Option<TransferDirection>,
    /// Restrict to one remote user.
    pub username: Option<String>,
    /// Restrict to one remote filename.
    pub remote_path: Option<String>,
    /// Include soft-deleted rows.
    pub include_removed: bool,
    /// Restrict to terminal (`Some(true)`) or live (`Some(false)`) rows.
    pub terminal: Option<bool>,
    /// Restrict to rows whose outcome is one of these.
    pub outcomes: Option<Vec<TransferOutcome>>,
    /// Exclude rows whose outcome is one of these.
    pub exclude_outcomes: Option<Vec<TransferOutcome>>,
    /// Restrict to rows started at or after this instant.
    pub started_at_or_after: Option<DateTime<Utc>>,
    /// Restrict to rows that have (`Some(true)`) or have not (`Some(false)`)
    /// ended.
    pub ended: Option<bool>,
}

impl TransferFilter {
    /// Filter over uploads for one user.
    #[must_use]
    pub fn uploads_for(username: impl Into<String>) -> Self {
        Self {
            direction: Some(TransferDirection::Upload),
            username: Some(username.into()),
            ..Self::default()
        }
    }

    /// Restrict to rows that have not ended yet.
    #[must_use]
    pub fn not_ended(mut self) -> Self {
        self.ended = Some(false);
        self
    }

    /// Restrict to rows started within the trailing window ending now.
    #[must_use]
    pub fn started_since(mut self, cutoff: DateTime<Utc>) -> Self {
        self.started_at_or_after = Some(cutoff);
        self
    }

    /// Restrict to rows with one of the supplied outcomes.
    #[must_use]
    pub fn with_outcomes(mut self, outcomes: Vec<TransferOutcome>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    /// Exclude rows with any of the supplied outcomes.
    #[must_use]
    pub fn without_outcomes(mut self, outcomes: Vec<TransferOutcome>) -> Self {
        self.exclude_outcomes = Some(outcomes);
        self
    }

    /// Include soft-deleted rows; limit accounting needs superseded history.
    #[must_use]
    pub const fn including_removed(mut self) -> Self {
        self.include_removed = true;
        self
    }
}

/// Aggregate produced by [`crate::TransferStore::summarize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Number of matching rows.
    pub files: u64,
    /// Sum of their sizes in bytes.
    pub total_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_upload_is_queued_locally() {
        let transfer = Transfer::new_upload("alice", "@@music\\a.mp3", 4_096);
        assert_eq!(transfer.direction, TransferDirection::Upload);
        assert_eq!(transfer.phase, TransferPhase::Queued);
        assert_eq!(transfer.outcome, TransferOutcome::None);
        assert!(transfer.enqueued_at.is_some());
        assert!(transfer.started_at.is_none());
        assert!(transfer.ended_at.is_none());
        assert!(!transfer.removed);
    }

    #[test]
    fn transition_stamps_phase_timestamps_once() {
        let mut transfer = Transfer::new_upload("alice", "a.mp3", 1);
        let first_enqueued = transfer.enqueued_at;

        transfer
            .transition(TransferPhase::InProgress, TransferOutcome::None)
            .expect("legal transition");
        let started = transfer.started_at.expect("started stamp");

        transfer
            .transition(TransferPhase::Queued, TransferOutcome::None)
            .expect("legal transition");
        assert_eq!(transfer.enqueued_at, first_enqueued);

        transfer
            .transition(TransferPhase::InProgress, TransferOutcome::None)
            .expect("legal transition");
        assert_eq!(transfer.started_at, Some(started));
    }

    #[test]
    fn transition_rejects_illegal_pairs() {
        let mut transfer = Transfer::new_upload("alice", "a.mp3", 1);
        assert!(
            transfer
                .transition(TransferPhase::InProgress, TransferOutcome::Succeeded)
                .is_err()
        );
        assert!(
            transfer
                .transition(TransferPhase::Completed, TransferOutcome::None)
                .is_err()
        );
    }

    #[test]
    fn complete_enforces_terminality() {
        let mut transfer = Transfer::new_upload("alice", "a.mp3", 1);
        transfer.complete(TransferOutcome::Cancelled, Some("operator".to_string()));
        assert!(transfer.is_terminal());
        assert!(transfer.ended_at.is_some());
        assert_eq!(transfer.outcome, TransferOutcome::Cancelled);

        let mut sloppy = Transfer::new_upload("bob", "b.mp3", 1);
        sloppy.complete(TransferOutcome::None, None);
        assert_eq!(sloppy.outcome, TransferOutcome::Errored);
    }

    #[test]
    fn filter_builders_compose() {
        let cutoff = Utc::now();
        let filter = TransferFilter::uploads_for("alice")
            .started_since(cutoff)
            .without_outcomes(vec![TransferOutcome::Errored])
            .including_removed();
        assert_eq!(filter.direction, Some(TransferDirection::Upload));
        assert_eq!(filter.username.as_deref(), Some("alice"));
        assert_eq!(filter.started_at_or_after, Some(cutoff));
        assert!(filter.include_removed);
        assert!(filter.outcomes.is_none());
    }
}
