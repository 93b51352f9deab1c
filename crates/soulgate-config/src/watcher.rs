//! Serialised application of option snapshots to a running process.

use std::sync::{Arc, Mutex, RwLock};

use soulgate_events::{Event, EventBus};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::diff::{OptionsDiff, diff};
use crate::error::ConfigResult;
use crate::model::{Options, validate_options};

/// Flags accumulated across applied changes until the operator acts on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingFlags {
    /// A change was applied that only fully takes effect after a restart.
    pub restart: bool,
    /// A change was applied that only fully takes effect after a reconnect.
    pub reconnect: bool,
}

/// Result of applying one snapshot.
#[derive(Debug, Clone)]
pub struct AppliedOptions {
    /// What changed.
    pub diff: OptionsDiff,
    /// The snapshot now in force.
    pub snapshot: Arc<Options>,
}

/// Owns the current option snapshot and applies replacements one at a time.
///
/// Consumers read through [`OptionsWatcher::snapshot`], which hands out a
/// cheap `Arc` clone; in-flight work holding an older snapshot finishes
/// against it harmlessly.
pub struct OptionsWatcher {
    current: RwLock<Arc<Options>>,
    pending: Mutex<PendingFlags>,
    gate: Semaphore,
    events: EventBus,
}

impl OptionsWatcher {
    /// Construct a watcher holding the startup snapshot.
    #[must_use]
    pub fn new(initial: Options, events: EventBus) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            pending: Mutex::new(PendingFlags::default()),
            gate: Semaphore::new(1),
            events,
        }
    }

    /// The snapshot currently in force.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Options> {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Flags accumulated since startup.
    #[must_use]
    pub fn pending(&self) -> PendingFlags {
        *self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Validate and apply a replacement snapshot, returning what changed.
    ///
    /// Applications are serialised; duplicate notifications diff to empty
    /// and return without side effects. On validation failure the previous
    /// snapshot remains in force.
    ///
    /// # Errors
    ///
    /// Returns an error when the snapshot fails validation.
    pub async fn apply(&self, next: Options) -> ConfigResult<AppliedOptions> {
        // The gate is never closed; acquire only fails after a close.
        let _permit = self.gate.acquire().await.ok();

        let previous = self.snapshot();
        let changes = diff(&previous, &next);
        if changes.is_empty() {
            return Ok(AppliedOptions {
                diff: changes,
                snapshot: previous,
            });
        }

        if let Err(error) = validate_options(&next) {
            warn!(%error, "rejecting configuration update; previous options remain in force");
            return Err(error);
        }

        let snapshot = Arc::new(next);
        {
            let mut guard = self
                .current
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *guard = snapshot.clone();
        }

        {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.restart |= changes.requires_restart();
            pending.reconnect |= changes.requires_reconnect();
        }

        let fields: Vec<&'static str> =
            changes.changes.iter().map(|change| change.field).collect();
        info!(?fields, "configuration update applied");
        self.events.publish(Event::SettingsChanged {
            description: fields.join(", "),
        });
        if changes.rescan_shares() {
            self.events.publish(Event::ShareScanRequested {
                reason: "shared directories changed".to_string(),
            });
        }

        Ok(AppliedOptions {
            diff: changes,
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::sample_options;

    #[tokio::test]
    async fn duplicate_snapshots_short_circuit() {
        let bus = EventBus::with_capacity(8);
        let watcher = OptionsWatcher::new(sample_options(), bus.clone());

        let applied = watcher
            .apply(sample_options())
            .await
            .expect("no-op apply succeeds");
        assert!(applied.diff.is_empty());
        assert!(bus.last_event_id().is_none(), "no events for a no-op");
    }

    #[tokio::test]
    async fn applied_changes_swap_the_snapshot_and_raise_events() {
        let bus = EventBus::with_capacity(8);
        let watcher = OptionsWatcher::new(sample_options(), bus.clone());

        let mut next = sample_options();
        next.global.upload_slots = 3;
        next.shares.directories.push("/srv/share".to_string());
        let applied = watcher.apply(next).await.expect("apply succeeds");

        assert!(applied.diff.rebuild_groups());
        assert_eq!(watcher.snapshot().global.upload_slots, 3);

        let backlog = bus.backlog_since(0);
        let kinds: Vec<&str> = backlog.iter().map(|event| event.event.kind()).collect();
        assert!(kinds.contains(&"settings_changed"));
        assert!(kinds.contains(&"share_scan_requested"));
    }

    #[tokio::test]
    async fn invalid_snapshot_leaves_previous_in_force() {
        let bus = EventBus::with_capacity(8);
        let watcher = OptionsWatcher::new(sample_options(), bus);

        let mut next = sample_options();
        next.shares.filters.push("([".to_string());
        assert!(watcher.apply(next).await.is_err());
        assert!(watcher.snapshot().shares.filters.is_empty());
    }

    #[tokio::test]
    async fn pending_flags_accumulate() {
        let bus = EventBus::with_capacity(8);
        let watcher = OptionsWatcher::new(sample_options(), bus);
        assert_eq!(watcher.pending(), PendingFlags::default());

        let mut next = sample_options();
        next.connection.listen_port = 2_235;
        watcher.apply(next).await.expect("apply succeeds");
        assert!(watcher.pending().reconnect);
        assert!(!watcher.pending().restart);

        let mut next = watcher.snapshot().as_ref().clone();
        next.instance_name = "renamed".to_string();
        watcher.apply(next).await.expect("apply succeeds");
        assert!(watcher.pending().reconnect, "flags are sticky");
        assert!(watcher.pending().restart);
    }
}
