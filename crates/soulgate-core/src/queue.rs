//! The multi-group upload queue: slot accounting and release ordering.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use soulgate_config::{Group, Options, QueueStrategy, rebuild_groups};
use tokio::sync::oneshot;

use crate::error::{CoreError, CoreResult};

/// Resolves a username to its group name at call time.
///
/// The queue resolves at `process` time rather than enqueue time, so a user
/// that changes groups has their uploads scheduled against the new group.
pub trait GroupResolver: Send + Sync {
    /// Group name for a username; must not block on the network.
    fn resolve_group(&self, username: &str) -> String;
}

/// In-memory scheduling entry; not persisted.
struct UploadEntry {
    filename: String,
    enqueued: DateTime<Utc>,
    ready: Option<DateTime<Utc>>,
    started: Option<DateTime<Utc>>,
    group: Option<String>,
    release: Option<oneshot::Sender<()>>,
}

struct QueueState {
    uploads: HashMap<String, Vec<UploadEntry>>,
    groups: BTreeMap<String, Group>,
    global_slots: u32,
    last_release: HashMap<String, DateTime<Utc>>,
}

/// Priority scheduler with per-group slot accounting and FIFO or
/// round-robin selection among ready uploads.
///
/// All mutating operations run under one queue-wide mutex; operations are
/// short and contention is modest, so coarse granularity wins.
pub struct UploadQueue {
    resolver: Arc<dyn GroupResolver>,
    state: Mutex<QueueState>,
}

impl UploadQueue {
    /// Construct a queue over an initial group table.
    #[must_use]
    pub fn new(
        resolver: Arc<dyn GroupResolver>,
        groups: BTreeMap<String, Group>,
        global_slots: u32,
    ) -> Self {
        Self {
            resolver,
            state: Mutex::new(QueueState {
                uploads: HashMap::new(),
                groups,
                global_slots,
                last_release: HashMap::new(),
            }),
        }
    }

    /// Register a new upload for a user.
    pub fn enqueue(&self, username: &str, filename: &str) {
        let mut state = self.lock_state();
        state
            .uploads
            .entry(username.to_string())
            .or_default()
            .push(UploadEntry {
                filename: filename.to_string(),
                enqueued: Utc::now(),
                ready: None,
                started: None,
                group: None,
                release: None,
            });
        self.process(&mut state);
    }

    /// Mark an upload ready and obtain the promise that resolves when the
    /// scheduler grants it a slot.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] when the upload was never enqueued;
    /// `enqueue` must precede `await_start`.
    pub fn await_start(
        &self,
        username: &str,
        filename: &str,
    ) -> CoreResult<oneshot::Receiver<()>> {
        let mut state = self.lock_state();
        let entry = state
            .uploads
            .get_mut(username)
            .and_then(|entries| {
                entries
                    .iter_mut()
                    .find(|entry| entry.filename == filename && entry.started.is_none())
            })
            .ok_or(CoreError::NotFound { what: "upload" })?;

        if entry.ready.is_none() {
            entry.ready = Some(Utc::now());
        }
        let (sender, receiver) = oneshot::channel();
        entry.release = Some(sender);
        self.process(&mut state);
        Ok(receiver)
    }

    /// Remove an upload and return its slot. Returns whether the upload was
    /// known.
    pub fn complete(&self, username: &str, filename: &str) -> bool {
        let mut state = self.lock_state();
        let Some(entries) = state.uploads.get_mut(username) else {
            return false;
        };
        let Some(index) = entries.iter().position(|entry| entry.filename == filename) else {
            return false;
        };
        let entry = entries.remove(index);
        if entries.is_empty() {
            state.uploads.remove(username);
        }
        if let Some(group_name) = entry.group
            && let Some(group) = state.groups.get_mut(&group_name)
        {
            // The group may have been replaced while the upload ran; a
            // vanished group simply absorbs nothing.
            group.used_slots = group.used_slots.saturating_sub(1);
        }
        self.process(&mut state);
        true
    }

    /// Estimated 0-based queue position of an enqueued upload.
    ///
    /// The estimate treats the group as executing in isolation; cross-group
    /// priority only ever improves the requesting user's real position.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] when the user has no such upload or
    /// the group is unknown.
    pub fn estimate_position(&self, username: &str, filename: &str) -> CoreResult<usize> {
        let state = self.lock_state();
        let entries = state
            .uploads
            .get(username)
            .ok_or(CoreError::NotFound { what: "upload" })?;
        let local_index = entries
            .iter()
            .position(|entry| entry.filename == filename)
            .ok_or(CoreError::NotFound { what: "upload" })?;

        let group_name = self.resolver.resolve_group(username);
        let group = state
            .groups
            .get(&group_name)
            .ok_or(CoreError::NotFound { what: "group" })?;

        match group.strategy {
            QueueStrategy::FirstInFirstOut => {
                // Position in the full arrival-sorted list across the group;
                // in-progress uploads count toward the position.
                let mut all: Vec<(DateTime<Utc>, &str, &str)> = Vec::new();
                for (user, user_entries) in &state.uploads {
                    if self.resolver.resolve_group(user) != group_name {
                        continue;
                    }
                    for entry in user_entries {
                        all.push((entry.enqueued, entry.filename.as_str(), user.as_str()));
                    }
                }
                all.sort();
                all.iter()
                    .position(|(_, file, user)| *user == username && *file == filename)
                    .ok_or(CoreError::NotFound { what: "upload" })
            }
            QueueStrategy::RoundRobin => {
                // Round-robin serves the user's earlier files first and up to
                // `local_index` files of every other user interleaved.
                let mut position = local_index;
                for (user, user_entries) in &state.uploads {
                    if user == username || self.resolver.resolve_group(user) != group_name {
                        continue;
                    }
                    position += local_index.min(user_entries.len());
                }
                Ok(position)
            }
        }
    }

    /// Hypothetical position if the user enqueued a new upload right now.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] when the user's group is unknown.
    pub fn forecast_position(&self, username: &str) -> CoreResult<usize> {
        let state = self.lock_state();
        let group_name = self.resolver.resolve_group(username);
        let group = state
            .groups
            .get(&group_name)
            .ok_or(CoreError::NotFound { what: "group" })?;

        if group.used_slots < group.slots {
            return Ok(0);
        }

        let mut distinct_users = 0_usize;
        let mut total_uploads = 0_usize;
        for (user, user_entries) in &state.uploads {
            if self.resolver.resolve_group(user) != group_name {
                continue;
            }
            distinct_users += 1;
            total_uploads += user_entries.len();
        }

        Ok(match group.strategy {
            QueueStrategy::RoundRobin => distinct_users + 1,
            QueueStrategy::FirstInFirstOut => total_uploads + 1,
        })
    }

    /// Snapshot of one group.
    #[must_use]
    pub fn group_info(&self, name: &str) -> Option<Group> {
        self.lock_state().groups.get(name).cloned()
    }

    /// Snapshot of the whole group table.
    #[must_use]
    pub fn groups_snapshot(&self) -> BTreeMap<String, Group> {
        self.lock_state().groups.clone()
    }

    /// Total number of scheduling entries, for gauges.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.lock_state().uploads.values().map(Vec::len).sum()
    }

    /// Number of entries currently holding a slot, for gauges.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock_state()
            .uploads
            .values()
            .flatten()
            .filter(|entry| entry.started.is_some())
            .count()
    }

    /// Swap in the group table for a new option snapshot, carrying live slot
    /// usage over by name. The swap happens under the queue mutex, so no
    /// `process` call ever observes a half-built table.
    pub fn rebuild(&self, options: &Options) {
        let mut state = self.lock_state();
        let usage: HashMap<String, u32> = state
            .groups
            .values()
            .map(|group| (group.name.clone(), group.used_slots))
            .collect();
        state.groups = rebuild_groups(options, &usage);
        state.global_slots = options.global.upload_slots;
        self.process(&mut state);
    }

    /// Release at most one ready upload, honouring the global ceiling, group
    /// priority order, and the group's selection strategy.
    fn process(&self, state: &mut QueueState) {
        let used_total: u32 = state.groups.values().map(|group| group.used_slots).sum();
        if used_total >= state.global_slots {
            return;
        }

        // Candidates: (username, filename, enqueued, ready), grouped by the
        // user's group as resolved right now.
        let mut ready: HashMap<String, Vec<(String, String, DateTime<Utc>, DateTime<Utc>)>> =
            HashMap::new();
        for (username, entries) in &state.uploads {
            let group = self.resolver.resolve_group(username);
            for entry in entries {
                if let Some(ready_at) = entry.ready
                    && entry.started.is_none()
                {
                    ready.entry(group.clone()).or_default().push((
                        username.clone(),
                        entry.filename.clone(),
                        entry.enqueued,
                        ready_at,
                    ));
                }
            }
        }
        if ready.is_empty() {
            return;
        }

        let mut order: Vec<(u32, String)> = state
            .groups
            .values()
            .map(|group| (group.priority, group.name.clone()))
            .collect();
        order.sort();

        for (_, group_name) in order {
            let (strategy, has_capacity) = {
                let group = &state.groups[&group_name];
                (group.strategy, group.used_slots < group.slots)
            };
            if !has_capacity {
                continue;
            }
            let Some(candidates) = ready.get(&group_name) else {
                continue;
            };

            let winner = match strategy {
                QueueStrategy::FirstInFirstOut => candidates
                    .iter()
                    .min_by(|a, b| (a.2, &a.1).cmp(&(b.2, &b.1))),
                QueueStrategy::RoundRobin => candidates.iter().min_by(|a, b| {
                    let a_key = (a.3, last_release_of(state, &a.0), &a.1);
                    let b_key = (b.3, last_release_of(state, &b.0), &b.1);
                    a_key.cmp(&b_key)
                }),
            };
            let Some((username, filename, _, _)) = winner else {
                continue;
            };
            let username = username.clone();
            let filename = filename.clone();

            let now = Utc::now();
            if let Some(entries) = state.uploads.get_mut(&username)
                && let Some(entry) = entries
                    .iter_mut()
                    .find(|entry| entry.filename == filename && entry.started.is_none())
            {
                entry.started = Some(now);
                entry.group = Some(group_name.clone());
                if let Some(sender) = entry.release.take() {
                    let _ = sender.send(());
                }
            }
            if let Some(group) = state.groups.get_mut(&group_name) {
                group.used_slots += 1;
            }
            state.last_release.insert(username, now);
            return;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[cfg(test)]
    fn set_ready_at(&self, username: &str, filename: &str, at: DateTime<Utc>) {
        let mut state = self.lock_state();
        if let Some(entry) = state.uploads.get_mut(username).and_then(|entries| {
            entries
                .iter_mut()
                .find(|entry| entry.filename == filename)
        }) {
            entry.ready = Some(at);
        }
    }
}

/// A user that has never had a release sorts before every user that has, so
/// rotation favours newcomers on ready-time ties.
fn last_release_of(state: &QueueState, username: &str) -> DateTime<Utc> {
    state
        .last_release
        .get(username)
        .copied()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
