//! Per-group token buckets pacing upload bytes onto the wire.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use soulgate_config::{DEFAULT_GROUP, LEECHER_GROUP, Options, PRIVILEGED_GROUP};
use soulgate_proto::{ProtoError, ProtoResult, TransferGovernor};
use soulgate_telemetry::Metrics;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::queue::GroupResolver;

/// One tenth of the per-second budget is released every interval.
const REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// Bucket capacity for a KiB/s speed limit: the bytes released per interval.
fn capacity_for(speed_limit_kib: u32) -> u64 {
    (u64::from(speed_limit_kib) * 1024 / 10).max(1)
}

struct BucketState {
    /// `None` means unlimited.
    capacity: Option<u64>,
    available: u64,
    last_refill: Instant,
}

/// A single group's bucket. Acquires serialise on the state mutex; waiters
/// park on the notify handle or the next refill deadline.
struct TokenBucket {
    state: Mutex<BucketState>,
    notify: Notify,
    retired: AtomicBool,
}

enum Acquire {
    Granted(u64),
    Retired,
    Cancelled,
}

impl TokenBucket {
    fn new(capacity: Option<u64>) -> Self {
        Self {
            state: Mutex::new(BucketState {
                capacity,
                available: capacity.unwrap_or(0),
                last_refill: Instant::now(),
            }),
            notify: Notify::new(),
            retired: AtomicBool::new(false),
        }
    }

    fn set_capacity(&self, capacity: Option<u64>) {
        {
            let mut state = self.lock_state();
            state.capacity = capacity;
            state.available = capacity.unwrap_or(0);
            state.last_refill = Instant::now();
        }
        self.notify.notify_waiters();
    }

    /// Mark the bucket dead after it was dropped from the table; waiters wake
    /// and re-resolve so an in-flight transfer is never stranded.
    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn refund(&self, tokens: u64) {
        if tokens == 0 {
            return;
        }
        {
            let mut state = self.lock_state();
            if let Some(capacity) = state.capacity {
                state.available = capacity.min(state.available + tokens);
            }
        }
        self.notify.notify_waiters();
    }

    async fn acquire(&self, requested: u64, cancel: &CancellationToken) -> Acquire {
        loop {
            if cancel.is_cancelled() {
                return Acquire::Cancelled;
            }
            if self.retired.load(Ordering::SeqCst) {
                return Acquire::Retired;
            }

            let deadline = {
                let mut state = self.lock_state();
                let Some(capacity) = state.capacity else {
                    return Acquire::Granted(requested);
                };
                let now = Instant::now();
                if now.duration_since(state.last_refill) >= REFILL_INTERVAL {
                    state.available = capacity;
                    state.last_refill = now;
                }
                if state.available > 0 {
                    let granted = requested.min(state.available);
                    state.available -= granted;
                    return Acquire::Granted(granted);
                }
                state.last_refill + REFILL_INTERVAL
            };

            tokio::select! {
                () = cancel.cancelled() => return Acquire::Cancelled,
                () = self.notify.notified() => {}
                () = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Pacing source for every upload: one token bucket per group, plus a
/// default bucket that absorbs acquires whose named bucket was retired by a
/// configuration change.
pub struct Governor {
    buckets: DashMap<String, Arc<TokenBucket>>,
    default_bucket: Arc<TokenBucket>,
    resolver: Arc<dyn GroupResolver>,
    metrics: Metrics,
}

impl Governor {
    /// Construct a governor with buckets for every configured group.
    #[must_use]
    pub fn new(options: &Options, resolver: Arc<dyn GroupResolver>, metrics: Metrics) -> Self {
        let governor = Self {
            buckets: DashMap::new(),
            default_bucket: Arc::new(TokenBucket::new(global_capacity(options))),
            resolver,
            metrics,
        };
        governor.install_buckets(options);
        governor
    }

    /// Rebuild the bucket table after a configuration change. Buckets for
    /// vanished groups are retired; surviving groups get their new capacity
    /// in place so waiters keep their position.
    pub fn rebuild(&self, options: &Options) {
        self.install_buckets(options);
    }

    fn install_buckets(&self, options: &Options) {
        let desired = desired_capacities(options);

        let stale: Vec<String> = self
            .buckets
            .iter()
            .filter(|entry| !desired.iter().any(|(name, _)| name == entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for name in stale {
            if let Some((_, bucket)) = self.buckets.remove(&name) {
                bucket.retire();
            }
        }

        for (name, capacity) in desired {
            if let Some(existing) = self.buckets.get(&name) {
                existing.set_capacity(capacity);
            } else {
                self.buckets
                    .insert(name, Arc::new(TokenBucket::new(capacity)));
            }
        }

        self.default_bucket.set_capacity(global_capacity(options));
    }

    fn bucket_for(&self, group: &str) -> Arc<TokenBucket> {
        self.buckets
            .get(group)
            .map_or_else(|| self.default_bucket.clone(), |entry| entry.clone())
    }
}

fn global_capacity(options: &Options) -> Option<u64> {
    options.global.speed_limit_kib.map(capacity_for)
}

fn desired_capacities(options: &Options) -> Vec<(String, Option<u64>)> {
    let fallback = options.global.speed_limit_kib;
    let mut desired = vec![
        (
            PRIVILEGED_GROUP.to_string(),
            options
                .groups
                .privileged
                .speed_limit_kib
                .or(fallback)
                .map(capacity_for),
        ),
        (
            DEFAULT_GROUP.to_string(),
            options
                .groups
                .default
                .speed_limit_kib
                .or(fallback)
                .map(capacity_for),
        ),
        (
            LEECHER_GROUP.to_string(),
            options
                .groups
                .leechers
                .speed_limit_kib
                .or(fallback)
                .map(capacity_for),
        ),
    ];
    for (name, group) in &options.groups.user_defined {
        desired.push((
            name.clone(),
            group.speed_limit_kib.or(fallback).map(capacity_for),
        ));
    }
    desired
}

#[async_trait]
impl TransferGovernor for Governor {
    async fn get_bytes(
        &self,
        username: &str,
        requested: usize,
        cancel: &CancellationToken,
    ) -> ProtoResult<usize> {
        let wanted = u64::try_from(requested).unwrap_or(u64::MAX);
        loop {
            // Group membership is resolved per acquire, so a user moving
            // between groups is paced by the new bucket on the next call.
            let group = self.resolver.resolve_group(username);
            let bucket = self.bucket_for(&group);
            match bucket.acquire(wanted, cancel).await {
                Acquire::Granted(granted) => {
                    self.metrics.record_governor_grant(wanted, granted);
                    return Ok(usize::try_from(granted).unwrap_or(requested));
                }
                Acquire::Retired => {}
                Acquire::Cancelled => return Err(ProtoError::Cancelled),
            }
        }
    }

    fn return_bytes(&self, username: &str, _attempted: usize, granted: usize, actual: usize) {
        let refund = u64::try_from(granted.saturating_sub(actual)).unwrap_or(u64::MAX);
        if refund == 0 {
            return;
        }
        let group = self.resolver.resolve_group(username);
        self.bucket_for(&group).refund(refund);
        self.metrics.record_governor_return(refund);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soulgate_config::{
        BlacklistOptions, ConnectionOptions, GlobalUploadOptions, GroupOptions, GroupsOptions,
        LeecherOptions, LimitBundle, QueueStrategy, RetentionOptions, ShareOptions,
    };
    use std::sync::Mutex as StdMutex;

    struct FixedResolver {
        group: StdMutex<String>,
    }

    impl FixedResolver {
        fn new(group: &str) -> Arc<Self> {
            Arc::new(Self {
                group: StdMutex::new(group.to_string()),
            })
        }

        fn set(&self, group: &str) {
            *self.group.lock().expect("resolver lock") = group.to_string();
        }
    }

    impl GroupResolver for FixedResolver {
        fn resolve_group(&self, _username: &str) -> String {
            self.group.lock().expect("resolver lock").clone()
        }
    }

    fn options_with_limits(global_kib: Option<u32>, default_kib: Option<u32>) -> Options {
        let mut groups = GroupsOptions::default();
        groups.default.speed_limit_kib = default_kib;
        Options {
            instance_name: "test".to_string(),
            connection: ConnectionOptions {
                server_address: "server.example.net:2242".to_string(),
                listen_port: 2_234,
            },
            shares: ShareOptions::default(),
            global: GlobalUploadOptions {
                upload_slots: 2,
                speed_limit_kib: global_kib,
                limits: LimitBundle::default(),
            },
            groups,
            blacklist: BlacklistOptions::default(),
            leechers: LeecherOptions::default(),
            retention: RetentionOptions::default(),
        }
    }

    #[test]
    fn capacity_is_a_tenth_of_the_byte_budget() {
        assert_eq!(capacity_for(10), 1_024);
        assert_eq!(capacity_for(512), 52_428);
        assert_eq!(capacity_for(0), 1, "a zero limit still trickles");
    }

    #[tokio::test(start_paused = true)]
    async fn grants_are_partial_and_refill_over_time() {
        let resolver = FixedResolver::new(DEFAULT_GROUP);
        let metrics = Metrics::new().expect("metrics");
        // 10 KiB/s -> 1024 bytes per 100 ms interval.
        let governor = Governor::new(&options_with_limits(None, Some(10)), resolver, metrics);
        let cancel = CancellationToken::new();

        let granted = governor
            .get_bytes("alice", 4_000, &cancel)
            .await
            .expect("grant");
        assert_eq!(granted, 1_024);

        // Bucket is drained; the next acquire waits for the refill.
        let granted = governor
            .get_bytes("alice", 100, &cancel)
            .await
            .expect("grant after refill");
        assert_eq!(granted, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn returned_bytes_become_available_again() {
        let resolver = FixedResolver::new(DEFAULT_GROUP);
        let metrics = Metrics::new().expect("metrics");
        let governor = Governor::new(&options_with_limits(None, Some(10)), resolver, metrics);
        let cancel = CancellationToken::new();

        let granted = governor
            .get_bytes("alice", 1_024, &cancel)
            .await
            .expect("grant");
        assert_eq!(granted, 1_024);

        // A downstream limiter only consumed half; the rest comes back.
        governor.return_bytes("alice", 1_024, 1_024, 512);
        let granted = governor
            .get_bytes("alice", 512, &cancel)
            .await
            .expect("refunded grant");
        assert_eq!(granted, 512);
    }

    #[tokio::test]
    async fn unlimited_groups_grant_in_full() {
        let resolver = FixedResolver::new(DEFAULT_GROUP);
        let metrics = Metrics::new().expect("metrics");
        let governor = Governor::new(&options_with_limits(None, None), resolver, metrics);
        let cancel = CancellationToken::new();

        let granted = governor
            .get_bytes("alice", 1 << 20, &cancel)
            .await
            .expect("grant");
        assert_eq!(granted, 1 << 20);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wakes_a_parked_waiter() {
        let resolver = FixedResolver::new(DEFAULT_GROUP);
        let metrics = Metrics::new().expect("metrics");
        let governor = Arc::new(Governor::new(
            &options_with_limits(None, Some(10)),
            resolver,
            metrics,
        ));
        let cancel = CancellationToken::new();

        // Drain the bucket so the next acquire parks.
        let _ = governor
            .get_bytes("alice", 1_024, &cancel)
            .await
            .expect("drain");

        let waiter = {
            let governor = governor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { governor.get_bytes("alice", 64, &cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();

        let result = waiter.await.expect("waiter task");
        assert!(matches!(result, Err(ProtoError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn group_moves_take_effect_on_the_next_acquire() {
        let resolver = FixedResolver::new(DEFAULT_GROUP);
        let metrics = Metrics::new().expect("metrics");
        let mut options = options_with_limits(None, Some(10));
        options.groups.user_defined.insert(
            "firehose".to_string(),
            GroupOptions {
                upload_slots: 1,
                priority: 1,
                strategy: QueueStrategy::FirstInFirstOut,
                speed_limit_kib: Some(1_000),
                limits: LimitBundle::default(),
                members: vec!["alice".to_string()],
            },
        );
        let governor = Governor::new(&options, resolver.clone(), metrics);
        let cancel = CancellationToken::new();

        let granted = governor
            .get_bytes("alice", 4_000, &cancel)
            .await
            .expect("default grant");
        assert_eq!(granted, 1_024);

        resolver.set("firehose");
        let granted = governor
            .get_bytes("alice", 4_000, &cancel)
            .await
            .expect("firehose grant");
        assert_eq!(granted, 4_000);
    }

    #[tokio::test(start_paused = true)]
    async fn retired_buckets_fall_back_to_the_default_bucket() {
        let resolver = FixedResolver::new("firehose");
        let metrics = Metrics::new().expect("metrics");
        let mut options = options_with_limits(None, None);
        options.groups.user_defined.insert(
            "firehose".to_string(),
            GroupOptions {
                upload_slots: 1,
                priority: 1,
                strategy: QueueStrategy::FirstInFirstOut,
                speed_limit_kib: Some(10),
                limits: LimitBundle::default(),
                members: vec!["alice".to_string()],
            },
        );
        let governor = Arc::new(Governor::new(&options, resolver, metrics));
        let cancel = CancellationToken::new();

        // Drain the group bucket, then park a waiter on it.
        let _ = governor
            .get_bytes("alice", 1_024, &cancel)
            .await
            .expect("drain");
        let waiter = {
            let governor = governor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { governor.get_bytes("alice", 2_048, &cancel).await })
        };
        tokio::task::yield_now().await;

        // The group disappears from configuration; the waiter must complete
        // against the (unlimited) default bucket instead of stranding.
        options.groups.user_defined.clear();
        governor.rebuild(&options);

        let granted = waiter.await.expect("waiter task").expect("grant");
        assert_eq!(granted, 2_048);
    }
}
