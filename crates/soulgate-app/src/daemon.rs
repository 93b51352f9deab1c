//! Wiring and lifecycle of the daemon itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use soulgate_config::{Options, OptionsDiff, OptionsWatcher, rebuild_groups, validate_options};
use soulgate_core::{
    CancellationRegistry, CoreContext, Governor, UploadQueue, UploadRunner, UploadRunnerDeps,
    UploadService, UploadServiceDeps, UserClassifier,
};
use soulgate_events::{EventBus, TransferDirection, TransferOutcome};
use soulgate_proto::{ClientPatch, PeerDirectory, RelayService, ShareService, SoulClient};
use soulgate_telemetry::Metrics;
use soulgate_transfers::TransferStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

/// How long shutdown waits for lifecycle tasks to reach terminal state.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the retention janitor wakes.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Outcomes the janitor is allowed to prune.
const PRUNABLE_OUTCOMES: [TransferOutcome; 6] = [
    TransferOutcome::Succeeded,
    TransferOutcome::Errored,
    TransferOutcome::Cancelled,
    TransferOutcome::TimedOut,
    TransferOutcome::Rejected,
    TransferOutcome::Aborted,
];

/// Adapters for the external collaborators the core is bounded by.
pub struct Collaborators {
    /// The Soulseek protocol library.
    pub client: Arc<dyn SoulClient>,
    /// The share index.
    pub share: Arc<dyn ShareService>,
    /// Cached peer data and watch subscriptions.
    pub directory: Arc<dyn PeerDirectory>,
    /// Stream source for relay-hosted files, when deployed.
    pub relay: Option<Arc<dyn RelayService>>,
}

/// The assembled upload orchestration daemon.
pub struct Daemon {
    context: Arc<CoreContext>,
    watcher: OptionsWatcher,
    queue: Arc<UploadQueue>,
    governor: Arc<Governor>,
    registry: Arc<CancellationRegistry>,
    service: Arc<UploadService>,
    store: TransferStore,
    events: EventBus,
    client: Arc<dyn SoulClient>,
    shutdown: CancellationToken,
    janitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Validate options, reconcile the store, wire the core, and start
    /// background upkeep.
    ///
    /// # Errors
    ///
    /// Returns an error when the options are invalid or the startup cleanup
    /// fails; both are unrecoverable at boot.
    pub async fn start(
        options: Options,
        store: TransferStore,
        collaborators: Collaborators,
        events: EventBus,
        metrics: Metrics,
    ) -> AppResult<Arc<Self>> {
        validate_options(&options).map_err(|source| AppError::Config { source })?;

        store
            .startup_cleanup()
            .await
            .map_err(|source| AppError::persistence("startup cleanup", source))?;

        let context = Arc::new(CoreContext::new(options.clone()));
        let classifier = Arc::new(UserClassifier::new(
            context.clone(),
            collaborators.directory,
        ));
        let queue = Arc::new(UploadQueue::new(
            classifier.clone(),
            rebuild_groups(&options, &HashMap::new()),
            options.global.upload_slots,
        ));
        let governor = Arc::new(Governor::new(&options, classifier.clone(), metrics.clone()));
        let registry = Arc::new(CancellationRegistry::new());
        let runner = Arc::new(UploadRunner::new(UploadRunnerDeps {
            context: context.clone(),
            store: store.clone(),
            client: collaborators.client.clone(),
            queue: queue.clone(),
            governor: governor.clone(),
            relay: collaborators.relay,
            registry: registry.clone(),
            events: events.clone(),
            metrics: metrics.clone(),
        }));
        let service = Arc::new(UploadService::new(UploadServiceDeps {
            context: context.clone(),
            store: store.clone(),
            share: collaborators.share,
            classifier,
            queue: queue.clone(),
            runner,
            events: events.clone(),
            metrics,
        }));

        let watcher = OptionsWatcher::new(options, events.clone());
        let daemon = Arc::new(Self {
            context,
            watcher,
            queue,
            governor,
            registry,
            service,
            store,
            events,
            client: collaborators.client,
            shutdown: CancellationToken::new(),
            janitor: std::sync::Mutex::new(None),
        });
        daemon.spawn_janitor();
        info!("upload orchestration daemon ready");
        Ok(daemon)
    }

    /// The peer-request handler the protocol adapter should be wired to.
    #[must_use]
    pub fn handler(&self) -> Arc<UploadService> {
        self.service.clone()
    }

    /// The event bus higher layers may subscribe to.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Signal a running transfer to cancel. Returns whether it was found.
    #[must_use]
    pub fn try_cancel(&self, id: uuid::Uuid) -> bool {
        self.registry.try_cancel(id)
    }

    /// Apply a replacement option snapshot to the running daemon.
    ///
    /// The queue's group table and the governor's buckets are rebuilt only
    /// when the diff says so, each preserving in-flight state; connection
    /// changes are pushed to the protocol client, which decides whether a
    /// reconnect is needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the snapshot fails validation; the previous
    /// options remain in force.
    pub async fn apply_options(&self, next: Options) -> AppResult<OptionsDiff> {
        let applied = self
            .watcher
            .apply(next)
            .await
            .map_err(|source| AppError::Config { source })?;
        if applied.diff.is_empty() {
            return Ok(applied.diff);
        }

        self.context.set_options(applied.snapshot.clone());
        if applied.diff.rebuild_groups() {
            self.queue.rebuild(&applied.snapshot);
        }
        if applied.diff.rebuild_buckets() {
            self.governor.rebuild(&applied.snapshot);
        }

        let patch = connection_patch(&applied.diff, &applied.snapshot);
        if !patch.is_empty() {
            match self.client.reconfigure(patch).await {
                Ok(true) => info!("configuration applied; client reconnect required"),
                Ok(false) => {}
                Err(error) => warn!(%error, "failed to push configuration to the client"),
            }
        }
        Ok(applied.diff)
    }

    /// Flags accumulated since startup (restart / reconnect pending).
    #[must_use]
    pub fn pending_flags(&self) -> soulgate_config::PendingFlags {
        self.watcher.pending()
    }

    /// Shut the daemon down: suppress callback persistence, disconnect the
    /// client (cascading cancellation), cancel stragglers, and wait a
    /// bounded time for lifecycle tasks to finish.
    pub async fn shutdown(&self) {
        info!("daemon shutdown starting");
        self.context.begin_shutdown();
        self.shutdown.cancel();

        if let Err(error) = self.client.disconnect("Application shut down").await {
            warn!(%error, "client disconnect failed during shutdown");
        }
        self.registry.cancel_all();

        let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            while !self.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.registry.len(),
                "lifecycle tasks still pending at shutdown deadline"
            );
        }

        if let Some(janitor) = self
            .janitor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            janitor.abort();
        }
        info!("daemon shutdown complete");
    }

    fn spawn_janitor(self: &Arc<Self>) {
        let daemon = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = daemon.shutdown.cancelled() => return,
                    () = tokio::time::sleep(JANITOR_INTERVAL) => {}
                }
                let Some(age_minutes) = daemon.context.options().retention.prune_age_minutes
                else {
                    continue;
                };
                match daemon
                    .store
                    .prune(TransferDirection::Upload, age_minutes, &PRUNABLE_OUTCOMES)
                    .await
                {
                    Ok(0) => {}
                    Ok(pruned) => info!(pruned, "retention janitor soft-deleted aged uploads"),
                    Err(error) => warn!(%error, "retention janitor prune failed"),
                }
            }
        });
        *self
            .janitor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
    }
}

/// Build the client patch for the connection-affecting fields in a diff.
fn connection_patch(diff: &OptionsDiff, options: &Options) -> ClientPatch {
    let mut patch = ClientPatch::default();
    if diff.changed("connection.listen_port") {
        patch.listen_port = Some(options.connection.listen_port);
    }
    if diff.changed("connection.server_address") {
        patch.server_address = Some(options.connection.server_address.clone());
    }
    if diff.changed("global.upload_slots") {
        patch.upload_slots = Some(options.global.upload_slots);
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use soulgate_config::diff;
    use soulgate_config::{
        BlacklistOptions, ConnectionOptions, GlobalUploadOptions, GroupsOptions, LeecherOptions,
        LimitBundle, RetentionOptions, ShareOptions,
    };

    fn sample_options() -> Options {
        Options {
            instance_name: "test".to_string(),
            connection: ConnectionOptions {
                server_address: "server.example.net:2242".to_string(),
                listen_port: 2_234,
            },
            shares: ShareOptions::default(),
            global: GlobalUploadOptions {
                upload_slots: 2,
                speed_limit_kib: None,
                limits: LimitBundle::default(),
            },
            groups: GroupsOptions::default(),
            blacklist: BlacklistOptions::default(),
            leechers: LeecherOptions::default(),
            retention: RetentionOptions::default(),
        }
    }

    #[test]
    fn connection_patch_covers_only_changed_fields() {
        let old = sample_options();
        let mut new = old.clone();
        new.connection.listen_port = 2_235;
        new.global.upload_slots = 6;

        let patch = connection_patch(&diff(&old, &new), &new);
        assert_eq!(patch.listen_port, Some(2_235));
        assert_eq!(patch.upload_slots, Some(6));
        assert!(patch.server_address.is_none());

        let empty = connection_patch(&diff(&old, &old.clone()), &old);
        assert!(empty.is_empty());
    }

    #[test]
    fn prunable_outcomes_are_all_terminal() {
        assert!(
            PRUNABLE_OUTCOMES
                .iter()
                .all(|outcome| !matches!(outcome, TransferOutcome::None))
        );
    }
}
