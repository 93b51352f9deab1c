//! The enqueue admission path and the peer-request resolvers.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use soulgate_events::{Event, EventBus, TransferDirection, TransferOutcome};
use soulgate_proto::{
    FileHost, PeerRequestHandler, ProtoError, ProtoResult, ShareService, SharedDirectory,
    SharedFile, UserInfo,
};
use soulgate_telemetry::Metrics;
use soulgate_transfers::{Transfer, TransferFilter, TransferStore, TransferSummary};
use tracing::{debug, info, warn};

use crate::classifier::UserClassifier;
use crate::context::CoreContext;
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::UploadRunner;
use crate::limits::{LimitScope, effective_limits, evaluate_scope};
use crate::queue::UploadQueue;

/// Wire message for files that cannot be served, for whatever reason the
/// remote peer need not learn.
pub const NOT_SHARED_REJECTION: &str = "File not shared.";

/// Wire message for transient internal failures during admission.
pub const GENERIC_REJECTION: &str = "Unable to process request.";

/// Dependencies for the admission façade.
pub struct UploadServiceDeps {
    /// Process-wide context (options snapshot, shutdown flag).
    pub context: Arc<CoreContext>,
    /// Durable record store.
    pub store: TransferStore,
    /// Share index lookups.
    pub share: Arc<dyn ShareService>,
    /// Group classification and watch bookkeeping.
    pub classifier: Arc<UserClassifier>,
    /// The slot scheduler, for position estimates.
    pub queue: Arc<UploadQueue>,
    /// Spawns the lifecycle task for accepted requests.
    pub runner: Arc<UploadRunner>,
    /// Event bus for higher layers.
    pub events: EventBus,
    /// Shared metrics handle.
    pub metrics: Metrics,
}

/// Decides, for every remotely initiated file request, whether it may be
/// enqueued, and answers the peer-request callbacks that surround that
/// decision.
pub struct UploadService {
    deps: UploadServiceDeps,
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
}

impl UploadService {
    /// Construct the admission façade.
    #[must_use]
    pub fn new(deps: UploadServiceDeps) -> Self {
        Self {
            deps,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Validate an incoming file request and, on acceptance, persist a
    /// record and launch its lifecycle task.
    ///
    /// Returning `Ok(())` signals acceptance, including the silent cases
    /// where another in-flight call or an existing record already covers the
    /// request.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Rejected`] with the wire-visible message for
    /// every refused request.
    pub async fn enqueue_upload(
        &self,
        username: &str,
        endpoint: IpAddr,
        filename: &str,
    ) -> CoreResult<()> {
        let deps = &self.deps;

        if deps.classifier.is_blacklisted(username, Some(endpoint)) {
            deps.metrics.record_enqueue_rejected("blacklisted");
            return Err(CoreError::rejected(NOT_SHARED_REJECTION));
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, username, filename) else {
            debug!(username, filename, "duplicate enqueue already in flight");
            return Ok(());
        };

        let live = deps
            .store
            .list(&TransferFilter {
                direction: Some(TransferDirection::Upload),
                username: Some(username.to_string()),
                remote_path: Some(filename.to_string()),
                terminal: Some(false),
                ..TransferFilter::default()
            })
            .await
            .map_err(|error| self.database_rejection("duplicate check", &error))?;
        if !live.is_empty() {
            debug!(username, filename, "request already tracked; accepting silently");
            return Ok(());
        }

        let resolved = match deps.share.resolve_file(filename).await {
            Ok(resolved) => resolved,
            Err(error) => {
                debug!(username, filename, %error, "file not in share index");
                self.request_scan("unresolved file request").await;
                deps.metrics.record_enqueue_rejected("not_shared");
                return Err(CoreError::rejected(NOT_SHARED_REJECTION));
            }
        };

        let mut size = resolved.size;
        if matches!(resolved.host, FileHost::Local) {
            match tokio::fs::metadata(&resolved.local_path).await {
                Ok(metadata) => {
                    if metadata.len() != resolved.size {
                        warn!(
                            filename,
                            indexed = resolved.size,
                            on_disk = metadata.len(),
                            "share index size mismatch"
                        );
                        self.request_scan("share index size mismatch").await;
                        size = metadata.len();
                    }
                }
                Err(error) => {
                    warn!(filename, %error, "shared file missing on disk");
                    self.request_scan("shared file missing on disk").await;
                    deps.metrics.record_enqueue_rejected("not_shared");
                    return Err(CoreError::rejected(NOT_SHARED_REJECTION));
                }
            }
        }

        let group = deps.classifier.classify(username, Some(endpoint)).await;

        if let Some(bundle) = effective_limits(&deps.context.options(), &group) {
            let scopes = [
                (LimitScope::Queued, bundle.queued),
                (LimitScope::Weekly, bundle.weekly),
                (LimitScope::Daily, bundle.daily),
            ];
            for (scope, limits) in scopes {
                if limits.is_unset() {
                    continue;
                }
                let (counted, failures) = self
                    .summaries_for(username, scope)
                    .await
                    .map_err(|error| self.database_rejection("limit summary", &error))?;
                if let Err(message) = evaluate_scope(scope, limits, counted, failures, size) {
                    info!(username, filename, group, message, "upload refused by limits");
                    deps.metrics.record_enqueue_rejected("limit");
                    return Err(CoreError::rejected(message));
                }
            }
        }

        let mut transfer = Transfer::new_upload(username, filename, size);
        transfer.local_path = Some(resolved.local_path.clone());
        deps.store
            .add_or_supersede(&transfer)
            .await
            .map_err(|error| self.database_rejection("record creation", &error))?;

        if deps.classifier.ensure_watched(username).await {
            deps.events.publish(Event::UserWatched {
                username: username.to_string(),
            });
        }

        info!(username, filename, group, size, "upload accepted");
        deps.events.publish(Event::UploadEnqueued {
            transfer_id: transfer.id,
            username: username.to_string(),
            filename: filename.to_string(),
        });
        deps.metrics.record_enqueue_accepted();
        let _task = deps.runner.spawn(transfer, resolved);
        Ok(())
    }

    async fn summaries_for(
        &self,
        username: &str,
        scope: LimitScope,
    ) -> anyhow::Result<(TransferSummary, u64)> {
        let store = &self.deps.store;
        match scope.window_hours() {
            None => {
                let counted = store
                    .summarize(&TransferFilter::uploads_for(username).not_ended())
                    .await?;
                Ok((counted, 0))
            }
            Some(hours) => {
                let cutoff = Utc::now() - Duration::hours(hours);
                let counted = store
                    .summarize(
                        &TransferFilter::uploads_for(username)
                            .started_since(cutoff)
                            .without_outcomes(vec![TransferOutcome::Errored])
                            .including_removed(),
                    )
                    .await?;
                let failures = store
                    .summarize(
                        &TransferFilter::uploads_for(username)
                            .started_since(cutoff)
                            .with_outcomes(vec![TransferOutcome::Errored])
                            .including_removed(),
                    )
                    .await?;
                Ok((counted, failures.files))
            }
        }
    }

    async fn request_scan(&self, reason: &str) {
        if let Err(error) = self.deps.share.request_scan().await {
            debug!(%error, "share rescan request failed");
        }
        self.deps.events.publish(Event::ShareScanRequested {
            reason: reason.to_string(),
        });
    }

    fn database_rejection(&self, operation: &str, error: &anyhow::Error) -> CoreError {
        warn!(operation, %error, "admission persistence failure");
        self.deps.metrics.record_enqueue_rejected("database");
        CoreError::rejected(GENERIC_REJECTION)
    }
}

#[async_trait]
impl PeerRequestHandler for UploadService {
    async fn enqueue_upload(
        &self,
        username: &str,
        endpoint: IpAddr,
        filename: &str,
    ) -> ProtoResult<()> {
        Self::enqueue_upload(self, username, endpoint, filename)
            .await
            .map_err(ProtoError::from)
    }

    async fn place_in_queue(&self, username: &str, filename: &str) -> Option<usize> {
        self.deps.queue.estimate_position(username, filename).ok()
    }

    async fn user_info(&self, username: &str) -> UserInfo {
        let deps = &self.deps;
        let options = deps.context.options();
        let group_name = deps.classifier.classify_cached(username);
        let group = deps.queue.group_info(&group_name);
        let forecast = deps.queue.forecast_position(username).unwrap_or(0);

        UserInfo {
            description: options.instance_name.clone(),
            upload_slots: group.as_ref().map_or(0, |group| group.slots),
            queue_length: u32::try_from(forecast).unwrap_or(u32::MAX),
            has_free_upload_slot: forecast == 0,
            picture: None,
        }
    }

    async fn browse(&self, username: &str) -> Vec<SharedDirectory> {
        if self.deps.classifier.is_blacklisted(username, None) {
            return Vec::new();
        }
        self.deps.share.browse().await.unwrap_or_default()
    }

    async fn directory_contents(&self, username: &str, path: &str) -> Option<SharedDirectory> {
        if self.deps.classifier.is_blacklisted(username, None) {
            return None;
        }
        self.deps.share.directory_contents(path).await.ok()
    }

    async fn search(&self, username: &str, query: &str) -> Vec<SharedFile> {
        if self.deps.classifier.is_blacklisted(username, None) {
            return Vec::new();
        }
        self.deps.share.search(query).await.unwrap_or_default()
    }
}

/// Removes its key from the in-flight set on drop, bounding the duplicate
/// suppression window to the admission call itself.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<(String, String)>>>,
    key: (String, String),
}

impl InFlightGuard {
    fn acquire(
        set: &Arc<Mutex<HashSet<(String, String)>>>,
        username: &str,
        filename: &str,
    ) -> Option<Self> {
        let key = (username.to_string(), filename.to_string());
        let mut guard = set.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !guard.insert(key.clone()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut guard = self
            .set
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.remove(&self.key);
    }
}
