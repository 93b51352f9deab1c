//! Traits implemented by collaborators and by the core itself.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ProtoError, ProtoResult};
use crate::model::{
    ClientPatch, CompletedTransfer, InputStream, PeerStats, ResolvedFile, SharedDirectory,
    SharedFile, UploadEvent, UploadRequest, UserInfo,
};

/// Byte pacing source handed to the protocol library for each upload.
///
/// Implemented by the core's governor; the library calls `get_bytes` before
/// writing a chunk to the socket and `return_bytes` when a downstream limiter
/// clipped the grant.
#[async_trait]
pub trait TransferGovernor: Send + Sync {
    /// Obtain up to `requested` bytes of budget, waiting until at least one
    /// byte is available or `cancel` trips.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Cancelled`] when the token is cancelled before
    /// any bytes could be granted.
    async fn get_bytes(
        &self,
        username: &str,
        requested: usize,
        cancel: &CancellationToken,
    ) -> ProtoResult<usize>;

    /// Refund the unconsumed portion of a grant. `attempted` is recorded for
    /// metrics only.
    fn return_bytes(&self, username: &str, attempted: usize, granted: usize, actual: usize);
}

/// Factory opening the byte source for an upload at a given offset.
#[async_trait]
pub trait InputStreamFactory: Send + Sync {
    /// Open the stream, positioned at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying file or relay stream cannot be
    /// opened.
    async fn open(&self, start_offset: u64) -> ProtoResult<InputStream>;
}

/// Slot coordination callbacks the library drives while handshaking.
#[async_trait]
pub trait SlotHooks: Send + Sync {
    /// Invoked once the remote peer is ready to receive; resolves when the
    /// scheduler grants an upload slot.
    ///
    /// # Errors
    ///
    /// Returns an error when the upload is no longer known to the scheduler.
    async fn await_slot(&self) -> ProtoResult<()>;

    /// Invoked when the transfer ends for any reason and the slot should be
    /// handed back.
    fn slot_released(&self);
}

/// Everything the protocol library needs from the core to run one upload.
pub struct UploadHooks {
    /// Opens the byte source on demand.
    pub stream_factory: Arc<dyn InputStreamFactory>,
    /// Paces bytes onto the wire.
    pub governor: Arc<dyn TransferGovernor>,
    /// Slot acquisition and release.
    pub slots: Arc<dyn SlotHooks>,
    /// Bounded channel carrying progress and state callbacks to the
    /// lifecycle task.
    pub events: mpsc::Sender<UploadEvent>,
}

/// Operations the core invokes on the protocol library.
#[async_trait]
pub trait SoulClient: Send + Sync {
    /// Drive the byte-level upload for an accepted request.
    ///
    /// # Errors
    ///
    /// Returns an error when the transfer fails, times out, or is
    /// cancelled; the terminal disposition is derived from the error kind.
    async fn upload(
        &self,
        request: UploadRequest,
        hooks: UploadHooks,
        cancel: CancellationToken,
    ) -> ProtoResult<CompletedTransfer>;

    /// Push connection-affecting settings; returns whether a reconnect is
    /// required for them to take effect.
    ///
    /// # Errors
    ///
    /// Returns an error when the library cannot apply the patch.
    async fn reconfigure(&self, patch: ClientPatch) -> ProtoResult<bool>;

    /// Report the achieved speed of a successful upload to the network.
    ///
    /// # Errors
    ///
    /// Returns an error when the report cannot be delivered.
    async fn send_upload_speed(&self, _bytes_per_second: u64) -> ProtoResult<()> {
        Err(ProtoError::Unsupported {
            operation: "send_upload_speed",
        })
    }

    /// Disconnect from the server, cascading cancellation to every transfer.
    ///
    /// # Errors
    ///
    /// Returns an error when the disconnect cannot be initiated.
    async fn disconnect(&self, _message: &str) -> ProtoResult<()> {
        Err(ProtoError::Unsupported {
            operation: "disconnect",
        })
    }
}

/// Share index lookups the core relies on at admission time.
#[async_trait]
pub trait ShareService: Send + Sync {
    /// Map a remote filename to its physical location and indexed size.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::NotFound`] when the file is not in the index.
    async fn resolve_file(&self, remote_path: &str) -> ProtoResult<ResolvedFile>;

    /// Ask for a background rescan of the shared directories.
    ///
    /// # Errors
    ///
    /// Returns an error when the scan cannot be scheduled.
    async fn request_scan(&self) -> ProtoResult<()>;

    /// Full share listing for a browse response.
    ///
    /// # Errors
    ///
    /// Returns an error when the listing is unavailable.
    async fn browse(&self) -> ProtoResult<Vec<SharedDirectory>> {
        Err(ProtoError::Unsupported { operation: "browse" })
    }

    /// Contents of a single shared directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory is unknown or unavailable.
    async fn directory_contents(&self, _path: &str) -> ProtoResult<SharedDirectory> {
        Err(ProtoError::Unsupported {
            operation: "directory_contents",
        })
    }

    /// Files matching a search query.
    ///
    /// # Errors
    ///
    /// Returns an error when search is unavailable.
    async fn search(&self, _query: &str) -> ProtoResult<Vec<SharedFile>> {
        Err(ProtoError::Unsupported { operation: "search" })
    }
}

/// Cached per-user network data and the watch subscription set.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Stats for a user, fetching from the network when the cache misses.
    ///
    /// # Errors
    ///
    /// Returns an error when the user is unknown or the fetch fails.
    async fn stats(&self, username: &str) -> ProtoResult<PeerStats>;

    /// Stats for a user from the cache only; never touches the network.
    fn cached_stats(&self, username: &str) -> Option<PeerStats>;

    /// Whether the user is blacklisted by name or by most-recent address.
    fn is_blacklisted(&self, username: &str, ip: Option<IpAddr>) -> bool;

    /// Subscribe to the user's status updates so stats stay fresh.
    ///
    /// # Errors
    ///
    /// Returns an error when the subscription cannot be established.
    async fn watch(&self, username: &str) -> ProtoResult<()>;

    /// Whether the user is already watched.
    fn is_watched(&self, username: &str) -> bool;
}

/// Stream access for files hosted on a relay agent instead of this machine.
#[async_trait]
pub trait RelayService: Send + Sync {
    /// Open a read stream for a relay-hosted file.
    ///
    /// # Errors
    ///
    /// Returns an error when the agent is unreachable or refuses the file.
    async fn open_stream(&self, remote_path: &str, start_offset: u64) -> ProtoResult<InputStream>;

    /// Release any server-side state for a previously opened stream.
    ///
    /// # Errors
    ///
    /// Returns an error when the agent is unreachable.
    async fn close_stream(&self, _remote_path: &str) -> ProtoResult<()> {
        Ok(())
    }
}

/// Inbound peer-request callbacks the core implements for the protocol
/// library.
#[async_trait]
pub trait PeerRequestHandler: Send + Sync {
    /// Handle an incoming file request. Returning `Ok` signals acceptance.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Rejected`] with a message that is propagated
    /// onto the wire verbatim.
    async fn enqueue_upload(
        &self,
        username: &str,
        endpoint: IpAddr,
        filename: &str,
    ) -> ProtoResult<()>;

    /// Estimated queue position for a previously enqueued file, if known.
    async fn place_in_queue(&self, username: &str, filename: &str) -> Option<usize>;

    /// User-info response for the requesting peer.
    async fn user_info(&self, username: &str) -> UserInfo;

    /// Browse response; empty for blacklisted peers.
    async fn browse(&self, username: &str) -> Vec<SharedDirectory>;

    /// Directory-contents response; `None` for blacklisted peers or unknown
    /// paths.
    async fn directory_contents(&self, username: &str, path: &str) -> Option<SharedDirectory>;

    /// Search response; empty for blacklisted peers.
    async fn search(&self, username: &str, query: &str) -> Vec<SharedFile>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use soulgate_events::{TransferOutcome, TransferPhase};

    struct StubClient;

    #[async_trait]
    impl SoulClient for StubClient {
        async fn upload(
            &self,
            _request: UploadRequest,
            hooks: UploadHooks,
            _cancel: CancellationToken,
        ) -> ProtoResult<CompletedTransfer> {
            drop(hooks);
            Ok(CompletedTransfer {
                phase: TransferPhase::Completed,
                outcome: TransferOutcome::Succeeded,
                bytes_transferred: 0,
                start_offset: 0,
                average_speed: 0.0,
                ended_at: Utc::now(),
            })
        }

        async fn reconfigure(&self, _patch: ClientPatch) -> ProtoResult<bool> {
            Ok(false)
        }
    }

    struct StubShare;

    #[async_trait]
    impl ShareService for StubShare {
        async fn resolve_file(&self, _remote_path: &str) -> ProtoResult<ResolvedFile> {
            Err(ProtoError::NotFound { what: "file" })
        }

        async fn request_scan(&self) -> ProtoResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn client_default_methods_report_unsupported() {
        let client = StubClient;
        assert!(matches!(
            client.send_upload_speed(1_024).await,
            Err(ProtoError::Unsupported {
                operation: "send_upload_speed"
            })
        ));
        assert!(matches!(
            client.disconnect("shutting down").await,
            Err(ProtoError::Unsupported {
                operation: "disconnect"
            })
        ));
    }

    #[tokio::test]
    async fn share_default_methods_report_unsupported() {
        let share = StubShare;
        assert!(share.browse().await.is_err());
        assert!(share.directory_contents("@@music").await.is_err());
        assert!(share.search("mp3").await.is_err());
        assert!(share.request_scan().await.is_ok());
    }
}
