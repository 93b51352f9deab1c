//! DTOs exchanged across the collaborator seams.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use soulgate_events::{TransferOutcome, TransferPhase};
use tokio::io::AsyncRead;

/// Readable byte stream handed to the protocol library for an upload.
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Per-user network data cached by the peer directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStats {
    /// Username the stats belong to.
    pub username: String,
    /// Whether the network reports the user as privileged.
    pub privileged: bool,
    /// Average reported upload speed in bytes per second.
    pub average_speed: u64,
    /// Number of uploads the network has recorded for the user.
    pub upload_count: u64,
    /// Files the user shares.
    pub shared_file_count: u64,
    /// Directories the user shares.
    pub shared_directory_count: u64,
    /// Most recent address the user connected from, when known.
    pub last_ip: Option<IpAddr>,
    /// When the stats were captured.
    pub fetched_at: DateTime<Utc>,
}

/// Where a shared file physically lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileHost {
    /// On this host's filesystem.
    Local,
    /// On a relay agent reachable through the relay service.
    Relay {
        /// Name of the agent hosting the file.
        agent: String,
    },
}

/// Result of resolving a remote filename against the share index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedFile {
    /// Where the bytes live.
    pub host: FileHost,
    /// Physical path on the hosting machine.
    pub local_path: String,
    /// Size recorded in the share index, in bytes.
    pub size: u64,
}

/// Response payload for a peer's user-info request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserInfo {
    /// Free-form description presented to the peer.
    pub description: String,
    /// Upload slots granted to the requesting peer's group.
    pub upload_slots: u32,
    /// Uploads currently queued ahead of a hypothetical new request.
    pub queue_length: u32,
    /// Whether a slot is free right now.
    pub has_free_upload_slot: bool,
    /// Optional picture bytes.
    pub picture: Option<Vec<u8>>,
}

/// A single shared file, as presented in browse and search responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedFile {
    /// Filename in the remote-path form peers address.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// A shared directory and its files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedDirectory {
    /// Directory name in remote-path form.
    pub name: String,
    /// Files directly inside the directory.
    pub files: Vec<SharedFile>,
}

/// Request payload for the protocol library's upload operation.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Remote peer receiving the file.
    pub username: String,
    /// Filename exactly as the peer requested it.
    pub remote_path: String,
    /// Size in bytes to announce.
    pub size: u64,
}

/// Callback traffic from the protocol library while an upload runs.
///
/// The library's event callbacks are delivered as messages on a bounded
/// channel; the per-upload lifecycle task is the only consumer, which keeps
/// delivery ordered without extra locking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// Bytes-moved counter advanced.
    Progress {
        /// Total bytes transferred so far.
        bytes_transferred: u64,
    },
    /// The library observed a state transition.
    StateChanged {
        /// Phase after the transition.
        phase: TransferPhase,
        /// Outcome after the transition.
        outcome: TransferOutcome,
    },
}

/// Final report returned by the protocol library when an upload ends.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    /// Terminal phase (always `Completed` for a well-behaved library).
    pub phase: TransferPhase,
    /// Terminal outcome.
    pub outcome: TransferOutcome,
    /// Bytes actually delivered.
    pub bytes_transferred: u64,
    /// Offset the remote requested the transfer to start from.
    pub start_offset: u64,
    /// Achieved speed in bytes per second.
    pub average_speed: f64,
    /// When the library considers the transfer finished.
    pub ended_at: DateTime<Utc>,
}

/// Connection-affecting settings pushed down to the protocol library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientPatch {
    /// New listen port, when changed.
    pub listen_port: Option<u16>,
    /// New server address, when changed.
    pub server_address: Option<String>,
    /// New total upload slot count to advertise, when changed.
    pub upload_slots: Option<u32>,
}

impl ClientPatch {
    /// Whether the patch carries no changes at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.listen_port.is_none() && self.server_address.is_none() && self.upload_slots.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_patch_reports_empty() {
        assert!(ClientPatch::default().is_empty());
        let patch = ClientPatch {
            listen_port: Some(2_234),
            ..ClientPatch::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn file_host_serialises_with_tag() {
        let local = serde_json::to_value(FileHost::Local).expect("serialise");
        assert_eq!(local["type"], "local");
        let relay = serde_json::to_value(FileHost::Relay {
            agent: "attic".to_string(),
        })
        .expect("serialise");
        assert_eq!(relay["type"], "relay");
        assert_eq!(relay["agent"], "attic");
    }
}
