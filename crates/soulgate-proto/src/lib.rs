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
#![allow(unexpected_cfgs)]
#![allow(clippy::multiple_crate_versions)]

//! Collaborator contracts bounding the upload orchestration core.
//!
//! The core sits between three external parties: the Soulseek protocol
//! library (which both invokes the core for incoming peer requests and is
//! invoked by the core to move bytes), the share service that maps remote
//! filenames to local files, and the peer directory that caches per-user
//! network data. This crate holds the traits and DTOs for those seams so
//! the core can be wired against real adapters or test stubs alike.

mod error;
mod model;
mod service;

pub use error::{ProtoError, ProtoResult};
pub use model::{
    ClientPatch, CompletedTransfer, FileHost, InputStream, PeerStats, ResolvedFile,
    SharedDirectory, SharedFile, UploadEvent, UploadRequest, UserInfo,
};
pub use service::{
    InputStreamFactory, PeerDirectory, PeerRequestHandler, RelayService, ShareService, SlotHooks,
    SoulClient, TransferGovernor, UploadHooks,
};
