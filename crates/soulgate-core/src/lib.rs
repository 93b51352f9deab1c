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

//! Upload orchestration: admission, scheduling, pacing, and the per-upload
//! lifecycle.
//!
//! For every remotely initiated file request this crate decides whether it
//! may be enqueued, when it may start, how its bytes are paced out, and how
//! completion or failure is persisted. Wrong answers here cost the operator
//! their standing on the network, so the scheduler and admission paths are
//! deliberately small, synchronous state machines behind coarse locks, with
//! all waiting pushed onto promises and tokens.

mod admission;
mod classifier;
mod context;
mod error;
mod governor;
mod lifecycle;
mod limits;
mod queue;
mod registry;

pub use admission::{GENERIC_REJECTION, NOT_SHARED_REJECTION, UploadService, UploadServiceDeps};
pub use classifier::UserClassifier;
pub use context::CoreContext;
pub use error::{CoreError, CoreResult};
pub use governor::Governor;
pub use lifecycle::{UploadRunner, UploadRunnerDeps};
pub use limits::{LimitScope, effective_limits, evaluate_scope};
pub use queue::{GroupResolver, UploadQueue};
pub use registry::CancellationRegistry;
