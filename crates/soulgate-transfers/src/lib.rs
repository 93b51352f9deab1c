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
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Persistence layer for upload and download records.
//!
//! Every accepted transfer gets one durable row; superseded and pruned rows
//! are soft-deleted so history and limit accounting survive. The store is the
//! single shared mutable resource across users; isolation comes from the
//! database.

mod model;
mod store;

pub use model::{Transfer, TransferFilter, TransferSummary};
pub use store::{SHUTDOWN_EXCEPTION, TransferStore};
