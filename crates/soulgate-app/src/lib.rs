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

//! Composition root for the upload orchestration daemon.
//!
//! The protocol client, share index, and peer directory are external
//! collaborators; an embedding binary constructs its adapters for them and
//! hands them to [`Daemon::start`]. Everything inside the boundary
//! (persistence, scheduling, pacing, admission, reconfiguration, shutdown)
//! is wired here.

mod bootstrap;
mod daemon;
mod error;

pub use bootstrap::{
    DATABASE_URL_ENV, OPTIONS_PATH_ENV, bootstrap_from_env, connect_store, load_options,
};
pub use daemon::{Collaborators, Daemon};
pub use error::{AppError, AppResult};
