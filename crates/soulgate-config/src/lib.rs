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

//! Typed options for the daemon and the machinery that applies changes to a
//! running process.
//!
//! Options arrive as complete snapshots (the file-format layer lives outside
//! this crate). A change is applied by diffing the snapshot against the
//! previous one, flagging fields that need a restart or a reconnect, and
//! rebuilding derived structures. The most important of those is the
//! scheduler group table, which must carry live slot usage across the swap.

mod diff;
mod error;
mod groups;
mod model;
mod watcher;

pub use diff::{ChangedField, OptionsDiff, diff};
pub use error::{ConfigError, ConfigResult};
pub use groups::{Group, rebuild_groups};
pub use model::{
    BLACKLISTED_GROUP, BlacklistOptions, BuiltInGroupOptions, ConnectionOptions, DEFAULT_GROUP,
    GlobalUploadOptions, GroupOptions, GroupsOptions, LEECHER_GROUP, LeecherOptions, LimitBundle,
    Limits, Options, PRIVILEGED_GROUP, QueueStrategy, RetentionOptions, ShareOptions,
    validate_options,
};
pub use watcher::{AppliedOptions, OptionsWatcher, PendingFlags};
