//! Typed option carriers.
//!
//! Pure data; IO and wiring live elsewhere. Every section derives
//! `PartialEq` so snapshots can be diffed by deep equality.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Name of the built-in group for privileged users. Always priority 0.
pub const PRIVILEGED_GROUP: &str = "privileged";
/// Name of the built-in catch-all group.
pub const DEFAULT_GROUP: &str = "default";
/// Name of the built-in group for heuristically classified leechers.
pub const LEECHER_GROUP: &str = "leechers";
/// Classification result for blacklisted users; never schedulable.
pub const BLACKLISTED_GROUP: &str = "blacklisted";

/// Complete option snapshot for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Options {
    /// Friendly instance identifier used in logs and user-info responses.
    #[serde(default)]
    pub instance_name: String,
    /// Settings pushed down to the protocol client connection.
    pub connection: ConnectionOptions,
    /// Shared directory set and filename filters.
    #[serde(default)]
    pub shares: ShareOptions,
    /// Global upload knobs and fallback limits.
    pub global: GlobalUploadOptions,
    /// Built-in and user-defined group definitions.
    #[serde(default)]
    pub groups: GroupsOptions,
    /// Users and networks refused outright.
    #[serde(default)]
    pub blacklist: BlacklistOptions,
    /// Thresholds for the leecher heuristics.
    #[serde(default)]
    pub leechers: LeecherOptions,
    /// Retention knobs for the background janitor.
    #[serde(default)]
    pub retention: RetentionOptions,
}

/// Connection-affecting settings; changes require a reconnect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Server address in `host:port` form.
    pub server_address: String,
    /// Port this daemon listens on for peer connections.
    pub listen_port: u16,
}

/// Shared directory set and filter patterns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ShareOptions {
    /// Directories offered to the network.
    #[serde(default)]
    pub directories: Vec<String>,
    /// Regex patterns excluding files from the share index.
    #[serde(default)]
    pub filters: Vec<String>,
    /// Regex patterns excluding queries from search responses.
    #[serde(default)]
    pub search_filters: Vec<String>,
}

/// Global upload knobs; each group limit field falls back to these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalUploadOptions {
    /// Ceiling across every group's concurrent uploads.
    pub upload_slots: u32,
    /// Default speed budget per group in KiB/s, when a group sets none.
    #[serde(default)]
    pub speed_limit_kib: Option<u32>,
    /// Fallback limit bundle.
    #[serde(default)]
    pub limits: LimitBundle,
}

/// Built-in and user-defined group definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupsOptions {
    /// The catch-all group.
    pub default: GroupOptions,
    /// The reduced-service group for leechers.
    pub leechers: GroupOptions,
    /// Knobs for the privileged group; slots and priority are pinned.
    #[serde(default)]
    pub privileged: BuiltInGroupOptions,
    /// Operator-defined groups, priority ≥ 1.
    #[serde(default)]
    pub user_defined: BTreeMap<String, GroupOptions>,
}

impl Default for GroupsOptions {
    fn default() -> Self {
        Self {
            default: GroupOptions {
                upload_slots: 1,
                priority: 1,
                strategy: QueueStrategy::FirstInFirstOut,
                speed_limit_kib: None,
                limits: LimitBundle::default(),
                members: Vec::new(),
            },
            leechers: GroupOptions {
                upload_slots: 1,
                priority: 99,
                strategy: QueueStrategy::RoundRobin,
                speed_limit_kib: None,
                limits: LimitBundle::default(),
                members: Vec::new(),
            },
            privileged: BuiltInGroupOptions::default(),
            user_defined: BTreeMap::new(),
        }
    }
}

/// One group's scheduling and limit knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupOptions {
    /// Concurrent upload slots for the group.
    pub upload_slots: u32,
    /// Scheduling priority; lower is more important.
    pub priority: u32,
    /// Selection strategy among ready uploads.
    #[serde(default)]
    pub strategy: QueueStrategy,
    /// Speed budget in KiB/s; `None` falls back to the global budget.
    #[serde(default)]
    pub speed_limit_kib: Option<u32>,
    /// Per-scope limits; unset fields fall back to the global bundle.
    #[serde(default)]
    pub limits: LimitBundle,
    /// Usernames pinned to this group; only meaningful for user-defined
    /// groups.
    #[serde(default)]
    pub members: Vec<String>,
}

/// Knobs for built-in groups whose slots/priority are pinned elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BuiltInGroupOptions {
    /// Selection strategy among ready uploads.
    #[serde(default)]
    pub strategy: QueueStrategy,
    /// Speed budget in KiB/s; `None` falls back to the global budget.
    #[serde(default)]
    pub speed_limit_kib: Option<u32>,
}

/// Selection strategy among a group's ready uploads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    /// Strict arrival order by enqueue time.
    #[default]
    FirstInFirstOut,
    /// Rotate across users by readiness order.
    RoundRobin,
}

impl QueueStrategy {
    /// Render the strategy as its lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FirstInFirstOut => "first_in_first_out",
            Self::RoundRobin => "round_robin",
        }
    }
}

impl FromStr for QueueStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_in_first_out" | "fifo" => Ok(Self::FirstInFirstOut),
            "round_robin" => Ok(Self::RoundRobin),
            other => Err(format!("invalid queue strategy '{other}'")),
        }
    }
}

/// Per-scope limits for one group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LimitBundle {
    /// Limits on what may sit in the queue at once.
    #[serde(default)]
    pub queued: Limits,
    /// Limits on what may start within a trailing day.
    #[serde(default)]
    pub daily: Limits,
    /// Limits on what may start within a trailing week.
    #[serde(default)]
    pub weekly: Limits,
}

/// Individual limit fields; any unset field falls back to the global value
/// for the same scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Limits {
    /// Maximum file count.
    #[serde(default)]
    pub files: Option<u64>,
    /// Maximum megabytes.
    #[serde(default)]
    pub megabytes: Option<u64>,
    /// Maximum failed transfers.
    #[serde(default)]
    pub failures: Option<u64>,
}

impl Limits {
    /// Whether no field is set at all.
    #[must_use]
    pub const fn is_unset(&self) -> bool {
        self.files.is_none() && self.megabytes.is_none() && self.failures.is_none()
    }

    /// Per-field fallback onto another limit set.
    #[must_use]
    pub const fn or(self, fallback: Self) -> Self {
        Self {
            files: match self.files {
                Some(value) => Some(value),
                None => fallback.files,
            },
            megabytes: match self.megabytes {
                Some(value) => Some(value),
                None => fallback.megabytes,
            },
            failures: match self.failures {
                Some(value) => Some(value),
                None => fallback.failures,
            },
        }
    }
}

/// Users and networks refused outright.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BlacklistOptions {
    /// Usernames refused by name.
    #[serde(default)]
    pub usernames: Vec<String>,
    /// CIDR blocks refused by address.
    #[serde(default)]
    pub cidrs: Vec<String>,
}

/// Thresholds for the leecher heuristics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeecherOptions {
    /// Users sharing fewer files than this are leechers.
    pub minimum_shared_files: u64,
    /// Users sharing fewer directories than this are leechers.
    pub minimum_shared_directories: u64,
}

impl Default for LeecherOptions {
    fn default() -> Self {
        Self {
            minimum_shared_files: 1,
            minimum_shared_directories: 1,
        }
    }
}

/// Retention knobs for the background janitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RetentionOptions {
    /// Age in minutes after which terminal uploads are soft-deleted; `None`
    /// disables the janitor.
    #[serde(default)]
    pub prune_age_minutes: Option<i64>,
}

/// Validate an option snapshot before it is applied.
///
/// # Errors
///
/// Returns an error when a share filter fails to compile, a user-defined
/// group reuses a built-in name, or a user-defined group claims priority 0.
pub fn validate_options(options: &Options) -> ConfigResult<()> {
    for pattern in options
        .shares
        .filters
        .iter()
        .chain(options.shares.search_filters.iter())
    {
        regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidFilter {
            pattern: pattern.clone(),
            source,
        })?;
    }

    for (name, group) in &options.groups.user_defined {
        if [PRIVILEGED_GROUP, DEFAULT_GROUP, LEECHER_GROUP, BLACKLISTED_GROUP]
            .contains(&name.as_str())
        {
            return Err(ConfigError::InvalidGroup {
                name: name.clone(),
                reason: "name collides with a built-in group".to_string(),
            });
        }
        if group.priority == 0 {
            return Err(ConfigError::InvalidGroup {
                name: name.clone(),
                reason: "priority 0 is reserved for the privileged group".to_string(),
            });
        }
    }

    Ok(())
}
