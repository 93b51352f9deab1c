//! Pure evaluation of per-group upload limits.
//!
//! The arithmetic is separated from the admission path so it can be tested
//! without a database. The store supplies the summaries; this module decides
//! whether a new request fits and, if not, with which literal wire message
//! it is refused. The exact strings are retryable markers for remote
//! clients, so they must never drift.

use soulgate_config::{
    DEFAULT_GROUP, LEECHER_GROUP, LimitBundle, Limits, Options, PRIVILEGED_GROUP,
};
use soulgate_transfers::TransferSummary;

/// The trailing window a limit scope covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// What currently sits in the queue.
    Queued,
    /// What started within the trailing day.
    Daily,
    /// What started within the trailing week.
    Weekly,
}

impl LimitScope {
    /// Wire-message suffix for the scope.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Queued => "",
            Self::Daily => " today",
            Self::Weekly => " this week",
        }
    }

    /// Window length in hours; `None` for the queued scope.
    #[must_use]
    pub const fn window_hours(self) -> Option<i64> {
        match self {
            Self::Queued => None,
            Self::Daily => Some(24),
            Self::Weekly => Some(24 * 7),
        }
    }
}

/// Effective limit bundle for a group, with each unset field falling back to
/// the global bundle. Returns `None` for the privileged group, which
/// bypasses limit checks entirely.
#[must_use]
pub fn effective_limits(options: &Options, group: &str) -> Option<LimitBundle> {
    if group == PRIVILEGED_GROUP {
        return None;
    }

    let group_bundle = match group {
        DEFAULT_GROUP => Some(&options.groups.default.limits),
        LEECHER_GROUP => Some(&options.groups.leechers.limits),
        other => options
            .groups
            .user_defined
            .get(other)
            .map(|group| &group.limits),
    };
    let global = &options.global.limits;

    Some(group_bundle.map_or_else(
        || global.clone(),
        |bundle| LimitBundle {
            queued: bundle.queued.or(global.queued),
            daily: bundle.daily.or(global.daily),
            weekly: bundle.weekly.or(global.weekly),
        },
    ))
}

/// Check one scope's limits against the observed summaries.
///
/// `counted` covers the non-failed records in scope, `failures` the failed
/// ones, and `incoming_bytes` the size of the request being admitted.
///
/// # Errors
///
/// Returns the literal wire rejection message when a limit is exceeded.
pub fn evaluate_scope(
    scope: LimitScope,
    limits: Limits,
    counted: TransferSummary,
    failures: u64,
    incoming_bytes: u64,
) -> Result<(), String> {
    if let Some(max_failures) = limits.failures
        && failures >= max_failures
    {
        return Err(format!("Too many failed transfers{}", scope.suffix()));
    }
    if let Some(max_files) = limits.files
        && counted.files + 1 > max_files
    {
        return Err(format!("Too many files{}", scope.suffix()));
    }
    if let Some(max_megabytes) = limits.megabytes
        && counted.total_bytes + incoming_bytes > max_megabytes * 1024 * 1024
    {
        return Err(format!("Too many megabytes{}", scope.suffix()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use soulgate_config::{
        BlacklistOptions, ConnectionOptions, GlobalUploadOptions, GroupsOptions, LeecherOptions,
        RetentionOptions, ShareOptions,
    };

    fn options() -> Options {
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
                limits: LimitBundle {
                    queued: Limits {
                        files: Some(100),
                        megabytes: None,
                        failures: None,
                    },
                    daily: Limits::default(),
                    weekly: Limits {
                        files: None,
                        megabytes: Some(2_000),
                        failures: Some(5),
                    },
                },
            },
            groups: GroupsOptions::default(),
            blacklist: BlacklistOptions::default(),
            leechers: LeecherOptions::default(),
            retention: RetentionOptions::default(),
        }
    }

    fn summary(files: u64, total_bytes: u64) -> TransferSummary {
        TransferSummary { files, total_bytes }
    }

    #[test]
    fn privileged_users_bypass_all_limits() {
        assert!(effective_limits(&options(), PRIVILEGED_GROUP).is_none());
    }

    #[test]
    fn unset_group_fields_fall_back_to_global_per_field() {
        let mut options = options();
        options.groups.default.limits.weekly.megabytes = Some(500);

        let bundle = effective_limits(&options, DEFAULT_GROUP).expect("bundle");
        assert_eq!(bundle.weekly.megabytes, Some(500), "group value wins");
        assert_eq!(bundle.weekly.failures, Some(5), "unset field uses global");
        assert_eq!(bundle.queued.files, Some(100));

        let unknown = effective_limits(&options, "unheard-of").expect("bundle");
        assert_eq!(unknown.weekly.megabytes, Some(2_000), "global only");
    }

    #[test]
    fn weekly_megabyte_limit_uses_the_literal_message() {
        let limits = Limits {
            files: None,
            megabytes: Some(1_000),
            failures: None,
        };
        // 990 MB already started this week; a 20 MB request must be refused.
        let result = evaluate_scope(
            LimitScope::Weekly,
            limits,
            summary(12, 990 * 1024 * 1024),
            0,
            20 * 1024 * 1024,
        );
        assert_eq!(result.unwrap_err(), "Too many megabytes this week");

        // A 10 MB request exactly fills the budget and passes.
        let result = evaluate_scope(
            LimitScope::Weekly,
            limits,
            summary(12, 990 * 1024 * 1024),
            0,
            10 * 1024 * 1024,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn file_and_failure_limits_carry_scope_suffixes() {
        let limits = Limits {
            files: Some(3),
            megabytes: None,
            failures: Some(2),
        };

        let queued = evaluate_scope(LimitScope::Queued, limits, summary(3, 0), 0, 0);
        assert_eq!(queued.unwrap_err(), "Too many files");

        let daily = evaluate_scope(LimitScope::Daily, limits, summary(1, 0), 2, 0);
        assert_eq!(daily.unwrap_err(), "Too many failed transfers today");

        let weekly = evaluate_scope(LimitScope::Weekly, limits, summary(0, 0), 9, 0);
        assert_eq!(weekly.unwrap_err(), "Too many failed transfers this week");
    }

    #[test]
    fn unset_limits_admit_everything() {
        let result = evaluate_scope(
            LimitScope::Daily,
            Limits::default(),
            summary(1_000_000, u64::MAX / 2),
            1_000,
            u64::MAX / 4,
        );
        assert!(result.is_ok());
    }
}
