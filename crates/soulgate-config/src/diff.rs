//! Deep-equality diffing between option snapshots.

use crate::model::Options;

/// One changed top-level field, tagged with its application requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedField {
    /// Stable field identifier.
    pub field: &'static str,
    /// The process must be restarted for the change to fully apply.
    pub requires_restart: bool,
    /// The protocol client must reconnect for the change to fully apply.
    pub requires_reconnect: bool,
}

/// Outcome of diffing two option snapshots.
#[derive(Debug, Clone, Default)]
pub struct OptionsDiff {
    /// Every changed field in schema order.
    pub changes: Vec<ChangedField>,
}

impl OptionsDiff {
    /// Whether nothing changed. Duplicate change notifications are common,
    /// so callers short-circuit on this.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Whether any changed field needs a process restart.
    #[must_use]
    pub fn requires_restart(&self) -> bool {
        self.changes.iter().any(|change| change.requires_restart)
    }

    /// Whether any changed field needs a client reconnect.
    #[must_use]
    pub fn requires_reconnect(&self) -> bool {
        self.changes.iter().any(|change| change.requires_reconnect)
    }

    /// Whether a named field changed.
    #[must_use]
    pub fn changed(&self, field: &str) -> bool {
        self.changes.iter().any(|change| change.field == field)
    }

    /// Whether the shared-directory set changed, so a rescan is pending.
    #[must_use]
    pub fn rescan_shares(&self) -> bool {
        self.changed("shares.directories")
    }

    /// Whether filter regexes changed and need recompiling.
    #[must_use]
    pub fn recompile_filters(&self) -> bool {
        self.changed("shares.filters") || self.changed("shares.search_filters")
    }

    /// Whether the scheduler group table must be rebuilt.
    #[must_use]
    pub fn rebuild_groups(&self) -> bool {
        self.changed("groups") || self.changed("global.upload_slots")
    }

    /// Whether governor buckets must be rebuilt.
    #[must_use]
    pub fn rebuild_buckets(&self) -> bool {
        self.changed("groups") || self.changed("global.speed_limit_kib")
    }
}

macro_rules! compare {
    ($diff:expr, $old:expr, $new:expr, $field:literal, restart: $restart:expr, reconnect: $reconnect:expr) => {
        if $old != $new {
            $diff.changes.push(ChangedField {
                field: $field,
                requires_restart: $restart,
                requires_reconnect: $reconnect,
            });
        }
    };
}

/// Diff two snapshots field by field.
///
/// The restart/reconnect flags come from a fixed schema: connection fields
/// need a reconnect, the instance name needs a restart (it is baked into the
/// client handshake), everything else applies live.
#[must_use]
pub fn diff(old: &Options, new: &Options) -> OptionsDiff {
    let mut diff = OptionsDiff::default();

    compare!(diff, old.instance_name, new.instance_name, "instance_name",
        restart: true, reconnect: false);
    compare!(diff, old.connection.server_address, new.connection.server_address,
        "connection.server_address", restart: false, reconnect: true);
    compare!(diff, old.connection.listen_port, new.connection.listen_port,
        "connection.listen_port", restart: false, reconnect: true);
    compare!(diff, old.shares.directories, new.shares.directories,
        "shares.directories", restart: false, reconnect: false);
    compare!(diff, old.shares.filters, new.shares.filters,
        "shares.filters", restart: false, reconnect: false);
    compare!(diff, old.shares.search_filters, new.shares.search_filters,
        "shares.search_filters", restart: false, reconnect: false);
    compare!(diff, old.global.upload_slots, new.global.upload_slots,
        "global.upload_slots", restart: false, reconnect: false);
    compare!(diff, old.global.speed_limit_kib, new.global.speed_limit_kib,
        "global.speed_limit_kib", restart: false, reconnect: false);
    compare!(diff, old.global.limits, new.global.limits,
        "global.limits", restart: false, reconnect: false);
    compare!(diff, old.groups, new.groups, "groups", restart: false, reconnect: false);
    compare!(diff, old.blacklist, new.blacklist, "blacklist", restart: false, reconnect: false);
    compare!(diff, old.leechers, new.leechers, "leechers", restart: false, reconnect: false);
    compare!(diff, old.retention, new.retention, "retention", restart: false, reconnect: false);

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::sample_options;

    #[test]
    fn identical_snapshots_produce_an_empty_diff() {
        let options = sample_options();
        let diff = diff(&options, &options.clone());
        assert!(diff.is_empty());
        assert!(!diff.requires_restart());
        assert!(!diff.requires_reconnect());
    }

    #[test]
    fn connection_changes_require_reconnect() {
        let old = sample_options();
        let mut new = old.clone();
        new.connection.listen_port = 2_235;
        let diff = diff(&old, &new);
        assert!(diff.changed("connection.listen_port"));
        assert!(diff.requires_reconnect());
        assert!(!diff.requires_restart());
    }

    #[test]
    fn group_and_slot_changes_flag_rebuilds() {
        let old = sample_options();

        let mut new = old.clone();
        new.global.upload_slots = 20;
        let slots_diff = diff(&old, &new);
        assert!(slots_diff.rebuild_groups());
        assert!(!slots_diff.rebuild_buckets());

        let mut new = old.clone();
        new.groups.default.upload_slots = 5;
        let group_diff = diff(&old, &new);
        assert!(group_diff.rebuild_groups());
        assert!(group_diff.rebuild_buckets());
    }

    #[test]
    fn share_changes_flag_rescan_and_recompile() {
        let old = sample_options();
        let mut new = old.clone();
        new.shares.directories.push("/srv/share".to_string());
        new.shares.filters.push(r"\.tmp$".to_string());
        let diff = diff(&old, &new);
        assert!(diff.rescan_shares());
        assert!(diff.recompile_filters());
    }
}
