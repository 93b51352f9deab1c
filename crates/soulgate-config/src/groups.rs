//! Scheduler group table derived from an option snapshot.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::{
    DEFAULT_GROUP, GroupOptions, LEECHER_GROUP, Options, PRIVILEGED_GROUP, QueueStrategy,
};

/// One scheduler group: a named class of users with its own slot budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    /// Group name; unique within the table.
    pub name: String,
    /// Scheduling priority; lower is more important.
    pub priority: u32,
    /// Concurrent upload slots for the group.
    pub slots: u32,
    /// Slots currently held by in-flight uploads.
    pub used_slots: u32,
    /// Selection strategy among ready uploads.
    pub strategy: QueueStrategy,
}

/// Build the group table for an option snapshot, carrying live slot usage
/// over from the previous table by name.
///
/// The three built-in groups are always present even when the configuration
/// omits them; the privileged group is pinned to priority 0 with slots equal
/// to the global ceiling. A group that disappeared simply drops out; any
/// uploads still pinned to it return their slots harmlessly into the void.
#[must_use]
pub fn rebuild_groups(
    options: &Options,
    previous_usage: &HashMap<String, u32>,
) -> BTreeMap<String, Group> {
    let mut table = BTreeMap::new();

    let carried = |name: &str| previous_usage.get(name).copied().unwrap_or(0);

    table.insert(
        PRIVILEGED_GROUP.to_string(),
        Group {
            name: PRIVILEGED_GROUP.to_string(),
            priority: 0,
            slots: options.global.upload_slots,
            used_slots: carried(PRIVILEGED_GROUP),
            strategy: options.groups.privileged.strategy,
        },
    );
    table.insert(
        DEFAULT_GROUP.to_string(),
        group_from_options(DEFAULT_GROUP, &options.groups.default, carried(DEFAULT_GROUP)),
    );
    table.insert(
        LEECHER_GROUP.to_string(),
        group_from_options(LEECHER_GROUP, &options.groups.leechers, carried(LEECHER_GROUP)),
    );

    for (name, group) in &options.groups.user_defined {
        table.insert(
            name.clone(),
            Group {
                // Priority 0 is reserved; validation enforces this upstream.
                priority: group.priority.max(1),
                ..group_from_options(name, group, carried(name))
            },
        );
    }

    table
}

fn group_from_options(name: &str, options: &GroupOptions, used_slots: u32) -> Group {
    Group {
        name: name.to_string(),
        priority: options.priority,
        slots: options.upload_slots,
        used_slots,
        strategy: options.strategy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::sample_options;

    #[test]
    fn built_ins_are_always_present() {
        let options = sample_options();
        let table = rebuild_groups(&options, &HashMap::new());
        assert!(table.contains_key(PRIVILEGED_GROUP));
        assert!(table.contains_key(DEFAULT_GROUP));
        assert!(table.contains_key(LEECHER_GROUP));

        let privileged = &table[PRIVILEGED_GROUP];
        assert_eq!(privileged.priority, 0);
        assert_eq!(privileged.slots, options.global.upload_slots);
    }

    #[test]
    fn used_slots_carry_over_by_name() {
        let mut options = sample_options();
        options.groups.user_defined.insert(
            "friends".to_string(),
            GroupOptions {
                upload_slots: 3,
                priority: 2,
                strategy: QueueStrategy::RoundRobin,
                speed_limit_kib: None,
                limits: crate::model::LimitBundle::default(),
                members: vec!["ada".to_string()],
            },
        );

        let mut usage = HashMap::new();
        usage.insert(DEFAULT_GROUP.to_string(), 2);
        usage.insert("friends".to_string(), 1);
        usage.insert("ghosts".to_string(), 4);

        let table = rebuild_groups(&options, &usage);
        assert_eq!(table[DEFAULT_GROUP].used_slots, 2);
        assert_eq!(table["friends"].used_slots, 1);
        assert!(!table.contains_key("ghosts"), "vanished groups drop out");
    }

    #[test]
    fn user_defined_priority_never_reaches_zero() {
        let mut options = sample_options();
        options.groups.user_defined.insert(
            "eager".to_string(),
            GroupOptions {
                upload_slots: 1,
                priority: 0,
                strategy: QueueStrategy::FirstInFirstOut,
                speed_limit_kib: None,
                limits: crate::model::LimitBundle::default(),
                members: Vec::new(),
            },
        );
        let table = rebuild_groups(&options, &HashMap::new());
        assert_eq!(table["eager"].priority, 1);
    }
}
