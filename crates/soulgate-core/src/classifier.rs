//! Maps a username to a scheduler group using cached peer data.

use std::net::IpAddr;
use std::sync::Arc;

use soulgate_config::{
    BLACKLISTED_GROUP, DEFAULT_GROUP, LEECHER_GROUP, Options, PRIVILEGED_GROUP,
};
use soulgate_proto::{PeerDirectory, PeerStats};
use tracing::debug;

use crate::context::CoreContext;
use crate::queue::GroupResolver;

/// Classifies users into groups by the ordered rules: blacklist,
/// user-defined membership, privilege, leecher heuristics, default.
pub struct UserClassifier {
    context: Arc<CoreContext>,
    directory: Arc<dyn PeerDirectory>,
}

impl UserClassifier {
    /// Construct a classifier over the shared context and peer directory.
    #[must_use]
    pub fn new(context: Arc<CoreContext>, directory: Arc<dyn PeerDirectory>) -> Self {
        Self { context, directory }
    }

    /// Classify a user, fetching peer stats on a cache miss.
    ///
    /// A failed fetch demotes nobody: the user lands in the default group
    /// until stats arrive.
    pub async fn classify(&self, username: &str, ip: Option<IpAddr>) -> String {
        let options = self.context.options();
        if let Some(group) = self.classify_without_stats(&options, username, ip) {
            return group;
        }

        match self.directory.stats(username).await {
            Ok(stats) => classify_by_stats(&options, &stats),
            Err(error) => {
                debug!(username, %error, "peer stats unavailable; classifying as default");
                DEFAULT_GROUP.to_string()
            }
        }
    }

    /// Classify a user from cached data only; never touches the network.
    ///
    /// Hot paths (search, user-info, place-in-queue resolvers and the
    /// scheduler itself) use this form.
    #[must_use]
    pub fn classify_cached(&self, username: &str) -> String {
        let options = self.context.options();
        if let Some(group) = self.classify_without_stats(&options, username, None) {
            return group;
        }

        self.directory.cached_stats(username).map_or_else(
            || DEFAULT_GROUP.to_string(),
            |stats| classify_by_stats(&options, &stats),
        )
    }

    /// Whether the user is refused outright.
    #[must_use]
    pub fn is_blacklisted(&self, username: &str, ip: Option<IpAddr>) -> bool {
        let options = self.context.options();
        options
            .blacklist
            .usernames
            .iter()
            .any(|name| name == username)
            || self.directory.is_blacklisted(username, ip)
    }

    /// Ensure the user is on the watch list so stats stay fresh. Returns
    /// whether a new subscription was created.
    pub async fn ensure_watched(&self, username: &str) -> bool {
        if self.directory.is_watched(username) {
            return false;
        }
        match self.directory.watch(username).await {
            Ok(()) => true,
            Err(error) => {
                debug!(username, %error, "failed to watch user");
                false
            }
        }
    }

    fn classify_without_stats(
        &self,
        options: &Options,
        username: &str,
        ip: Option<IpAddr>,
    ) -> Option<String> {
        if self.is_blacklisted(username, ip) {
            return Some(BLACKLISTED_GROUP.to_string());
        }
        options
            .groups
            .user_defined
            .iter()
            .find(|(_, group)| group.members.iter().any(|member| member == username))
            .map(|(name, _)| name.clone())
    }
}

fn classify_by_stats(options: &Options, stats: &PeerStats) -> String {
    if stats.privileged {
        return PRIVILEGED_GROUP.to_string();
    }
    if stats.shared_file_count < options.leechers.minimum_shared_files
        || stats.shared_directory_count < options.leechers.minimum_shared_directories
    {
        return LEECHER_GROUP.to_string();
    }
    DEFAULT_GROUP.to_string()
}

impl GroupResolver for UserClassifier {
    fn resolve_group(&self, username: &str) -> String {
        self.classify_cached(username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use soulgate_config::{
        BlacklistOptions, ConnectionOptions, GlobalUploadOptions, GroupOptions, GroupsOptions,
        LeecherOptions, LimitBundle, QueueStrategy, RetentionOptions, ShareOptions,
    };
    use soulgate_proto::{ProtoError, ProtoResult};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn sample_options() -> Options {
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
                limits: LimitBundle::default(),
            },
            groups: GroupsOptions::default(),
            blacklist: BlacklistOptions::default(),
            leechers: LeecherOptions {
                minimum_shared_files: 10,
                minimum_shared_directories: 2,
            },
            retention: RetentionOptions::default(),
        }
    }

    fn stats(username: &str, privileged: bool, files: u64, directories: u64) -> PeerStats {
        PeerStats {
            username: username.to_string(),
            privileged,
            average_speed: 0,
            upload_count: 0,
            shared_file_count: files,
            shared_directory_count: directories,
            last_ip: None,
            fetched_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct StubDirectory {
        stats: Mutex<HashMap<String, PeerStats>>,
        blacklisted: Vec<String>,
        watched: Mutex<Vec<String>>,
    }

    impl StubDirectory {
        fn with_stats(entries: Vec<PeerStats>) -> Self {
            let mut map = HashMap::new();
            for entry in entries {
                map.insert(entry.username.clone(), entry);
            }
            Self {
                stats: Mutex::new(map),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl PeerDirectory for StubDirectory {
        async fn stats(&self, username: &str) -> ProtoResult<PeerStats> {
            self.cached_stats(username)
                .ok_or(ProtoError::NotFound { what: "user" })
        }

        fn cached_stats(&self, username: &str) -> Option<PeerStats> {
            self.stats
                .lock()
                .expect("stats lock")
                .get(username)
                .cloned()
        }

        fn is_blacklisted(&self, username: &str, _ip: Option<IpAddr>) -> bool {
            self.blacklisted.iter().any(|name| name == username)
        }

        async fn watch(&self, username: &str) -> ProtoResult<()> {
            self.watched
                .lock()
                .expect("watched lock")
                .push(username.to_string());
            Ok(())
        }

        fn is_watched(&self, username: &str) -> bool {
            self.watched
                .lock()
                .expect("watched lock")
                .iter()
                .any(|name| name == username)
        }
    }

    fn classifier_with(
        options: Options,
        directory: StubDirectory,
    ) -> (UserClassifier, Arc<CoreContext>) {
        let context = Arc::new(CoreContext::new(options));
        let classifier = UserClassifier::new(context.clone(), Arc::new(directory));
        (classifier, context)
    }

    #[tokio::test]
    async fn rules_apply_in_order() {
        let mut options = sample_options();
        options.blacklist.usernames.push("banned".to_string());
        options.groups.user_defined.insert(
            "friends".to_string(),
            GroupOptions {
                upload_slots: 1,
                priority: 1,
                strategy: QueueStrategy::FirstInFirstOut,
                speed_limit_kib: None,
                limits: LimitBundle::default(),
                members: vec!["pal".to_string()],
            },
        );

        let directory = StubDirectory::with_stats(vec![
            stats("vip", true, 0, 0),
            stats("hoarder", false, 500, 20),
            stats("moocher", false, 2, 0),
            // A privileged friend still lands in the friends group.
            stats("pal", true, 0, 0),
        ]);
        let (classifier, _context) = classifier_with(options, directory);

        assert_eq!(classifier.classify("banned", None).await, BLACKLISTED_GROUP);
        assert_eq!(classifier.classify("pal", None).await, "friends");
        assert_eq!(classifier.classify("vip", None).await, PRIVILEGED_GROUP);
        assert_eq!(classifier.classify("hoarder", None).await, DEFAULT_GROUP);
        assert_eq!(classifier.classify("moocher", None).await, LEECHER_GROUP);
    }

    #[tokio::test]
    async fn failed_stat_fetch_defaults() {
        let (classifier, _context) = classifier_with(sample_options(), StubDirectory::default());
        assert_eq!(classifier.classify("stranger", None).await, DEFAULT_GROUP);
        assert_eq!(classifier.classify_cached("stranger"), DEFAULT_GROUP);
    }

    #[tokio::test]
    async fn group_changes_take_effect_on_next_classification() {
        let directory = StubDirectory::with_stats(vec![stats("drifter", false, 100, 10)]);
        let (classifier, context) = classifier_with(sample_options(), directory);
        assert_eq!(classifier.classify_cached("drifter"), DEFAULT_GROUP);

        let mut options = sample_options();
        options.groups.user_defined.insert(
            "vips".to_string(),
            GroupOptions {
                upload_slots: 1,
                priority: 1,
                strategy: QueueStrategy::FirstInFirstOut,
                speed_limit_kib: None,
                limits: LimitBundle::default(),
                members: vec!["drifter".to_string()],
            },
        );
        context.set_options(Arc::new(options));
        assert_eq!(classifier.classify_cached("drifter"), "vips");
    }

    #[tokio::test]
    async fn ensure_watched_is_idempotent() {
        let (classifier, _context) = classifier_with(sample_options(), StubDirectory::default());
        assert!(classifier.ensure_watched("alice").await);
        assert!(!classifier.ensure_watched("alice").await);
    }
}
