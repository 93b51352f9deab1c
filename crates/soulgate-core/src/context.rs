//! Process-wide state handles threaded through the core.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use soulgate_config::Options;

/// Shared handle carrying the option snapshot and the shutdown flag.
///
/// The snapshot is swapped atomically; readers clone an `Arc` and finish
/// their work against whatever snapshot they started with.
pub struct CoreContext {
    options: RwLock<Arc<Options>>,
    shutting_down: AtomicBool,
}

impl CoreContext {
    /// Construct a context holding the startup snapshot.
    #[must_use]
    pub fn new(options: Options) -> Self {
        Self {
            options: RwLock::new(Arc::new(options)),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// The option snapshot currently in force.
    #[must_use]
    pub fn options(&self) -> Arc<Options> {
        self.options
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Replace the option snapshot.
    pub fn set_options(&self, options: Arc<Options>) {
        let mut guard = self
            .options
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = options;
    }

    /// Mark the process as shutting down; persistence from transfer
    /// callbacks is suppressed from here on.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soulgate_config::{
        BlacklistOptions, ConnectionOptions, GlobalUploadOptions, GroupsOptions, LeecherOptions,
        LimitBundle, RetentionOptions, ShareOptions,
    };

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
            leechers: LeecherOptions::default(),
            retention: RetentionOptions::default(),
        }
    }

    #[test]
    fn snapshot_swaps_are_visible() {
        let context = CoreContext::new(sample_options());
        assert_eq!(context.options().global.upload_slots, 2);

        let mut next = sample_options();
        next.global.upload_slots = 9;
        context.set_options(Arc::new(next));
        assert_eq!(context.options().global.upload_slots, 9);
    }

    #[test]
    fn shutdown_flag_latches() {
        let context = CoreContext::new(sample_options());
        assert!(!context.is_shutting_down());
        context.begin_shutdown();
        assert!(context.is_shutting_down());
    }
}
