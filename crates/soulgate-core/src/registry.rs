//! Cancellation handles for in-flight lifecycle tasks.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Concurrent map of transfer id to cancellation token.
///
/// One entry exists per in-flight lifecycle task, inserted when the task is
/// launched and removed during its cleanup.
#[derive(Default)]
pub struct CancellationRegistry {
    handles: DashMap<Uuid, CancellationToken>,
}

impl CancellationRegistry {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and store a token for a transfer.
    #[must_use]
    pub fn register(&self, id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.handles.insert(id, token.clone());
        token
    }

    /// Drop the handle for a transfer; called from lifecycle cleanup.
    pub fn remove(&self, id: Uuid) {
        self.handles.remove(&id);
    }

    /// Signal the token for a transfer without waiting. Returns whether a
    /// handle was found.
    pub fn try_cancel(&self, id: Uuid) -> bool {
        self.handles.get(&id).is_some_and(|entry| {
            entry.value().cancel();
            true
        })
    }

    /// Signal every registered token; used at shutdown.
    pub fn cancel_all(&self) {
        for entry in &self.handles {
            entry.value().cancel();
        }
    }

    /// Number of in-flight handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no handles are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_cancel_signals_only_known_ids() {
        let registry = CancellationRegistry::new();
        let id = Uuid::new_v4();
        let token = registry.register(id);

        assert!(!registry.try_cancel(Uuid::new_v4()));
        assert!(!token.is_cancelled());

        assert!(registry.try_cancel(id));
        assert!(token.is_cancelled());
    }

    #[test]
    fn remove_drops_the_handle() {
        let registry = CancellationRegistry::new();
        let id = Uuid::new_v4();
        let _token = registry.register(id);
        assert_eq!(registry.len(), 1);

        registry.remove(id);
        assert!(registry.is_empty());
        assert!(!registry.try_cancel(id));
    }

    #[test]
    fn cancel_all_reaches_every_handle() {
        let registry = CancellationRegistry::new();
        let tokens: Vec<_> = (0..3).map(|_| registry.register(Uuid::new_v4())).collect();
        registry.cancel_all();
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }
}
