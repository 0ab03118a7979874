//! Bookkeeping of intentionally running containers.
//!
//! Every container is registered before it is launched and unregistered
//! when it is closed. Anything the isolation runtime reports as running
//! that is not in here has leaked.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stepbox_common::types::ContainerName;

/// Set of container names this process wants running.
///
/// Cloning yields another handle to the same set.
#[derive(Debug, Clone, Default)]
pub struct WantedRegistry {
    names: Arc<Mutex<HashSet<String>>>,
}

impl WantedRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a container as wanted.
    pub fn insert(&self, name: &ContainerName) {
        let _ = self.lock().insert(name.as_str().to_owned());
    }

    /// Marks a container as no longer wanted.
    pub fn remove(&self, name: &ContainerName) {
        let _ = self.lock().remove(name.as_str());
    }

    /// Whether a container with this name is wanted.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    /// Number of wanted containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no container is wanted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove() {
        let registry = WantedRegistry::new();
        let name = ContainerName::new("play_run_0000beef");
        registry.insert(&name);
        assert!(registry.contains("play_run_0000beef"));
        assert_eq!(registry.len(), 1);

        registry.remove(&name);
        assert!(!registry.contains("play_run_0000beef"));
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_unknown_name_is_harmless() {
        let registry = WantedRegistry::new();
        registry.remove(&ContainerName::new("play_run_missing"));
        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let registry = WantedRegistry::new();
        let other = registry.clone();
        registry.insert(&ContainerName::new("play_run_a"));
        assert!(other.contains("play_run_a"));
    }
}
