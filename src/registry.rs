//! Tracking the set of kernels a process has started, keyed by opaque IDs.
//!
//! Grounded on `state.rs`'s `State { kernels: DashMap<String, RemoteKernel> }`
//! (the concurrent map of running kernels a Tauri command handler looks
//! kernels up in), generalized to key by [`EntityId`] instead of a bare
//! `String` session id, matching [`crate::entity::Entity::Kernel`].

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::entity::{Entity, EntityId};
use crate::supervisor::KernelSupervisor;

/// A tracked kernel: its registry id and the supervisor owning its
/// subprocess and channels. `supervisor` is behind a `Mutex` since
/// `start`/`stop`/`restart` all need `&mut KernelSupervisor`, but the
/// registry only ever hands out shared `Arc<KernelHandle>`s.
pub struct KernelHandle {
    id: EntityId,
    supervisor: Mutex<KernelSupervisor>,
}

impl KernelHandle {
    /// The registry id this kernel was created with.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Lock the supervisor for exclusive access (start/stop/restart).
    pub async fn supervisor(&self) -> tokio::sync::MutexGuard<'_, KernelSupervisor> {
        self.supervisor.lock().await
    }
}

/// The set of kernels a process has started, addressable by [`EntityId`].
#[derive(Default)]
pub struct KernelRegistry {
    kernels: DashMap<EntityId, Arc<KernelHandle>>,
}

impl KernelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly built supervisor under a freshly generated id,
    /// returning a shared handle to it.
    pub fn create(&self, supervisor: KernelSupervisor) -> Arc<KernelHandle> {
        let id = EntityId::new(Entity::Kernel);
        let handle = Arc::new(KernelHandle {
            id,
            supervisor: Mutex::new(supervisor),
        });
        self.kernels.insert(id, handle.clone());
        handle
    }

    /// Look up a tracked kernel by id.
    pub fn get(&self, id: &EntityId) -> Option<Arc<KernelHandle>> {
        self.kernels.get(id).map(|entry| entry.clone())
    }

    /// Stop tracking a kernel, returning its handle if it was present. Does
    /// not stop the kernel itself; callers that want a clean shutdown
    /// should call [`KernelSupervisor::stop`] through the handle first.
    pub fn remove(&self, id: &EntityId) -> Option<Arc<KernelHandle>> {
        self.kernels.remove(id).map(|(_, handle)| handle)
    }

    /// List the ids of every tracked kernel.
    pub fn list(&self) -> Vec<EntityId> {
        self.kernels.iter().map(|entry| *entry.key()).collect()
    }

    /// How many kernels are currently tracked.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether no kernels are currently tracked.
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::KernelSpec;
    use crate::supervisor::TokioProcessLauncher;
    use crate::transport::ZmqChannelTransport;

    fn test_spec() -> KernelSpec {
        serde_json::from_value(serde_json::json!({
            "argv": ["python3", "-m", "ipykernel_launcher", "-f", "{connection_file}"],
            "display_name": "Python 3",
            "language": "python",
        }))
        .unwrap()
    }

    fn test_supervisor() -> KernelSupervisor {
        KernelSupervisor::new(
            test_spec(),
            None,
            std::env::temp_dir().join("kp-registry-test-conn.json"),
            Box::new(TokioProcessLauncher),
            Box::new(ZmqChannelTransport),
        )
    }

    #[test]
    fn create_then_get_then_remove_round_trips() {
        let registry = KernelRegistry::new();
        let handle = registry.create(test_supervisor());
        let id = handle.id();

        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());

        let removed = registry.remove(&id);
        assert!(removed.is_some());
        assert!(registry.is_empty());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn list_reflects_tracked_kernels() {
        let registry = KernelRegistry::new();
        let a = registry.create(test_supervisor()).id();
        let b = registry.create(test_supervisor()).id();

        let mut ids = registry.list();
        ids.sort_by_key(|id| id.to_string());
        let mut expected = vec![a, b];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(ids, expected);
    }
}
