//! Process-wide collection of attached filter instances.
//!
//! The registry is the sole owner of instances; everything else refers to
//! them by [`InstanceId`]. The guard is a spin mutex so membership lookups
//! stay legal from the restricted packet-dispatch context, and it is only
//! ever held for O(1) bookkeeping: callers clone the `Arc` handle out and
//! do all packet work after the guard is gone.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::filter::{
    error::FilterError,
    instance::{FilterInstance, InstanceId, LifecycleState},
};

pub struct FilterRegistry {
    instances: spin::Mutex<Vec<Arc<FilterInstance>>>,
    next_id: AtomicU64,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            instances: spin::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate and insert a new instance, preserving insertion order.
    ///
    /// The reservation is made before the instance becomes visible, so an
    /// allocation failure leaves the registry exactly as it was.
    pub fn register(
        &self,
        adapter: &str,
        ruleset_version: u64,
    ) -> Result<Arc<FilterInstance>, FilterError> {
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let instance = Arc::new(FilterInstance::new(id, adapter.to_string(), ruleset_version));

        let mut guard = self.instances.lock();
        guard
            .try_reserve(1)
            .map_err(|e| FilterError::Resource {
                reason: format!("registry slot for {adapter}: {e}"),
            })?;
        guard.push(instance.clone());
        Ok(instance)
    }

    /// Remove an instance. Caller contract: both pending counters are zero
    /// (the lifecycle machine guarantees it by requiring `Detached`);
    /// checked here anyway rather than trusted.
    pub fn unregister(&self, id: InstanceId) -> Result<(), FilterError> {
        let mut guard = self.instances.lock();
        let index = guard
            .iter()
            .position(|inst| inst.id() == id)
            .ok_or(FilterError::UnknownInstance { id })?;
        let instance = &guard[index];
        if instance.pending_send() != 0 || instance.pending_recv() != 0 {
            return Err(FilterError::State {
                id,
                from: instance.state(),
                attempted: "unregister with packets outstanding",
            });
        }
        if instance.state() != LifecycleState::Detached {
            return Err(FilterError::State {
                id,
                from: instance.state(),
                attempted: "unregister",
            });
        }
        guard.remove(index);
        Ok(())
    }

    /// Remove a half-constructed instance on the attach failure path,
    /// regardless of its state. Never used once an attach has completed.
    pub(crate) fn rollback(&self, id: InstanceId) {
        let mut guard = self.instances.lock();
        guard.retain(|inst| inst.id() != id);
    }

    /// O(1) guard hold: find the handle and get out.
    pub fn get(&self, id: InstanceId) -> Option<Arc<FilterInstance>> {
        let guard = self.instances.lock();
        guard.iter().find(|inst| inst.id() == id).cloned()
    }

    /// Snapshot of the current membership in insertion order. Control path
    /// only; the clone keeps the visitor outside the guard.
    pub fn snapshot(&self) -> Vec<Arc<FilterInstance>> {
        self.instances.lock().clone()
    }

    /// Read-only visit over all instances, control path only.
    pub fn for_each(&self, mut visitor: impl FnMut(&FilterInstance)) {
        for instance in self.snapshot() {
            visitor(&instance);
        }
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_preserves_insertion_order() {
        let registry = FilterRegistry::new();
        let a = registry.register("eth0", 0).unwrap();
        let b = registry.register("eth1", 0).unwrap();
        let c = registry.register("wlan0", 0).unwrap();

        let order: Vec<_> = registry
            .snapshot()
            .iter()
            .map(|inst| inst.adapter().to_string())
            .collect();
        assert_eq!(order, vec!["eth0", "eth1", "wlan0"]);
        assert!(a.id() < b.id() && b.id() < c.id());
    }

    #[test]
    fn get_returns_registered_handle() {
        let registry = FilterRegistry::new();
        let inst = registry.register("eth0", 3).unwrap();
        let found = registry.get(inst.id()).unwrap();
        assert_eq!(found.adapter(), "eth0");
        assert_eq!(found.ruleset_version(), 3);
        assert!(registry.get(InstanceId(999)).is_none());
    }

    #[test]
    fn unregister_requires_detached() {
        let registry = FilterRegistry::new();
        let inst = registry.register("eth0", 0).unwrap();
        let err = registry.unregister(inst.id()).unwrap_err();
        assert!(matches!(err, FilterError::State { .. }));

        inst.complete_attach().unwrap();
        inst.detach().unwrap();
        registry.unregister(inst.id()).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.unregister(inst.id()),
            Err(FilterError::UnknownInstance { .. })
        ));
    }
}
