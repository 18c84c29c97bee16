//! Reference-counted registry of per-namespace backing stores.
//!
//! The flat-file and hash-bucket drivers keep a namespace's data in memory
//! and share it between every driver handle for that namespace. A store is
//! loaded on the first `acquire` and dropped when the last [`Lease`] goes away.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;

struct Slot<T> {
    value: Arc<T>,
    refs: usize,
}

pub(crate) struct SharedRegistry<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
}

impl<T: Send + Sync + 'static> SharedRegistry<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Borrow the store registered under `name`, loading it if needed.
    ///
    /// Concurrent first acquisitions may both run `load`; only one result is
    /// kept.
    pub(crate) async fn acquire<F, Fut>(self: &Arc<Self>, name: &str, load: F) -> Result<Lease<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(lease) = self.try_bump(name) {
            return Ok(lease);
        }

        let loaded = Arc::new(load().await?);

        let mut slots = self.slots.lock();
        let slot = slots.entry(name.to_string()).or_insert_with(|| Slot {
            value: loaded,
            refs: 0,
        });
        slot.refs += 1;
        debug!(name, refs = slot.refs, "Acquired shared store");
        Ok(Lease {
            name: name.to_string(),
            value: Arc::clone(&slot.value),
            registry: Arc::clone(self),
        })
    }

    fn try_bump(self: &Arc<Self>, name: &str) -> Option<Lease<T>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(name)?;
        slot.refs += 1;
        Some(Lease {
            name: name.to_string(),
            value: Arc::clone(&slot.value),
            registry: Arc::clone(self),
        })
    }

    fn release(&self, name: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(name) {
            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs == 0 {
                slots.remove(name);
                debug!(name, "Released shared store");
            }
        }
    }

    /// Stores currently held by at least one lease.
    pub(crate) fn live(&self) -> Vec<(String, Arc<T>)> {
        self.slots
            .lock()
            .iter()
            .map(|(k, slot)| (k.clone(), Arc::clone(&slot.value)))
            .collect()
    }

    /// The live store registered under `name`, without taking a lease.
    pub(crate) fn peek(&self, name: &str) -> Option<Arc<T>> {
        self.slots.lock().get(name).map(|slot| Arc::clone(&slot.value))
    }

    pub(crate) fn ref_count(&self, name: &str) -> usize {
        self.slots.lock().get(name).map(|s| s.refs).unwrap_or(0)
    }
}

/// Shared handle to a registered store; releases its reference on drop.
pub(crate) struct Lease<T: Send + Sync + 'static> {
    name: String,
    value: Arc<T>,
    registry: Arc<SharedRegistry<T>>,
}

impl<T: Send + Sync + 'static> Lease<T> {
    pub(crate) fn shared(&self) -> Arc<T> {
        Arc::clone(&self.value)
    }
}

impl<T: Send + Sync + 'static> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Send + Sync + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        self.registry.release(&self.name);
    }
}
