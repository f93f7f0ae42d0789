//! Live-updatable config cells.
//!
//! Uses `ArcSwap` so the consume path reads config lock-free while the
//! adaptive controller swaps reduced budgets in from its own tick.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// A config cell shared between the consume path and the controller:
/// readers load a point-in-time snapshot without locking, writers publish
/// a whole replacement value.
///
/// Swaps are atomic and apply to subsequent reads only; a consume that
/// already snapshotted the old value completes against it.
#[derive(Debug)]
pub struct LiveConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for LiveConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> LiveConfig<T> {
    /// Wrap an initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Load the current value. The snapshot stays valid across later swaps.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Publish a replacement value.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Publish a value derived from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let cur = self.inner.load_full();
        let new_val = f(&cur);
        self.inner.store(Arc::new(new_val));
    }
}
