//! Ordered collection of installed filters.
//!
//! The chain is copy-on-write: every dispatch takes a snapshot, so
//! installing or removing a filter only affects phases dispatched later.

use crate::filter::Filter;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Hook invoked whenever the set of filters changes, e.g. to invalidate a
/// transport-level cache that assumed a fixed filter set.
pub trait ChainObserver: Send + Sync {
    fn chain_changed(&self, filter_count: usize);
}

/// Filters sorted ascending by `(kind, priority)`
pub struct FilterChain {
    filters: ArcSwap<Vec<Arc<dyn Filter>>>,
    observers: Mutex<Vec<Arc<dyn ChainObserver>>>,
}

fn same_filter(a: &Arc<dyn Filter>, b: &Arc<dyn Filter>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl FilterChain {
    pub fn new() -> Self {
        Self {
            filters: ArcSwap::from_pointee(Vec::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Insert a filter, keeping `(kind, priority)` order. Filters with an
    /// equal key keep installation order.
    pub fn install(&self, filter: Arc<dyn Filter>) {
        let key = (filter.kind(), filter.priority());
        self.filters.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            let at = next.partition_point(|f| (f.kind(), f.priority()) <= key);
            next.insert(at, filter.clone());
            next
        });

        info!(
            "Installed filter '{}' ({:?}, priority {})",
            filter.name(),
            filter.kind(),
            filter.priority()
        );
        self.notify();
    }

    /// Remove a filter by identity. Returns false if it was not installed.
    pub fn remove(&self, filter: &Arc<dyn Filter>) -> bool {
        let mut removed = false;
        self.filters.rcu(|current| {
            let next: Vec<Arc<dyn Filter>> = current
                .iter()
                .filter(|f| !same_filter(f, filter))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });

        if removed {
            info!("Removed filter '{}'", filter.name());
            self.notify();
        } else {
            debug!("Filter '{}' was not installed", filter.name());
        }
        removed
    }

    /// Current filters in chain order. The snapshot is unaffected by later
    /// mutations.
    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn Filter>>> {
        self.filters.load_full()
    }

    pub fn len(&self) -> usize {
        self.filters.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_observer(&self, observer: Arc<dyn ChainObserver>) {
        self.observers.lock().push(observer);
    }

    fn notify(&self) {
        let count = self.len();
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.chain_changed(count);
        }
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}
