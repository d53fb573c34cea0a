//! Logical request ids that survive transport-level request recreation.
//!
//! When a redirect makes the transport recreate its own request object,
//! the adapter saves the logical id under the transport's
//! `(routing key, local id)` pair; the recreated request picks it up again
//! with [`IdentityGenerator::generate`].

use crate::request::RequestId;
use std::collections::HashMap;
use tracing::trace;

pub struct IdentityGenerator {
    next_id: u64,
    saved: HashMap<(i32, i32), RequestId>,
}

impl IdentityGenerator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            saved: HashMap::new(),
        }
    }

    /// Id for a transport request. A saved id is consumed; a local id of 0
    /// has no reliable correlation and always gets a fresh id.
    pub fn generate(&mut self, routing_key: i32, transport_local_id: i32) -> RequestId {
        if transport_local_id != 0 {
            if let Some(id) = self.saved.remove(&(routing_key, transport_local_id)) {
                trace!("Reusing {} for ({}, {})", id, routing_key, transport_local_id);
                return id;
            }
        }
        self.fresh()
    }

    pub fn save_id(&mut self, routing_key: i32, transport_local_id: i32, id: RequestId) {
        if transport_local_id == 0 {
            return;
        }
        self.saved.insert((routing_key, transport_local_id), id);
    }

    /// Drop a saved id that will not be consumed.
    pub fn forget(&mut self, routing_key: i32, transport_local_id: i32) {
        self.saved.remove(&(routing_key, transport_local_id));
    }

    pub fn saved_count(&self) -> usize {
        self.saved.len()
    }

    fn fresh(&mut self) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl Default for IdentityGenerator {
    fn default() -> Self {
        Self::new()
    }
}
