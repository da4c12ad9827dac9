//! Request-id allocation.

use std::collections::BTreeSet;

use courier_wire::RequestId;

use parking_lot::Mutex;

struct IdPool {
    next: u64,
    recycled: BTreeSet<u64>,
}

/// Allocates the smallest unused positive request id and recycles released
/// ids. Zero is never handed out; it is the reserved invalid id.
pub struct IdManager {
    pool: Mutex<IdPool>,
}

impl Default for IdManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IdManager {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(IdPool {
                next: 1,
                recycled: BTreeSet::new(),
            }),
        }
    }

    /// Allocate an id. The smallest recycled id is preferred over extending
    /// the range.
    pub fn allocate(&self) -> RequestId {
        let mut pool = self.pool.lock();
        if let Some(&id) = pool.recycled.iter().next() {
            pool.recycled.remove(&id);
            return RequestId::new(id);
        }
        let id = pool.next;
        pool.next += 1;
        RequestId::new(id)
    }

    /// Return an id to the pool. Invalid and never-allocated ids are
    /// ignored.
    pub fn release(&self, id: RequestId) {
        let raw = id.raw();
        let mut pool = self.pool.lock();
        if raw == 0 || raw >= pool.next {
            return;
        }
        pool.recycled.insert(raw);
    }
}
