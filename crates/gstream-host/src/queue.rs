//! Virtual queue bookkeeping.
//!
//! A guest may create more queues than the hardware exposes; every virtual
//! queue resolves to the same physical one. Submissions racing in from
//! different virtual queues serialize on a per-physical-queue lock so the
//! driver only ever sees one submission at a time per hardware queue.

use std::sync::Arc;

use dashmap::DashMap;
use gstream_protocol::handle::BoxedHandle;
use parking_lot::Mutex;

#[derive(Default)]
pub struct QueueTable {
    /// (device boxed, family, index) -> boxed queue, so repeated
    /// GetDeviceQueue calls return the same handle.
    by_index: DashMap<(BoxedHandle, u32, u32), BoxedHandle>,
    /// Boxed queue -> owning boxed device, for wait-idle bookkeeping.
    device_of: DashMap<BoxedHandle, BoxedHandle>,
    /// Native physical queue -> submit lock.
    locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl QueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn existing(&self, device: BoxedHandle, family: u32, index: u32) -> Option<BoxedHandle> {
        self.by_index.get(&(device, family, index)).map(|q| *q)
    }

    pub fn record(
        &self,
        device: BoxedHandle,
        family: u32,
        index: u32,
        queue: BoxedHandle,
    ) {
        self.by_index.insert((device, family, index), queue);
        self.device_of.insert(queue, device);
    }

    pub fn device_of(&self, queue: BoxedHandle) -> Option<BoxedHandle> {
        self.device_of.get(&queue).map(|d| *d)
    }

    /// The submit lock for a native physical queue.
    pub fn submit_lock(&self, physical_queue: u64) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .locks
                .entry(physical_queue)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    pub fn forget_device(&self, device: BoxedHandle) {
        self.by_index.retain(|&(dev, _, _), _| dev != device);
        self.device_of.retain(|_, dev| *dev != device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_lookups_return_the_same_queue() {
        let table = QueueTable::new();
        table.record(1, 0, 0, 100);
        assert_eq!(table.existing(1, 0, 0), Some(100));
        assert_eq!(table.existing(1, 0, 1), None);
        assert_eq!(table.device_of(100), Some(1));
    }

    #[test]
    fn submit_lock_is_shared_per_physical_queue() {
        let table = QueueTable::new();
        let a = table.submit_lock(42);
        let b = table.submit_lock(42);
        assert!(Arc::ptr_eq(&a, &b));
        let c = table.submit_lock(43);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
