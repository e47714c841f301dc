//! Boxed handle registry.
//!
//! Every object the host creates on behalf of a guest is *boxed*: the native
//! driver handle goes into a registry slot and the guest only ever sees the
//! slot's opaque u64. Slot values encode a generation so that a stale handle
//! kept by a buggy guest resolves to nothing instead of to whatever object
//! later reuses the slot. The first [`FAST_PATH_CAPACITY`] slots live in a
//! preallocated slab; beyond that, entries spill into a hash map.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use gstream_protocol::handle::{BoxedHandle, HandleTag, NULL_HANDLE, VIRTUAL_QUEUE_BIT};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::warn;

/// Slots served from the preallocated slab before spilling to the map.
pub const FAST_PATH_CAPACITY: usize = 16384;

/// A freed slot index is not reused until this many further frees have
/// happened, so a use-after-free by the guest surfaces as a lookup miss
/// rather than as a hit on an unrelated object.
pub const N_GRACE: usize = 256;

/// Overflow handles carry this bit; slab handles never reach it because the
/// slab index fits in 32 bits.
const OVERFLOW_BIT: u64 = 1 << 62;

/// Per-handle order maintenance. Guest threads stamp commands against an
/// ordered handle with a strictly increasing sequence number; the decoder
/// parks here until every predecessor has completed.
pub struct OrderInfo {
    last: Mutex<u32>,
    cond: Condvar,
}

impl OrderInfo {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Block until all sequence numbers below `seq` have completed.
    /// Sequence 0 means "unordered" and never waits.
    pub fn wait_for_turn(&self, seq: u32) {
        if seq == 0 {
            return;
        }
        let mut last = self.last.lock();
        while *last != seq - 1 {
            self.cond.wait(&mut last);
        }
    }

    /// Mark `seq` complete and wake any decoder thread parked on a
    /// successor.
    pub fn complete(&self, seq: u32) {
        if seq == 0 {
            return;
        }
        let mut last = self.last.lock();
        *last = seq;
        self.cond.notify_all();
    }

    pub fn last_completed(&self) -> u32 {
        *self.last.lock()
    }
}

impl Default for OrderInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// What a registry slot holds.
#[derive(Clone)]
pub struct HandleInfo {
    pub underlying: u64,
    pub tag: HandleTag,
    pub order: Option<Arc<OrderInfo>>,
}

struct Slot {
    generation: u32,
    info: HandleInfo,
}

struct DelayedRemove {
    boxed: BoxedHandle,
    callback: Box<dyn FnOnce() + Send>,
}

struct Inner {
    slab: Vec<Option<Slot>>,
    next_index: usize,
    /// Freed slots queued for reuse as `(index, next_generation)`.
    free: VecDeque<(usize, u32)>,
    overflow: HashMap<u64, HandleInfo>,
    next_overflow: u64,
    /// underlying -> boxed, for translating driver-produced handles back.
    reverse: HashMap<u64, BoxedHandle>,
    /// Boxed values to hand out verbatim during snapshot restore.
    replay: VecDeque<BoxedHandle>,
}

pub struct HandleRegistry {
    inner: RwLock<Inner>,
    delayed: Mutex<HashMap<BoxedHandle, Vec<DelayedRemove>>>,
}

fn slab_handle(index: usize, generation: u32) -> BoxedHandle {
    ((generation as u64) << 32) | (index as u64 + 1)
}

fn decode_slab(boxed: BoxedHandle) -> Option<(usize, u32)> {
    if boxed == NULL_HANDLE || boxed & OVERFLOW_BIT != 0 {
        return None;
    }
    let index = (boxed & 0xFFFF_FFFF) as usize;
    let generation = ((boxed >> 32) & 0x3FFF_FFFF) as u32;
    if index == 0 || generation == 0 {
        return None;
    }
    Some((index - 1, generation))
}

impl HandleRegistry {
    pub fn new() -> Self {
        let mut slab = Vec::with_capacity(FAST_PATH_CAPACITY);
        slab.resize_with(FAST_PATH_CAPACITY, || None);
        Self {
            inner: RwLock::new(Inner {
                slab,
                next_index: 0,
                free: VecDeque::new(),
                overflow: HashMap::new(),
                next_overflow: 1,
                reverse: HashMap::new(),
                replay: VecDeque::new(),
            }),
            delayed: Mutex::new(HashMap::new()),
        }
    }

    /// Box a native handle. Ordered tags get fresh order info.
    pub fn new_boxed(&self, underlying: u64, tag: HandleTag) -> BoxedHandle {
        let order = tag.is_ordered().then(|| Arc::new(OrderInfo::new()));
        self.insert(HandleInfo {
            underlying,
            tag,
            order,
        })
    }

    fn insert(&self, info: HandleInfo) -> BoxedHandle {
        let underlying = info.underlying;
        let mut inner = self.inner.write();

        if let Some(boxed) = inner.replay.pop_front() {
            match decode_slab(boxed) {
                Some((index, generation)) => {
                    inner.slab[index] = Some(Slot { generation, info });
                    inner.next_index = inner.next_index.max(index + 1);
                }
                None => {
                    inner.overflow.insert(boxed, info);
                    inner.next_overflow =
                        inner.next_overflow.max((boxed & !OVERFLOW_BIT) + 1);
                }
            }
            inner.reverse.insert(underlying, boxed);
            return boxed;
        }

        let boxed = if inner.free.len() > N_GRACE {
            // Reuse is safe only once the grace window has passed.
            let (index, generation) = inner.free.pop_front().unwrap_or((0, 1));
            inner.slab[index] = Some(Slot { generation, info });
            slab_handle(index, generation)
        } else if inner.next_index < FAST_PATH_CAPACITY {
            let index = inner.next_index;
            inner.next_index += 1;
            inner.slab[index] = Some(Slot {
                generation: 1,
                info,
            });
            slab_handle(index, 1)
        } else {
            let key = OVERFLOW_BIT | inner.next_overflow;
            inner.next_overflow += 1;
            inner.overflow.insert(key, info);
            key
        };

        inner.reverse.insert(underlying, boxed);
        boxed
    }

    /// Look up the full slot contents.
    pub fn get(&self, boxed: BoxedHandle) -> Option<HandleInfo> {
        let inner = self.inner.read();
        if boxed & OVERFLOW_BIT != 0 {
            return inner.overflow.get(&boxed).cloned();
        }
        let (index, generation) = decode_slab(boxed)?;
        let slot = inner.slab.get(index)?.as_ref()?;
        if slot.generation != generation {
            return None;
        }
        Some(slot.info.clone())
    }

    /// Unbox a handle whose tag is known from the call site. Returns the
    /// native handle with the virtual-queue bit stripped, or `None` when the
    /// handle does not resolve.
    pub fn try_unbox(&self, boxed: BoxedHandle, tag: HandleTag) -> Option<u64> {
        let info = self.get(boxed)?;
        debug_assert_eq!(info.tag, tag, "boxed {boxed:#x} tag mismatch");
        Some(info.underlying & !VIRTUAL_QUEUE_BIT)
    }

    /// Unbox a dispatchable handle. An unknown dispatchable means the guest
    /// encoder and the host registry have diverged; nothing downstream can
    /// be trusted, so this panics with a diagnostic rather than limping on.
    pub fn unbox_dispatchable(&self, boxed: BoxedHandle, tag: HandleTag) -> u64 {
        debug_assert!(tag.is_dispatchable());
        match self.try_unbox(boxed, tag) {
            Some(underlying) => underlying,
            None => panic!("unknown dispatchable {tag:?} handle {boxed:#x}"),
        }
    }

    /// Unbox a non-dispatchable handle, tolerating misses. A stale handle
    /// logs and translates to the null handle.
    pub fn unbox_or_null(&self, boxed: BoxedHandle, tag: HandleTag) -> u64 {
        if boxed == NULL_HANDLE {
            return 0;
        }
        match self.try_unbox(boxed, tag) {
            Some(underlying) => underlying,
            None => {
                warn!(boxed = format_args!("{boxed:#x}"), ?tag, "stale handle");
                0
            }
        }
    }

    pub fn order_info(&self, boxed: BoxedHandle) -> Option<Arc<OrderInfo>> {
        self.get(boxed)?.order
    }

    /// Reverse-translate a native handle the driver produced.
    pub fn unboxed_to_boxed(&self, underlying: u64) -> Option<BoxedHandle> {
        self.inner.read().reverse.get(&underlying).copied()
    }

    /// Remove a handle. The freed slot enters the grace queue.
    pub fn delete(&self, boxed: BoxedHandle) {
        let mut inner = self.inner.write();
        let removed = if boxed & OVERFLOW_BIT != 0 {
            inner.overflow.remove(&boxed)
        } else if let Some((index, generation)) = decode_slab(boxed) {
            let taken = match inner.slab.get_mut(index) {
                Some(slot) if slot.as_ref().is_some_and(|s| s.generation == generation) => {
                    slot.take()
                }
                _ => None,
            };
            if taken.is_some() {
                // Generations live in the 30 bits below the overflow bit.
                let next_gen = (generation + 1) & 0x3FFF_FFFF;
                inner.free.push_back((index, next_gen.max(1)));
            }
            taken.map(|s| s.info)
        } else {
            None
        };

        if let Some(info) = removed {
            if inner.reverse.get(&info.underlying) == Some(&boxed) {
                inner.reverse.remove(&info.underlying);
            }
        }
    }

    /// Queue `boxed` for removal once `device` reaches a safe point. The
    /// callback performs the driver-side destruction and runs without any
    /// registry lock held.
    pub fn delayed_delete(
        &self,
        boxed: BoxedHandle,
        device: BoxedHandle,
        callback: Box<dyn FnOnce() + Send>,
    ) {
        self.delayed
            .lock()
            .entry(device)
            .or_default()
            .push(DelayedRemove { boxed, callback });
    }

    /// Run the delayed removals queued against `device`. Called after the
    /// device (or one of its queues) has drained.
    pub fn process_delayed_removes(&self, device: BoxedHandle) {
        let pending = self.delayed.lock().remove(&device).unwrap_or_default();
        for remove in pending {
            (remove.callback)();
            self.delete(remove.boxed);
        }
    }

    /// Seed the registry with boxed values to re-issue verbatim, in order.
    /// Used during snapshot restore so replayed creations land on their
    /// original handles.
    pub fn begin_replay(&self, handles: Vec<BoxedHandle>) {
        self.inner.write().replay = handles.into();
    }

    pub fn live_count(&self) -> usize {
        let inner = self.inner.read();
        inner.slab.iter().filter(|s| s.is_some()).count() + inner.overflow.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        for slot in inner.slab.iter_mut() {
            *slot = None;
        }
        inner.next_index = 0;
        inner.free.clear();
        inner.overflow.clear();
        inner.reverse.clear();
        inner.replay.clear();
        self.delayed.lock().clear();
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn boxed_values_are_unique_and_nonzero() {
        let registry = HandleRegistry::new();
        let mut seen = std::collections::HashSet::new();
        // Enough to exercise both the slab and the overflow map.
        for i in 0..FAST_PATH_CAPACITY as u64 + 100 {
            let boxed = registry.new_boxed(0x1000 + i, HandleTag::Buffer);
            assert_ne!(boxed, NULL_HANDLE);
            assert!(seen.insert(boxed), "duplicate boxed value {boxed:#x}");
        }
        assert_eq!(registry.live_count(), FAST_PATH_CAPACITY + 100);
    }

    #[test]
    fn lookup_round_trips() {
        let registry = HandleRegistry::new();
        let boxed = registry.new_boxed(0xABCD, HandleTag::Image);
        assert_eq!(registry.try_unbox(boxed, HandleTag::Image), Some(0xABCD));
        assert_eq!(registry.unboxed_to_boxed(0xABCD), Some(boxed));
    }

    #[test]
    fn deleted_handles_stop_resolving() {
        let registry = HandleRegistry::new();
        let boxed = registry.new_boxed(7, HandleTag::Fence);
        registry.delete(boxed);
        assert!(registry.get(boxed).is_none());
        assert_eq!(registry.unboxed_to_boxed(7), None);
        assert_eq!(registry.unbox_or_null(boxed, HandleTag::Fence), 0);
    }

    #[test]
    fn slot_reuse_respects_grace_and_generation() {
        let registry = HandleRegistry::new();
        let first = registry.new_boxed(1, HandleTag::Buffer);
        registry.delete(first);

        // Fewer than N_GRACE frees: the slot must not be reused yet.
        let next = registry.new_boxed(2, HandleTag::Buffer);
        assert_ne!(next & 0xFFFF_FFFF, first & 0xFFFF_FFFF);

        // Push enough frees through to roll the slot out of the grace
        // window, then verify the recycled slot carries a new generation.
        let mut freed = vec![];
        for i in 0..N_GRACE as u64 + 8 {
            freed.push(registry.new_boxed(100 + i, HandleTag::Buffer));
        }
        for handle in freed {
            registry.delete(handle);
        }
        let recycled = registry.new_boxed(3, HandleTag::Buffer);
        assert_eq!(recycled & 0xFFFF_FFFF, first & 0xFFFF_FFFF);
        assert_ne!(recycled, first);
        assert!(registry.get(first).is_none());
        assert_eq!(registry.try_unbox(recycled, HandleTag::Buffer), Some(3));
    }

    #[test]
    fn virtual_queue_bit_is_stripped_on_unbox() {
        let registry = HandleRegistry::new();
        let boxed = registry.new_boxed(0x99 | VIRTUAL_QUEUE_BIT, HandleTag::Queue);
        assert_eq!(registry.unbox_dispatchable(boxed, HandleTag::Queue), 0x99);
    }

    #[test]
    #[should_panic(expected = "unknown dispatchable")]
    fn unknown_dispatchable_panics() {
        let registry = HandleRegistry::new();
        registry.unbox_dispatchable(0xDEAD_0001, HandleTag::Device);
    }

    #[test]
    fn delayed_removes_run_at_the_safe_point() {
        let registry = HandleRegistry::new();
        let device = registry.new_boxed(1, HandleTag::Device);
        let fence = registry.new_boxed(2, HandleTag::Fence);

        static DESTROYED: AtomicBool = AtomicBool::new(false);
        DESTROYED.store(false, Ordering::SeqCst);
        registry.delayed_delete(
            fence,
            device,
            Box::new(|| DESTROYED.store(true, Ordering::SeqCst)),
        );

        // Still resolvable until the device drains.
        assert!(registry.get(fence).is_some());
        assert!(!DESTROYED.load(Ordering::SeqCst));

        registry.process_delayed_removes(device);
        assert!(DESTROYED.load(Ordering::SeqCst));
        assert!(registry.get(fence).is_none());
    }

    #[test]
    fn replay_reissues_the_same_boxed_values() {
        let registry = HandleRegistry::new();
        let a = registry.new_boxed(10, HandleTag::Instance);
        let b = registry.new_boxed(11, HandleTag::Device);

        let restored = HandleRegistry::new();
        restored.begin_replay(vec![a, b]);
        assert_eq!(restored.new_boxed(20, HandleTag::Instance), a);
        assert_eq!(restored.new_boxed(21, HandleTag::Device), b);
        assert_eq!(restored.try_unbox(b, HandleTag::Device), Some(21));
    }

    #[test]
    fn order_info_serializes_out_of_order_arrivals() {
        let order = Arc::new(OrderInfo::new());
        let stamp = Arc::new(AtomicU32::new(0));

        let mut threads = vec![];
        for seq in (1..=4u32).rev() {
            let order = Arc::clone(&order);
            let stamp = Arc::clone(&stamp);
            threads.push(std::thread::spawn(move || {
                order.wait_for_turn(seq);
                let prev = stamp.swap(seq, Ordering::SeqCst);
                assert_eq!(prev, seq - 1, "sequence {seq} ran out of order");
                order.complete(seq);
            }));
        }
        for t in threads {
            t.join().expect("order thread panicked");
        }
        assert_eq!(order.last_completed(), 4);
    }
}
