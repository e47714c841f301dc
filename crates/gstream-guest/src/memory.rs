//! Host-visible memory virtualization.
//!
//! Rather than crossing the transport for every allocation, the guest carves
//! small host-visible allocations out of a few large direct-mapped blocks,
//! one per host memory type. A first-fit suballocator with a device-derived
//! grain manages each block; freeing merges neighbors so the space does not
//! fragment permanently. Memory types the host cannot direct-map fall back
//! to shadow buffers that move bytes on flush/invalidate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use gstream_protocol::commands::{memory_property, MemoryProperties, MemoryType};
use gstream_protocol::handle::BoxedHandle;
use parking_lot::Mutex;

/// Minimum suballocation grain, raised to the device's
/// `nonCoherentAtomSize` when that is larger.
pub const MIN_GRAIN: u64 = 64;

/// First-fit free-list allocator over one block. Offsets are rounded to the
/// grain; freeing merges adjacent ranges.
pub struct SubAllocator {
    grain: u64,
    size: u64,
    free: Vec<(u64, u64)>,
}

impl SubAllocator {
    pub fn new(size: u64, grain: u64) -> Self {
        let grain = grain.max(MIN_GRAIN);
        Self {
            grain,
            size,
            free: vec![(0, size)],
        }
    }

    fn round(&self, size: u64) -> u64 {
        size.div_ceil(self.grain) * self.grain
    }

    /// Lowest-offset range that fits, or `None` when the block is full.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let size = self.round(size);
        let slot = self.free.iter().position(|&(_, len)| len >= size)?;
        let (offset, len) = self.free[slot];
        if len == size {
            self.free.remove(slot);
        } else {
            self.free[slot] = (offset + size, len - size);
        }
        Some(offset)
    }

    pub fn release(&mut self, offset: u64, size: u64) {
        let size = self.round(size);
        self.free.push((offset, size));
        self.free.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.free.len());
        for &(off, len) in &self.free {
            match merged.last_mut() {
                Some(last) if last.0 + last.1 == off => last.1 += len,
                _ => merged.push((off, len)),
            }
        }
        self.free = merged;
    }

    /// True when every byte is free again.
    pub fn is_unused(&self) -> bool {
        self.free == [(0, self.size)]
    }
}

/// Renaming tables between host and guest memory type indices.
///
/// Host-visible types are advertised to the guest with the coherent bit set:
/// writes land in the shared window, so no explicit flush is needed for the
/// direct path. A type that is both device-local and host-visible is split:
/// the original index keeps only its device-local side, and a virtual
/// host-visible type backed by the suballocator is appended, mapping to the
/// same host index. Type-bits rewrites advertise both halves of a split.
pub struct MemoryTypeTranslation {
    guest_props: MemoryProperties,
    host_for_guest: Vec<u32>,
    guest_for_host: Vec<u32>,
    /// Appended virtual guest index per host index, for split types.
    virtual_for_host: Vec<Option<u32>>,
}

impl MemoryTypeTranslation {
    pub fn from_host(host: &MemoryProperties) -> Self {
        let n = host.memory_types.len();
        let mut guest_props = host.clone();
        let mut host_for_guest: Vec<u32> = (0..n as u32).collect();
        let guest_for_host: Vec<u32> = (0..n as u32).collect();
        let mut virtual_for_host: Vec<Option<u32>> = vec![None; n];

        for host_index in 0..n {
            let flags = host.memory_types[host_index].property_flags;
            if flags & memory_property::HOST_VISIBLE == 0 {
                continue;
            }
            if flags & memory_property::DEVICE_LOCAL != 0 {
                guest_props.memory_types[host_index].property_flags =
                    memory_property::DEVICE_LOCAL;
                let virtual_index = guest_props.memory_types.len() as u32;
                guest_props.memory_types.push(MemoryType {
                    property_flags: (flags & !memory_property::DEVICE_LOCAL)
                        | memory_property::HOST_COHERENT,
                    heap_index: host.memory_types[host_index].heap_index,
                });
                host_for_guest.push(host_index as u32);
                virtual_for_host[host_index] = Some(virtual_index);
            } else {
                guest_props.memory_types[host_index].property_flags |=
                    memory_property::HOST_COHERENT;
            }
        }
        Self {
            guest_props,
            host_for_guest,
            guest_for_host,
            virtual_for_host,
        }
    }

    pub fn guest_properties(&self) -> &MemoryProperties {
        &self.guest_props
    }

    pub fn host_type(&self, guest_index: u32) -> u32 {
        self.host_for_guest
            .get(guest_index as usize)
            .copied()
            .unwrap_or(guest_index)
    }

    /// Rewrite a host `memoryTypeBits` mask into guest index space. A host
    /// bit covering a split type sets both guest bits.
    pub fn guest_type_bits(&self, host_bits: u32) -> u32 {
        let mut out = 0u32;
        for (host_index, &guest_index) in self.guest_for_host.iter().enumerate() {
            if host_bits & (1 << host_index) == 0 {
                continue;
            }
            out |= 1 << guest_index;
            if let Some(virtual_index) = self.virtual_for_host[host_index] {
                out |= 1 << virtual_index;
            }
        }
        out
    }

    pub fn is_host_visible(&self, guest_index: u32) -> bool {
        self.guest_props
            .memory_types
            .get(guest_index as usize)
            .is_some_and(|t| t.property_flags & memory_property::HOST_VISIBLE != 0)
    }
}

/// How a guest allocation is backed.
pub enum Backing {
    /// Suballocated from the shared per-type heap block.
    DirectHeap {
        host_type: u32,
        heap_offset: u64,
        window_offset: u64,
    },
    /// Its own direct-mapped host block (too big for the heap).
    DirectDedicated { window_offset: u64 },
    /// Shadow buffer; bytes cross the transport on flush/invalidate.
    /// Boxed so the mapped pointer stays stable while the lock is free.
    Shadow { data: Mutex<Box<[u8]>> },
}

/// Guest-side record of one `VkDeviceMemory`.
pub struct DeviceMemory {
    pub device: BoxedHandle,
    /// Host allocation backing this one (the heap block for
    /// suballocations).
    pub host_memory: BoxedHandle,
    /// Offset of this allocation inside the host block.
    pub host_offset: u64,
    pub size: u64,
    pub guest_type: u32,
    pub backing: Backing,
}

impl DeviceMemory {
    pub fn is_direct(&self) -> bool {
        !matches!(self.backing, Backing::Shadow { .. })
    }

    pub fn window_offset(&self) -> Option<u64> {
        match self.backing {
            Backing::DirectHeap { window_offset, .. }
            | Backing::DirectDedicated { window_offset } => Some(window_offset),
            Backing::Shadow { .. } => None,
        }
    }
}

struct Heap {
    device: BoxedHandle,
    memory: BoxedHandle,
    window_offset: u64,
    alloc: SubAllocator,
}

/// A suballocation placement handed back to the encoder.
pub struct Suballocation {
    pub host_memory: BoxedHandle,
    pub heap_offset: u64,
    pub window_offset: u64,
}

/// All guest memory state: heap blocks per host type and the allocation
/// table keyed by guest-local ids.
pub struct MemoryTable {
    grain: u64,
    heap_size: u64,
    heaps: Mutex<HashMap<u32, Heap>>,
    allocations: DashMap<u64, Arc<DeviceMemory>>,
    next_id: AtomicU64,
}

impl MemoryTable {
    pub fn new(non_coherent_atom_size: u64, heap_size: u64) -> Self {
        Self {
            grain: non_coherent_atom_size.max(MIN_GRAIN),
            heap_size,
            heaps: Mutex::new(HashMap::new()),
            allocations: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn grain(&self) -> u64 {
        self.grain
    }

    pub fn heap_size(&self) -> u64 {
        self.heap_size
    }

    pub fn has_heap(&self, host_type: u32) -> bool {
        self.heaps.lock().contains_key(&host_type)
    }

    /// Adopt a freshly allocated direct-mapped block as the heap for
    /// `host_type`.
    pub fn install_heap(
        &self,
        host_type: u32,
        device: BoxedHandle,
        memory: BoxedHandle,
        window_offset: u64,
    ) {
        self.heaps.lock().insert(
            host_type,
            Heap {
                device,
                memory,
                window_offset,
                alloc: SubAllocator::new(self.heap_size, self.grain),
            },
        );
    }

    /// Detach the heap blocks belonging to `device`, returning their host
    /// memory handles so the caller can free them before the device goes.
    pub fn take_device_heaps(&self, device: BoxedHandle) -> Vec<BoxedHandle> {
        let mut heaps = self.heaps.lock();
        let doomed: Vec<u32> = heaps
            .iter()
            .filter(|(_, heap)| heap.device == device)
            .map(|(&ty, _)| ty)
            .collect();
        doomed
            .into_iter()
            .filter_map(|ty| heaps.remove(&ty).map(|heap| heap.memory))
            .collect()
    }

    pub fn suballocate(&self, host_type: u32, size: u64) -> Option<Suballocation> {
        let mut heaps = self.heaps.lock();
        let heap = heaps.get_mut(&host_type)?;
        let heap_offset = heap.alloc.allocate(size)?;
        Some(Suballocation {
            host_memory: heap.memory,
            heap_offset,
            window_offset: heap.window_offset + heap_offset,
        })
    }

    pub fn release_suballocation(&self, host_type: u32, heap_offset: u64, size: u64) {
        if let Some(heap) = self.heaps.lock().get_mut(&host_type) {
            heap.alloc.release(heap_offset, size);
        }
    }

    pub fn register(&self, memory: DeviceMemory) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.allocations.insert(id, Arc::new(memory));
        id
    }

    pub fn get(&self, id: u64) -> Option<Arc<DeviceMemory>> {
        self.allocations.get(&id).map(|m| Arc::clone(&m))
    }

    pub fn remove(&self, id: u64) -> Option<Arc<DeviceMemory>> {
        self.allocations.remove(&id).map(|(_, m)| m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gstream_protocol::commands::{MemoryHeap, MemoryType};

    #[test]
    fn suballocator_is_first_fit_and_merges() {
        let mut alloc = SubAllocator::new(1 << 20, 64);
        let a = alloc.allocate(100).unwrap();
        let b = alloc.allocate(100).unwrap();
        let c = alloc.allocate(100).unwrap();
        assert_eq!(a, 0);
        // Grain rounding: 100 rounds up to 128.
        assert_eq!(b, 128);
        assert_eq!(c, 256);

        alloc.release(b, 100);
        // First fit: the freed hole is the lowest range that fits.
        assert_eq!(alloc.allocate(64).unwrap(), 128);

        alloc.release(128, 64);
        alloc.release(a, 100);
        alloc.release(c, 100);
        assert!(alloc.is_unused());
        // Everything merged back: a full-size allocation succeeds at 0.
        assert_eq!(alloc.allocate(1 << 20).unwrap(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut alloc = SubAllocator::new(256, 64);
        assert!(alloc.allocate(256).is_some());
        assert!(alloc.allocate(64).is_none());
    }

    fn host_props() -> MemoryProperties {
        MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: memory_property::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: memory_property::HOST_VISIBLE,
                    heap_index: 1,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: 4 << 30,
                    flags: 1,
                },
                MemoryHeap {
                    size: 512 << 20,
                    flags: 0,
                },
            ],
        }
    }

    #[test]
    fn host_visible_types_become_coherent() {
        let translation = MemoryTypeTranslation::from_host(&host_props());
        let guest = translation.guest_properties();
        assert_eq!(
            guest.memory_types[0].property_flags,
            memory_property::DEVICE_LOCAL
        );
        assert_eq!(
            guest.memory_types[1].property_flags,
            memory_property::HOST_VISIBLE | memory_property::HOST_COHERENT
        );
        assert!(translation.is_host_visible(1));
        assert!(!translation.is_host_visible(0));
    }

    #[test]
    fn type_bits_pass_through_the_tables() {
        let translation = MemoryTypeTranslation::from_host(&host_props());
        assert_eq!(translation.guest_type_bits(0b11), 0b11);
        assert_eq!(translation.guest_type_bits(0b10), 0b10);
        assert_eq!(translation.host_type(1), 1);
    }

    #[test]
    fn device_local_host_visible_types_split_in_two() {
        let mut props = host_props();
        props.memory_types.push(MemoryType {
            property_flags: memory_property::DEVICE_LOCAL | memory_property::HOST_VISIBLE,
            heap_index: 0,
        });
        let translation = MemoryTypeTranslation::from_host(&props);
        let guest = translation.guest_properties();

        assert_eq!(guest.memory_types.len(), 4);
        // The original index keeps only its device-local side; the appended
        // virtual type carries the host-visible side, on the same heap.
        assert_eq!(
            guest.memory_types[2].property_flags,
            memory_property::DEVICE_LOCAL
        );
        assert_eq!(
            guest.memory_types[3].property_flags,
            memory_property::HOST_VISIBLE | memory_property::HOST_COHERENT
        );
        assert_eq!(guest.memory_types[3].heap_index, 0);
        assert!(!translation.is_host_visible(2));
        assert!(translation.is_host_visible(3));

        // Both halves route to the same host type, and a host mask covering
        // the split type advertises both guest bits.
        assert_eq!(translation.host_type(2), 2);
        assert_eq!(translation.host_type(3), 2);
        assert_eq!(translation.guest_type_bits(0b100), 0b1100);
        assert_eq!(translation.guest_type_bits(0b111), 0b1111);
    }

    #[test]
    fn heap_suballocations_share_one_host_block() {
        let table = MemoryTable::new(64, 1 << 20);
        table.install_heap(1, 0xD0, 0xB0, 0x10000);

        let first = table.suballocate(1, 4096).expect("fits");
        let second = table.suballocate(1, 4096).expect("fits");
        assert_eq!(first.host_memory, 0xB0);
        assert_eq!(second.host_memory, 0xB0);
        assert_eq!(first.heap_offset, 0);
        assert_eq!(second.heap_offset, 4096);
        assert_eq!(first.window_offset, 0x10000);

        table.release_suballocation(1, first.heap_offset, 4096);
        let third = table.suballocate(1, 4096).expect("fits");
        assert_eq!(third.heap_offset, 0);
    }

    #[test]
    fn device_teardown_detaches_its_heaps() {
        let table = MemoryTable::new(64, 1 << 20);
        table.install_heap(1, 0xD0, 0xB0, 0);
        table.install_heap(2, 0xD1, 0xB1, 1 << 20);

        assert_eq!(table.take_device_heaps(0xD0), vec![0xB0]);
        assert!(table.suballocate(1, 64).is_none());
        // The other device's heap is untouched.
        assert!(table.suballocate(2, 64).is_some());
    }
}
