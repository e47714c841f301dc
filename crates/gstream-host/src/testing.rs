//! Software driver used by the test suites and by hosts without a GPU.
//!
//! Objects are plain table entries; "GPU work" completes instantly. Memory is
//! real, though: host-visible allocations are carved out of the session's
//! address-space window so the direct-mapping path moves actual bytes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use gstream_common::AddressSpaceWindow;
use gstream_protocol::commands::{
    memory_property, vk_result, DirectMapping, MemoryHeap, MemoryProperties, MemoryRequirements,
    MemoryType, NativeBufferInfo,
};
use parking_lot::Mutex;

use crate::driver::{
    AllocatedMemory, DriverError, DriverResult, HostDriver, ReleaseSignal, ResolvedSubmit,
};

const WINDOW_GRAIN: u64 = 4096;

/// First-fit carve-out of the address-space window for direct-mapped blocks.
struct WindowAllocator {
    free: Vec<(u64, u64)>,
}

impl WindowAllocator {
    fn new(size: u64) -> Self {
        Self {
            free: vec![(0, size)],
        }
    }

    fn allocate(&mut self, size: u64) -> Option<u64> {
        let size = size.div_ceil(WINDOW_GRAIN) * WINDOW_GRAIN;
        let slot = self.free.iter().position(|&(_, len)| len >= size)?;
        let (offset, len) = self.free[slot];
        if len == size {
            self.free.remove(slot);
        } else {
            self.free[slot] = (offset + size, len - size);
        }
        Some(offset)
    }

    fn release(&mut self, offset: u64, size: u64) {
        let size = size.div_ceil(WINDOW_GRAIN) * WINDOW_GRAIN;
        self.free.push((offset, size));
        self.free.sort_unstable();
        // Merge adjacent ranges.
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.free.len());
        for &(off, len) in &self.free {
            match merged.last_mut() {
                Some(last) if last.0 + last.1 == off => last.1 += len,
                _ => merged.push((off, len)),
            }
        }
        self.free = merged;
    }
}

struct MemoryBlock {
    size: u64,
    direct: Option<DirectMapping>,
    shadow: Mutex<Vec<u8>>,
}

struct FenceState {
    signaled: bool,
    in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub queue: u64,
    pub command_buffers: Vec<u64>,
}

pub struct TestDriver {
    next_handle: AtomicU64,
    window: Option<Arc<AddressSpaceWindow>>,
    window_alloc: Mutex<WindowAllocator>,
    memories: DashMap<u64, Arc<MemoryBlock>>,
    fences: DashMap<u64, Mutex<FenceState>>,
    /// Submission log for assertions on ordering.
    submits: Mutex<Vec<SubmitRecord>>,
    /// Physical queues per (device, family); one queue per family.
    queues: DashMap<(u64, u32), u64>,
    /// Pending release callbacks, held when deferred signalling is on.
    releases: Mutex<Vec<ReleaseSignal>>,
    defer_release_signals: bool,
}

impl TestDriver {
    pub fn new() -> Self {
        Self::with_window(None)
    }

    /// A driver that direct-maps host-visible memory into `window`.
    pub fn with_window(window: Option<Arc<AddressSpaceWindow>>) -> Self {
        let window_size = window.as_ref().map_or(0, |w| w.size() as u64);
        Self {
            next_handle: AtomicU64::new(0x1000),
            window,
            window_alloc: Mutex::new(WindowAllocator::new(window_size)),
            memories: DashMap::new(),
            fences: DashMap::new(),
            submits: Mutex::new(Vec::new()),
            queues: DashMap::new(),
            releases: Mutex::new(Vec::new()),
            defer_release_signals: false,
        }
    }

    /// Hold release callbacks until [`fire_pending_releases`] instead of
    /// running them inline.
    ///
    /// [`fire_pending_releases`]: TestDriver::fire_pending_releases
    pub fn deferred_releases(mut self) -> Self {
        self.defer_release_signals = true;
        self
    }

    pub fn fire_pending_releases(&self) {
        for done in self.releases.lock().drain(..) {
            done();
        }
    }

    pub fn submit_log(&self) -> Vec<SubmitRecord> {
        self.submits.lock().clone()
    }

    fn issue(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn memory(&self, memory: u64) -> DriverResult<Arc<MemoryBlock>> {
        self.memories
            .get(&memory)
            .map(|m| Arc::clone(&m))
            .ok_or(DriverError::new(vk_result::ERROR_MEMORY_MAP_FAILED))
    }
}

impl Default for TestDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver for TestDriver {
    fn create_instance(
        &self,
        _app_name: Option<&str>,
        _api_version: u32,
        _enabled_extensions: &[String],
    ) -> DriverResult<u64> {
        Ok(self.issue())
    }

    fn destroy_instance(&self, _instance: u64) {}

    fn enumerate_physical_devices(&self, _instance: u64) -> DriverResult<Vec<u64>> {
        Ok(vec![self.issue()])
    }

    fn memory_properties(&self, _physical_device: u64) -> DriverResult<MemoryProperties> {
        Ok(MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: memory_property::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: memory_property::HOST_VISIBLE
                        | memory_property::HOST_COHERENT,
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
        })
    }

    fn non_coherent_atom_size(&self, _physical_device: u64) -> u64 {
        64
    }

    fn create_device(
        &self,
        _physical_device: u64,
        _queue_family_index: u32,
        _queue_count: u32,
        _enabled_extensions: &[String],
    ) -> DriverResult<u64> {
        Ok(self.issue())
    }

    fn destroy_device(&self, device: u64) {
        self.queues.retain(|&(dev, _), _| dev != device);
    }

    fn device_queue(
        &self,
        device: u64,
        queue_family_index: u32,
        _queue_index: u32,
    ) -> DriverResult<u64> {
        // One physical queue per family; every index lands on it.
        let queue = *self
            .queues
            .entry((device, queue_family_index))
            .or_insert_with(|| self.issue());
        Ok(queue)
    }

    fn allocate_memory(
        &self,
        _device: u64,
        size: u64,
        memory_type_index: u32,
        direct_map: bool,
    ) -> DriverResult<AllocatedMemory> {
        let direct = if direct_map && memory_type_index == 1 {
            match self.window.as_ref() {
                Some(_) => {
                    let offset = self
                        .window_alloc
                        .lock()
                        .allocate(size)
                        .ok_or(DriverError::new(vk_result::ERROR_OUT_OF_DEVICE_MEMORY))?;
                    Some(DirectMapping {
                        window_offset: offset,
                        size,
                    })
                }
                None => None,
            }
        } else {
            None
        };

        let handle = self.issue();
        let shadow = if direct.is_some() {
            Vec::new()
        } else {
            vec![0u8; size as usize]
        };
        self.memories.insert(
            handle,
            Arc::new(MemoryBlock {
                size,
                direct,
                shadow: Mutex::new(shadow),
            }),
        );
        Ok(AllocatedMemory { handle, direct })
    }

    fn free_memory(&self, _device: u64, memory: u64) {
        if let Some((_, block)) = self.memories.remove(&memory) {
            if let Some(direct) = block.direct {
                self.window_alloc
                    .lock()
                    .release(direct.window_offset, direct.size);
            }
        }
    }

    fn write_memory(
        &self,
        _device: u64,
        memory: u64,
        offset: u64,
        data: &[u8],
    ) -> DriverResult<()> {
        let block = self.memory(memory)?;
        if offset + data.len() as u64 > block.size {
            return Err(DriverError::new(vk_result::ERROR_MEMORY_MAP_FAILED));
        }
        match (block.direct, self.window.as_ref()) {
            (Some(direct), Some(window)) => unsafe {
                window.write_at(direct.window_offset + offset, data);
            },
            _ => {
                let mut shadow = block.shadow.lock();
                shadow[offset as usize..offset as usize + data.len()].copy_from_slice(data);
            }
        }
        Ok(())
    }

    fn read_memory(
        &self,
        _device: u64,
        memory: u64,
        offset: u64,
        size: u64,
    ) -> DriverResult<Vec<u8>> {
        let block = self.memory(memory)?;
        if offset + size > block.size {
            return Err(DriverError::new(vk_result::ERROR_MEMORY_MAP_FAILED));
        }
        let mut out = vec![0u8; size as usize];
        match (block.direct, self.window.as_ref()) {
            (Some(direct), Some(window)) => unsafe {
                window.read_at(direct.window_offset + offset, &mut out);
            },
            _ => {
                let shadow = block.shadow.lock();
                out.copy_from_slice(&shadow[offset as usize..(offset + size) as usize]);
            }
        }
        Ok(out)
    }

    fn create_buffer(&self, _device: u64, _size: u64, _usage: u32) -> DriverResult<u64> {
        Ok(self.issue())
    }

    fn destroy_buffer(&self, _device: u64, _buffer: u64) {}

    fn buffer_memory_requirements(
        &self,
        _device: u64,
        _buffer: u64,
    ) -> DriverResult<MemoryRequirements> {
        Ok(MemoryRequirements {
            size: 256,
            alignment: 256,
            memory_type_bits: 0b11,
        })
    }

    fn bind_buffer_memory(
        &self,
        _device: u64,
        _buffer: u64,
        memory: u64,
        _offset: u64,
    ) -> DriverResult<()> {
        self.memory(memory).map(|_| ())
    }

    fn create_image(
        &self,
        _device: u64,
        _width: u32,
        _height: u32,
        _format: u32,
        _usage: u32,
    ) -> DriverResult<u64> {
        Ok(self.issue())
    }

    fn destroy_image(&self, _device: u64, _image: u64) {}

    fn bind_image_memory(
        &self,
        _device: u64,
        _image: u64,
        memory: u64,
        _offset: u64,
        native_buffer: Option<&NativeBufferInfo>,
    ) -> DriverResult<()> {
        // A native-buffer import supplies its own backing; the memory handle
        // may then be null.
        if native_buffer.is_some() && memory == 0 {
            return Ok(());
        }
        self.memory(memory).map(|_| ())
    }

    fn create_fence(&self, _device: u64, signaled: bool) -> DriverResult<u64> {
        let fence = self.issue();
        self.fences.insert(
            fence,
            Mutex::new(FenceState {
                signaled,
                in_flight: false,
            }),
        );
        Ok(fence)
    }

    fn destroy_fence(&self, _device: u64, fence: u64) {
        self.fences.remove(&fence);
    }

    fn reset_fences(&self, _device: u64, fences: &[u64]) -> DriverResult<()> {
        for fence in fences {
            if let Some(state) = self.fences.get(fence) {
                state.lock().signaled = false;
            }
        }
        Ok(())
    }

    fn wait_for_fences(
        &self,
        _device: u64,
        fences: &[u64],
        wait_all: bool,
        _timeout_ns: u64,
    ) -> DriverResult<i32> {
        let mut signaled = 0usize;
        for fence in fences {
            if let Some(state) = self.fences.get(fence) {
                if state.lock().signaled {
                    signaled += 1;
                }
            }
        }
        let done = if wait_all {
            signaled == fences.len()
        } else {
            signaled > 0
        };
        Ok(if done {
            vk_result::SUCCESS
        } else {
            vk_result::TIMEOUT
        })
    }

    fn fence_in_flight(&self, _device: u64, fence: u64) -> bool {
        self.fences
            .get(&fence)
            .is_some_and(|state| state.lock().in_flight)
    }

    fn create_semaphore(&self, _device: u64) -> DriverResult<u64> {
        Ok(self.issue())
    }

    fn destroy_semaphore(&self, _device: u64, _semaphore: u64) {}

    fn queue_submit(
        &self,
        queue: u64,
        submits: &[ResolvedSubmit],
        fence: u64,
    ) -> DriverResult<()> {
        let mut log = self.submits.lock();
        for submit in submits {
            log.push(SubmitRecord {
                queue,
                command_buffers: submit.command_buffers.clone(),
            });
        }
        drop(log);
        if fence != 0 {
            if let Some(state) = self.fences.get(&fence) {
                // Work retires immediately in the software driver.
                state.lock().signaled = true;
            }
        }
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: u64) -> DriverResult<()> {
        self.retire_in_flight();
        Ok(())
    }

    fn device_wait_idle(&self, _device: u64) -> DriverResult<()> {
        self.retire_in_flight();
        Ok(())
    }

    fn acquire_image(
        &self,
        _queue: u64,
        _image: u64,
        fence: u64,
        _semaphore: u64,
    ) -> DriverResult<()> {
        if fence != 0 {
            if let Some(state) = self.fences.get(&fence) {
                let mut state = state.lock();
                state.signaled = true;
                state.in_flight = true;
            }
        }
        Ok(())
    }

    fn signal_release_image(
        &self,
        _queue: u64,
        _image: u64,
        done: ReleaseSignal,
    ) -> DriverResult<()> {
        if self.defer_release_signals {
            self.releases.lock().push(done);
        } else {
            done();
        }
        Ok(())
    }

    fn create_command_pool(&self, _device: u64, _queue_family_index: u32) -> DriverResult<u64> {
        Ok(self.issue())
    }

    fn destroy_command_pool(&self, _device: u64, _pool: u64) {}

    fn allocate_command_buffers(
        &self,
        _device: u64,
        _pool: u64,
        count: u32,
    ) -> DriverResult<Vec<u64>> {
        Ok((0..count).map(|_| self.issue()).collect())
    }

    fn free_command_buffers(&self, _device: u64, _pool: u64, _buffers: &[u64]) {}
}

impl TestDriver {
    fn retire_in_flight(&self) {
        for entry in self.fences.iter() {
            entry.value().lock().in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_allocator_reuses_freed_ranges() {
        let mut alloc = WindowAllocator::new(64 * 1024);
        let a = alloc.allocate(8192).unwrap();
        let b = alloc.allocate(8192).unwrap();
        assert_ne!(a, b);
        alloc.release(a, 8192);
        // First fit hands the freed range back out.
        assert_eq!(alloc.allocate(4096).unwrap(), a);
    }

    #[test]
    fn direct_memory_lands_in_the_window() {
        let window = Arc::new(AddressSpaceWindow::new(1 << 20));
        let driver = TestDriver::with_window(Some(Arc::clone(&window)));
        let mem = driver.allocate_memory(1, 4096, 1, true).unwrap();
        let direct = mem.direct.expect("expected a direct mapping");

        driver.write_memory(1, mem.handle, 16, &[9, 8, 7]).unwrap();
        let mut out = [0u8; 3];
        unsafe { window.read_at(direct.window_offset + 16, &mut out) };
        assert_eq!(out, [9, 8, 7]);
    }

    #[test]
    fn non_direct_memory_uses_the_shadow() {
        let driver = TestDriver::new();
        let mem = driver.allocate_memory(1, 1024, 0, false).unwrap();
        assert!(mem.direct.is_none());
        driver.write_memory(1, mem.handle, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(driver.read_memory(1, mem.handle, 0, 4).unwrap(), [1, 2, 3, 4]);
    }
}
