//! The guest encoder: the typed API the guest ICD calls into.
//!
//! Every method encodes one command, stamps it with a sequence number drawn
//! from the handle it is ordered against, and performs the RPC through the
//! shared session. Memory operations route through the virtualizer so that
//! host-visible allocations stay inside the per-type heap blocks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use gstream_common::window::AddressSpaceWindow;
use gstream_core::config::MemoryConfig;
use gstream_protocol::commands::{
    MappedMemoryRange, MemoryProperties, MemoryRequirements, NativeBufferInfo, SubmitInfo,
    VkCommand, VkResponse,
};
use gstream_protocol::handle::{BoxedHandle, HandleTag, NULL_HANDLE};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::handles::GuestHandles;
use crate::memory::{Backing, DeviceMemory, MemoryTable, MemoryTypeTranslation, MIN_GRAIN};
use crate::session::{GuestError, GuestSession};

/// Guest-local device memory id. Never crosses the wire; the encoder
/// translates it to the backing host allocation on every use.
pub type GuestMemory = u64;

/// Reusable fence handles for the presentation loop, pooled per device and
/// capped at the in-flight frame count. Excess fences are destroyed on
/// return.
struct FencePool {
    free: Mutex<HashMap<BoxedHandle, Vec<BoxedHandle>>>,
    cap: usize,
}

pub struct Encoder {
    session: Arc<GuestSession>,
    handles: Arc<GuestHandles>,
    memory: MemoryTable,
    translation: RwLock<Option<MemoryTypeTranslation>>,
    window: Option<Arc<AddressSpaceWindow>>,
    /// Host memory types that refused a direct mapping; retried as shadow.
    no_direct: Mutex<HashSet<u32>>,
    fences: FencePool,
}

impl Encoder {
    pub fn new(
        session: Arc<GuestSession>,
        window: Option<Arc<AddressSpaceWindow>>,
        config: &MemoryConfig,
    ) -> Self {
        Self {
            session,
            handles: Arc::new(GuestHandles::new()),
            memory: MemoryTable::new(MIN_GRAIN, config.virtual_host_visible_heap_size),
            translation: RwLock::new(None),
            window,
            no_direct: Mutex::new(HashSet::new()),
            fences: FencePool {
                free: Mutex::new(HashMap::new()),
                cap: config.in_flight_frames,
            },
        }
    }

    pub fn handles(&self) -> &Arc<GuestHandles> {
        &self.handles
    }

    pub fn session(&self) -> &GuestSession {
        &self.session
    }

    fn call(&self, command: &VkCommand) -> Result<VkResponse, GuestError> {
        let seqno = command
            .ordered_handle()
            .map_or(0, |h| self.handles.draw_seq(h));
        self.session.call(command, seqno)
    }

    fn expect_ok(&self, resp: VkResponse, what: &'static str) -> Result<(), GuestError> {
        match resp {
            VkResponse::Ok => Ok(()),
            VkResponse::Error { result } => Err(GuestError::Driver { result }),
            _ => Err(GuestError::UnexpectedReply(what)),
        }
    }

    fn expect_handle(
        &self,
        resp: VkResponse,
        what: &'static str,
    ) -> Result<BoxedHandle, GuestError> {
        match resp {
            VkResponse::Handle { handle } => Ok(handle),
            VkResponse::Error { result } => Err(GuestError::Driver { result }),
            _ => Err(GuestError::UnexpectedReply(what)),
        }
    }

    // Object lifetime ------------------------------------------------------

    pub fn get_extensions(&self) -> Result<String, GuestError> {
        match self.call(&VkCommand::GetExtensions)? {
            VkResponse::ExtensionList { extensions } => Ok(extensions),
            VkResponse::Error { result } => Err(GuestError::Driver { result }),
            _ => Err(GuestError::UnexpectedReply("GetExtensions")),
        }
    }

    pub fn create_instance(
        &self,
        app_name: Option<&str>,
        api_version: u32,
        enabled_extensions: &[String],
    ) -> Result<BoxedHandle, GuestError> {
        let resp = self.call(&VkCommand::CreateInstance {
            app_name: app_name.map(str::to_owned),
            api_version,
            enabled_extensions: enabled_extensions.to_vec(),
        })?;
        let instance = self.expect_handle(resp, "CreateInstance")?;
        self.handles.insert(instance, HandleTag::Instance);
        Ok(instance)
    }

    pub fn destroy_instance(&self, instance: BoxedHandle) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::DestroyInstance { instance })?;
        self.handles.remove(instance);
        self.expect_ok(resp, "DestroyInstance")
    }

    pub fn enumerate_physical_devices(
        &self,
        instance: BoxedHandle,
    ) -> Result<Vec<BoxedHandle>, GuestError> {
        match self.call(&VkCommand::EnumeratePhysicalDevices { instance })? {
            VkResponse::Handles { handles } => {
                for &h in &handles {
                    self.handles.insert(h, HandleTag::PhysicalDevice);
                }
                Ok(handles)
            }
            VkResponse::Error { result } => Err(GuestError::Driver { result }),
            _ => Err(GuestError::UnexpectedReply("EnumeratePhysicalDevices")),
        }
    }

    /// Memory properties as the guest sees them: host-visible types are
    /// reported coherent, because direct-mapped memory needs no flush.
    pub fn get_memory_properties(
        &self,
        physical_device: BoxedHandle,
    ) -> Result<MemoryProperties, GuestError> {
        match self.call(&VkCommand::GetMemoryProperties { physical_device })? {
            VkResponse::MemoryProperties { props } => {
                let translation = MemoryTypeTranslation::from_host(&props);
                let guest = translation.guest_properties().clone();
                *self.translation.write() = Some(translation);
                Ok(guest)
            }
            VkResponse::Error { result } => Err(GuestError::Driver { result }),
            _ => Err(GuestError::UnexpectedReply("GetMemoryProperties")),
        }
    }

    pub fn create_device(
        &self,
        physical_device: BoxedHandle,
        queue_family_index: u32,
        queue_count: u32,
        enabled_extensions: &[String],
    ) -> Result<BoxedHandle, GuestError> {
        let resp = self.call(&VkCommand::CreateDevice {
            physical_device,
            queue_family_index,
            queue_count,
            enabled_extensions: enabled_extensions.to_vec(),
        })?;
        let device = self.expect_handle(resp, "CreateDevice")?;
        self.handles.insert(device, HandleTag::Device);
        Ok(device)
    }

    pub fn destroy_device(&self, device: BoxedHandle) -> Result<(), GuestError> {
        // Pooled fences and heap blocks belong to the device; give them
        // back first.
        let pooled = self.fences.free.lock().remove(&device).unwrap_or_default();
        for fence in pooled {
            self.destroy_fence(device, fence)?;
        }
        for block in self.memory.take_device_heaps(device) {
            let resp = self.call(&VkCommand::FreeMemory {
                device,
                memory: block,
            })?;
            self.handles.remove(block);
            self.expect_ok(resp, "FreeMemory")?;
        }
        let resp = self.call(&VkCommand::DestroyDevice { device })?;
        self.handles.remove(device);
        self.expect_ok(resp, "DestroyDevice")
    }

    pub fn get_device_queue(
        &self,
        device: BoxedHandle,
        queue_family_index: u32,
        queue_index: u32,
    ) -> Result<BoxedHandle, GuestError> {
        let resp = self.call(&VkCommand::GetDeviceQueue {
            device,
            queue_family_index,
            queue_index,
        })?;
        let queue = self.expect_handle(resp, "GetDeviceQueue")?;
        self.handles.insert(queue, HandleTag::Queue);
        Ok(queue)
    }

    // Memory ---------------------------------------------------------------

    fn host_type_for(&self, guest_type: u32) -> (u32, bool) {
        let translation = self.translation.read();
        match translation.as_ref() {
            Some(t) => (t.host_type(guest_type), t.is_host_visible(guest_type)),
            None => (guest_type, false),
        }
    }

    fn allocate_host(
        &self,
        device: BoxedHandle,
        size: u64,
        memory_type_index: u32,
        direct_map: bool,
    ) -> Result<(BoxedHandle, Option<u64>), GuestError> {
        match self.call(&VkCommand::AllocateMemory {
            device,
            size,
            memory_type_index,
            direct_map,
        })? {
            VkResponse::MemoryAllocated { handle, direct } => {
                self.handles.insert(handle, HandleTag::DeviceMemory);
                Ok((handle, direct.map(|d| d.window_offset)))
            }
            VkResponse::Error { result } => Err(GuestError::Driver { result }),
            _ => Err(GuestError::UnexpectedReply("AllocateMemory")),
        }
    }

    /// Install the shared heap block for one host memory type. Returns false
    /// when the host refuses to direct-map the type.
    fn ensure_heap(&self, device: BoxedHandle, host_type: u32) -> Result<bool, GuestError> {
        if self.memory.has_heap(host_type) {
            return Ok(true);
        }
        if self.no_direct.lock().contains(&host_type) {
            return Ok(false);
        }
        let (handle, window_offset) =
            self.allocate_host(device, self.memory.heap_size(), host_type, true)?;
        match window_offset {
            Some(offset) => {
                debug!(host_type, offset, "host-visible heap installed");
                self.memory.install_heap(host_type, device, handle, offset);
                Ok(true)
            }
            None => {
                // No direct mapping for this type; give the block back and
                // fall through to shadow allocations.
                self.no_direct.lock().insert(host_type);
                let resp = self.call(&VkCommand::FreeMemory {
                    device,
                    memory: handle,
                })?;
                self.handles.remove(handle);
                self.expect_ok(resp, "FreeMemory")?;
                Ok(false)
            }
        }
    }

    /// Allocate guest device memory. Host-visible requests come out of the
    /// per-type heap when they fit; everything else gets its own host
    /// allocation.
    pub fn allocate_memory(
        &self,
        device: BoxedHandle,
        size: u64,
        guest_type: u32,
    ) -> Result<GuestMemory, GuestError> {
        let (host_type, host_visible) = self.host_type_for(guest_type);
        let direct_wanted = host_visible && self.window.is_some();

        if direct_wanted && size <= self.memory.heap_size() && self.ensure_heap(device, host_type)?
        {
            if let Some(sub) = self.memory.suballocate(host_type, size) {
                return Ok(self.memory.register(DeviceMemory {
                    device,
                    host_memory: sub.host_memory,
                    host_offset: sub.heap_offset,
                    size,
                    guest_type,
                    backing: Backing::DirectHeap {
                        host_type,
                        heap_offset: sub.heap_offset,
                        window_offset: sub.window_offset,
                    },
                }));
            }
            debug!(host_type, size, "heap full, dedicated allocation");
        }

        if direct_wanted && !self.no_direct.lock().contains(&host_type) {
            let (handle, window_offset) = self.allocate_host(device, size, host_type, true)?;
            if let Some(offset) = window_offset {
                return Ok(self.memory.register(DeviceMemory {
                    device,
                    host_memory: handle,
                    host_offset: 0,
                    size,
                    guest_type,
                    backing: Backing::DirectDedicated {
                        window_offset: offset,
                    },
                }));
            }
            // Arrived without a mapping; keep the allocation and shadow it.
            return Ok(self.memory.register(DeviceMemory {
                device,
                host_memory: handle,
                host_offset: 0,
                size,
                guest_type,
                backing: Backing::Shadow {
                    data: Mutex::new(vec![0u8; size as usize].into_boxed_slice()),
                },
            }));
        }

        let (handle, _) = self.allocate_host(device, size, host_type, false)?;
        let shadow_len = if host_visible { size as usize } else { 0 };
        Ok(self.memory.register(DeviceMemory {
            device,
            host_memory: handle,
            host_offset: 0,
            size,
            guest_type,
            backing: Backing::Shadow {
                data: Mutex::new(vec![0u8; shadow_len].into_boxed_slice()),
            },
        }))
    }

    pub fn free_memory(&self, memory: GuestMemory) -> Result<(), GuestError> {
        let Some(record) = self.memory.remove(memory) else {
            return Ok(());
        };
        match record.backing {
            Backing::DirectHeap {
                host_type,
                heap_offset,
                ..
            } => {
                // The heap block outlives its suballocations.
                self.memory
                    .release_suballocation(host_type, heap_offset, record.size);
                Ok(())
            }
            _ => {
                let resp = self.call(&VkCommand::FreeMemory {
                    device: record.device,
                    memory: record.host_memory,
                })?;
                self.handles.remove(record.host_memory);
                self.expect_ok(resp, "FreeMemory")
            }
        }
    }

    /// Map guest memory. Direct-mapped memory aliases the window; shadowed
    /// host-visible memory maps its local buffer.
    pub fn map_memory(
        &self,
        memory: GuestMemory,
        offset: u64,
    ) -> Result<*mut u8, GuestError> {
        let record = self
            .memory
            .get(memory)
            .ok_or(GuestError::UnknownMemory(memory))?;
        match &record.backing {
            Backing::DirectHeap { window_offset, .. }
            | Backing::DirectDedicated { window_offset } => {
                let window = self
                    .window
                    .as_ref()
                    .ok_or(GuestError::UnexpectedReply("MapMemory"))?;
                // SAFETY: the suballocator handed this range to exactly one
                // owner and the window outlives the session.
                Ok(unsafe { window.ptr_at(window_offset + offset) })
            }
            Backing::Shadow { data } => {
                let mut data = data.lock();
                if data.is_empty() {
                    return Err(GuestError::Driver {
                        result: gstream_protocol::commands::vk_result::ERROR_MEMORY_MAP_FAILED,
                    });
                }
                // SAFETY: the boxed slice never moves while the record is
                // registered; writes are reconciled on flush.
                Ok(unsafe { data.as_mut_ptr().add(offset as usize) })
            }
        }
    }

    pub fn unmap_memory(&self, _memory: GuestMemory) {
        // Mappings are persistent; unmap is bookkeeping-free on both paths.
    }

    fn wire_range(
        &self,
        record: &DeviceMemory,
        offset: u64,
        size: u64,
    ) -> MappedMemoryRange {
        MappedMemoryRange {
            memory: record.host_memory,
            offset: record.host_offset + offset,
            size,
        }
    }

    /// Push shadow-buffer contents to the host. Direct ranges travel as
    /// range descriptors only; their bytes are already in the window.
    pub fn flush_mapped_ranges(
        &self,
        device: BoxedHandle,
        ranges: &[(GuestMemory, u64, u64)],
    ) -> Result<(), GuestError> {
        let mut wire = Vec::with_capacity(ranges.len());
        let mut data = Vec::with_capacity(ranges.len());
        for &(memory, offset, size) in ranges {
            let record = self
                .memory
                .get(memory)
                .ok_or(GuestError::UnknownMemory(memory))?;
            wire.push(self.wire_range(&record, offset, size));
            data.push(match &record.backing {
                Backing::Shadow { data } => {
                    let data = data.lock();
                    let start = offset as usize;
                    let end = start + size as usize;
                    Some(data[start..end].to_vec())
                }
                _ => None,
            });
        }
        let resp = self.call(&VkCommand::FlushMappedRanges {
            device,
            ranges: wire,
            data,
        })?;
        self.expect_ok(resp, "FlushMappedRanges")
    }

    /// Pull host contents back into shadow buffers. A no-op for direct
    /// ranges.
    pub fn invalidate_mapped_ranges(
        &self,
        device: BoxedHandle,
        ranges: &[(GuestMemory, u64, u64)],
    ) -> Result<(), GuestError> {
        let mut wire = Vec::with_capacity(ranges.len());
        let mut records = Vec::with_capacity(ranges.len());
        for &(memory, offset, size) in ranges {
            let record = self
                .memory
                .get(memory)
                .ok_or(GuestError::UnknownMemory(memory))?;
            wire.push(self.wire_range(&record, offset, size));
            records.push((record, offset));
        }
        match self.call(&VkCommand::InvalidateMappedRanges {
            device,
            ranges: wire,
        })? {
            VkResponse::RangeData { data } => {
                for ((record, offset), bytes) in records.into_iter().zip(data) {
                    if bytes.is_empty() {
                        continue;
                    }
                    if let Backing::Shadow { data } = &record.backing {
                        let mut shadow = data.lock();
                        let start = offset as usize;
                        shadow[start..start + bytes.len()].copy_from_slice(&bytes);
                    }
                }
                Ok(())
            }
            VkResponse::Error { result } => Err(GuestError::Driver { result }),
            _ => Err(GuestError::UnexpectedReply("InvalidateMappedRanges")),
        }
    }

    // Buffers and images ---------------------------------------------------

    pub fn create_buffer(
        &self,
        device: BoxedHandle,
        size: u64,
        usage: u32,
    ) -> Result<BoxedHandle, GuestError> {
        let resp = self.call(&VkCommand::CreateBuffer {
            device,
            size,
            usage,
        })?;
        let buffer = self.expect_handle(resp, "CreateBuffer")?;
        self.handles.insert(buffer, HandleTag::Buffer);
        Ok(buffer)
    }

    pub fn destroy_buffer(
        &self,
        device: BoxedHandle,
        buffer: BoxedHandle,
    ) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::DestroyBuffer { device, buffer })?;
        self.handles.remove(buffer);
        self.expect_ok(resp, "DestroyBuffer")
    }

    /// Buffer requirements with the type-bits mask rewritten into guest
    /// index space.
    pub fn get_buffer_memory_requirements(
        &self,
        device: BoxedHandle,
        buffer: BoxedHandle,
    ) -> Result<MemoryRequirements, GuestError> {
        match self.call(&VkCommand::GetBufferMemoryRequirements { device, buffer })? {
            VkResponse::MemoryRequirements { mut reqs } => {
                if let Some(t) = self.translation.read().as_ref() {
                    reqs.memory_type_bits = t.guest_type_bits(reqs.memory_type_bits);
                }
                Ok(reqs)
            }
            VkResponse::Error { result } => Err(GuestError::Driver { result }),
            _ => Err(GuestError::UnexpectedReply("GetBufferMemoryRequirements")),
        }
    }

    pub fn bind_buffer_memory(
        &self,
        device: BoxedHandle,
        buffer: BoxedHandle,
        memory: GuestMemory,
        offset: u64,
    ) -> Result<(), GuestError> {
        let record = self
            .memory
            .get(memory)
            .ok_or(GuestError::UnknownMemory(memory))?;
        let resp = self.call(&VkCommand::BindBufferMemory {
            device,
            buffer,
            memory: record.host_memory,
            offset: record.host_offset + offset,
        })?;
        self.expect_ok(resp, "BindBufferMemory")
    }

    pub fn create_image(
        &self,
        device: BoxedHandle,
        width: u32,
        height: u32,
        format: u32,
        usage: u32,
    ) -> Result<BoxedHandle, GuestError> {
        let resp = self.call(&VkCommand::CreateImage {
            device,
            width,
            height,
            format,
            usage,
        })?;
        let image = self.expect_handle(resp, "CreateImage")?;
        self.handles.insert(image, HandleTag::Image);
        Ok(image)
    }

    pub fn destroy_image(
        &self,
        device: BoxedHandle,
        image: BoxedHandle,
    ) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::DestroyImage { device, image })?;
        self.handles.remove(image);
        self.expect_ok(resp, "DestroyImage")
    }

    /// Bind image memory, optionally importing an ANDROID native buffer.
    /// `memory` may be `None` when the native buffer supplies the backing.
    pub fn bind_image_memory2(
        &self,
        device: BoxedHandle,
        image: BoxedHandle,
        memory: Option<GuestMemory>,
        offset: u64,
        native_buffer: Option<NativeBufferInfo>,
    ) -> Result<(), GuestError> {
        let (host_memory, host_offset) = match memory {
            Some(id) => {
                let record = self
                    .memory
                    .get(id)
                    .ok_or(GuestError::UnknownMemory(id))?;
                (record.host_memory, record.host_offset + offset)
            }
            None => (NULL_HANDLE, offset),
        };
        let resp = self.call(&VkCommand::BindImageMemory2 {
            device,
            image,
            memory: host_memory,
            offset: host_offset,
            native_buffer,
        })?;
        self.expect_ok(resp, "BindImageMemory2")
    }

    // Synchronization ------------------------------------------------------

    pub fn create_fence(
        &self,
        device: BoxedHandle,
        signaled: bool,
    ) -> Result<BoxedHandle, GuestError> {
        let resp = self.call(&VkCommand::CreateFence { device, signaled })?;
        let fence = self.expect_handle(resp, "CreateFence")?;
        self.handles.insert(fence, HandleTag::Fence);
        Ok(fence)
    }

    pub fn destroy_fence(
        &self,
        device: BoxedHandle,
        fence: BoxedHandle,
    ) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::DestroyFence { device, fence })?;
        self.handles.remove(fence);
        self.expect_ok(resp, "DestroyFence")
    }

    pub fn reset_fences(
        &self,
        device: BoxedHandle,
        fences: &[BoxedHandle],
    ) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::ResetFences {
            device,
            fences: fences.to_vec(),
        })?;
        self.expect_ok(resp, "ResetFences")
    }

    pub fn wait_for_fences(
        &self,
        device: BoxedHandle,
        fences: &[BoxedHandle],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<i32, GuestError> {
        match self.call(&VkCommand::WaitForFences {
            device,
            fences: fences.to_vec(),
            wait_all,
            timeout_ns,
        })? {
            VkResponse::WaitResult { result } => Ok(result),
            VkResponse::Error { result } => Err(GuestError::Driver { result }),
            _ => Err(GuestError::UnexpectedReply("WaitForFences")),
        }
    }

    pub fn create_semaphore(&self, device: BoxedHandle) -> Result<BoxedHandle, GuestError> {
        let resp = self.call(&VkCommand::CreateSemaphore { device })?;
        let semaphore = self.expect_handle(resp, "CreateSemaphore")?;
        self.handles.insert(semaphore, HandleTag::Semaphore);
        Ok(semaphore)
    }

    pub fn destroy_semaphore(
        &self,
        device: BoxedHandle,
        semaphore: BoxedHandle,
    ) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::DestroySemaphore { device, semaphore })?;
        self.handles.remove(semaphore);
        self.expect_ok(resp, "DestroySemaphore")
    }

    /// Take a fence from the device's presentation pool, creating one when
    /// the pool is dry. Pooled fences come back reset.
    pub fn acquire_pooled_fence(&self, device: BoxedHandle) -> Result<BoxedHandle, GuestError> {
        let pooled = self
            .fences
            .free
            .lock()
            .get_mut(&device)
            .and_then(Vec::pop);
        match pooled {
            Some(fence) => {
                self.reset_fences(device, &[fence])?;
                Ok(fence)
            }
            None => self.create_fence(device, false),
        }
    }

    /// Return a fence to its device's pool; destroys it when that pool is
    /// at its in-flight-frame cap.
    pub fn release_pooled_fence(
        &self,
        device: BoxedHandle,
        fence: BoxedHandle,
    ) -> Result<(), GuestError> {
        {
            let mut pools = self.fences.free.lock();
            let pool = pools.entry(device).or_default();
            if pool.len() < self.fences.cap {
                pool.push(fence);
                return Ok(());
            }
        }
        self.destroy_fence(device, fence)
    }

    // Queues ---------------------------------------------------------------

    pub fn queue_submit(
        &self,
        queue: BoxedHandle,
        submits: Vec<SubmitInfo>,
        fence: BoxedHandle,
    ) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::QueueSubmit {
            queue,
            submits,
            fence,
        })?;
        self.expect_ok(resp, "QueueSubmit")
    }

    pub fn queue_wait_idle(&self, queue: BoxedHandle) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::QueueWaitIdle { queue })?;
        self.expect_ok(resp, "QueueWaitIdle")
    }

    pub fn device_wait_idle(&self, device: BoxedHandle) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::DeviceWaitIdle { device })?;
        self.expect_ok(resp, "DeviceWaitIdle")
    }

    pub fn acquire_image(
        &self,
        queue: BoxedHandle,
        image: BoxedHandle,
        fence: BoxedHandle,
        semaphore: BoxedHandle,
    ) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::AcquireImage {
            queue,
            image,
            fence,
            semaphore,
        })?;
        self.expect_ok(resp, "AcquireImage")
    }

    /// Ask the host for a fence fd that signals when the image's GPU work
    /// retires. The compositor waits on it with
    /// [`gstream_common::sync_fd::SyncFd::wait`].
    #[cfg(unix)]
    pub fn queue_signal_release_image(
        &self,
        queue: BoxedHandle,
        image: BoxedHandle,
    ) -> Result<gstream_common::sync_fd::SyncFd, GuestError> {
        match self.call(&VkCommand::QueueSignalReleaseImage { queue, image })? {
            VkResponse::SyncFd { fd } if fd >= 0 => {
                // SAFETY: the host just transferred ownership of this pipe
                // read end to us through the response.
                Ok(unsafe { gstream_common::sync_fd::SyncFd::from_raw(fd) })
            }
            VkResponse::SyncFd { .. } => {
                Err(GuestError::UnexpectedReply("QueueSignalReleaseImage"))
            }
            VkResponse::Error { result } => Err(GuestError::Driver { result }),
            _ => Err(GuestError::UnexpectedReply("QueueSignalReleaseImage")),
        }
    }

    // Command buffers ------------------------------------------------------

    pub fn create_command_pool(
        &self,
        device: BoxedHandle,
        queue_family_index: u32,
    ) -> Result<BoxedHandle, GuestError> {
        let resp = self.call(&VkCommand::CreateCommandPool {
            device,
            queue_family_index,
        })?;
        let pool = self.expect_handle(resp, "CreateCommandPool")?;
        self.handles.insert(pool, HandleTag::CommandPool);
        Ok(pool)
    }

    pub fn destroy_command_pool(
        &self,
        device: BoxedHandle,
        pool: BoxedHandle,
    ) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::DestroyCommandPool { device, pool })?;
        self.handles.remove(pool);
        self.expect_ok(resp, "DestroyCommandPool")
    }

    pub fn allocate_command_buffers(
        &self,
        device: BoxedHandle,
        pool: BoxedHandle,
        count: u32,
    ) -> Result<Vec<BoxedHandle>, GuestError> {
        match self.call(&VkCommand::AllocateCommandBuffers {
            device,
            pool,
            count,
        })? {
            VkResponse::Handles { handles } => {
                for &h in &handles {
                    self.handles.insert(h, HandleTag::CommandBuffer);
                }
                Ok(handles)
            }
            VkResponse::Error { result } => Err(GuestError::Driver { result }),
            _ => Err(GuestError::UnexpectedReply("AllocateCommandBuffers")),
        }
    }

    pub fn free_command_buffers(
        &self,
        device: BoxedHandle,
        pool: BoxedHandle,
        buffers: &[BoxedHandle],
    ) -> Result<(), GuestError> {
        let resp = self.call(&VkCommand::FreeCommandBuffers {
            device,
            pool,
            buffers: buffers.to_vec(),
        })?;
        for &b in buffers {
            self.handles.remove(b);
        }
        self.expect_ok(resp, "FreeCommandBuffers")
    }
}
