//! The seam between the decoder and the machine's Vulkan implementation.
//!
//! The decoder translates boxed handles to native ones and calls through this
//! trait; [`crate::ash_driver::AshDriver`] forwards to a real ICD via `ash`,
//! and [`crate::testing::TestDriver`] provides a software stand-in for tests
//! and machines without a GPU.

use gstream_protocol::commands::{
    DirectMapping, MemoryProperties, MemoryRequirements, NativeBufferInfo,
};
use thiserror::Error;

/// A failed driver call, carrying the raw `VkResult`-style code to relay to
/// the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("driver call failed with result {result}")]
pub struct DriverError {
    pub result: i32,
}

impl DriverError {
    pub fn new(result: i32) -> Self {
        Self { result }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Outcome of a memory allocation. `direct` is present when the allocation
/// is host-visible and the driver mapped it into the session's
/// address-space window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedMemory {
    pub handle: u64,
    pub direct: Option<DirectMapping>,
}

/// A submit batch with every boxed handle already translated to its native
/// value.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSubmit {
    pub wait_semaphores: Vec<u64>,
    pub wait_dst_stage_masks: Vec<u32>,
    pub command_buffers: Vec<u64>,
    pub signal_semaphores: Vec<u64>,
}

/// Invoked by the driver once the GPU work preceding a release is done.
pub type ReleaseSignal = Box<dyn FnOnce() + Send>;

pub trait HostDriver: Send + Sync {
    fn create_instance(
        &self,
        app_name: Option<&str>,
        api_version: u32,
        enabled_extensions: &[String],
    ) -> DriverResult<u64>;
    fn destroy_instance(&self, instance: u64);
    fn enumerate_physical_devices(&self, instance: u64) -> DriverResult<Vec<u64>>;
    fn memory_properties(&self, physical_device: u64) -> DriverResult<MemoryProperties>;
    /// `VkPhysicalDeviceLimits::nonCoherentAtomSize` for the device.
    fn non_coherent_atom_size(&self, physical_device: u64) -> u64;

    fn create_device(
        &self,
        physical_device: u64,
        queue_family_index: u32,
        queue_count: u32,
        enabled_extensions: &[String],
    ) -> DriverResult<u64>;
    fn destroy_device(&self, device: u64);
    /// Resolve a queue. Indices beyond what the hardware exposes collapse
    /// onto the last physical queue of the family.
    fn device_queue(&self, device: u64, queue_family_index: u32, queue_index: u32)
        -> DriverResult<u64>;

    fn allocate_memory(
        &self,
        device: u64,
        size: u64,
        memory_type_index: u32,
        direct_map: bool,
    ) -> DriverResult<AllocatedMemory>;
    fn free_memory(&self, device: u64, memory: u64);
    /// Write guest bytes into a non-direct allocation (shadow flush).
    fn write_memory(&self, device: u64, memory: u64, offset: u64, data: &[u8])
        -> DriverResult<()>;
    /// Read bytes back out of a non-direct allocation (shadow invalidate).
    fn read_memory(&self, device: u64, memory: u64, offset: u64, size: u64)
        -> DriverResult<Vec<u8>>;

    fn create_buffer(&self, device: u64, size: u64, usage: u32) -> DriverResult<u64>;
    fn destroy_buffer(&self, device: u64, buffer: u64);
    fn buffer_memory_requirements(
        &self,
        device: u64,
        buffer: u64,
    ) -> DriverResult<MemoryRequirements>;
    fn bind_buffer_memory(
        &self,
        device: u64,
        buffer: u64,
        memory: u64,
        offset: u64,
    ) -> DriverResult<()>;

    fn create_image(
        &self,
        device: u64,
        width: u32,
        height: u32,
        format: u32,
        usage: u32,
    ) -> DriverResult<u64>;
    fn destroy_image(&self, device: u64, image: u64);
    fn bind_image_memory(
        &self,
        device: u64,
        image: u64,
        memory: u64,
        offset: u64,
        native_buffer: Option<&NativeBufferInfo>,
    ) -> DriverResult<()>;

    fn create_fence(&self, device: u64, signaled: bool) -> DriverResult<u64>;
    fn destroy_fence(&self, device: u64, fence: u64);
    fn reset_fences(&self, device: u64, fences: &[u64]) -> DriverResult<()>;
    /// Returns a `VkResult`-style code: `SUCCESS` or `TIMEOUT`.
    fn wait_for_fences(
        &self,
        device: u64,
        fences: &[u64],
        wait_all: bool,
        timeout_ns: u64,
    ) -> DriverResult<i32>;
    /// Whether the fence still backs an unretired internal submit. Such a
    /// fence must not be destroyed until the device drains.
    fn fence_in_flight(&self, device: u64, fence: u64) -> bool;

    fn create_semaphore(&self, device: u64) -> DriverResult<u64>;
    fn destroy_semaphore(&self, device: u64, semaphore: u64);

    fn queue_submit(
        &self,
        queue: u64,
        submits: &[ResolvedSubmit],
        fence: u64,
    ) -> DriverResult<()>;
    fn queue_wait_idle(&self, queue: u64) -> DriverResult<()>;
    fn device_wait_idle(&self, device: u64) -> DriverResult<()>;

    /// Swapchain acquire: enqueue an internal submit that signals `fence`
    /// and `semaphore` (either may be null) once the image is ready.
    fn acquire_image(
        &self,
        queue: u64,
        image: u64,
        fence: u64,
        semaphore: u64,
    ) -> DriverResult<()>;
    /// Swapchain release: call `done` once all queue work touching `image`
    /// has completed.
    fn signal_release_image(&self, queue: u64, image: u64, done: ReleaseSignal)
        -> DriverResult<()>;

    fn create_command_pool(&self, device: u64, queue_family_index: u32) -> DriverResult<u64>;
    fn destroy_command_pool(&self, device: u64, pool: u64);
    fn allocate_command_buffers(
        &self,
        device: u64,
        pool: u64,
        count: u32,
    ) -> DriverResult<Vec<u64>>;
    fn free_command_buffers(&self, device: u64, pool: u64, buffers: &[u64]);
}
