//! Serialized command and response sets.
//!
//! The real system generates these tables; the core only depends on their
//! contract: each command has a stable opcode, encodes onto the codec of
//! [`crate::codec`], and is answered by a response frame carrying the same
//! opcode and sequence number. The set below covers the operations the core
//! mediates (object lifetime, memory, queues, synchronization, QSRI).

use crate::codec::{DecodeError, Reader, Writer};
use crate::handle::BoxedHandle;

/// Vulkan-style result codes surfaced through the protocol.
pub mod vk_result {
    pub const SUCCESS: i32 = 0;
    pub const NOT_READY: i32 = 1;
    pub const TIMEOUT: i32 = 2;
    pub const ERROR_OUT_OF_HOST_MEMORY: i32 = -1;
    pub const ERROR_OUT_OF_DEVICE_MEMORY: i32 = -2;
    pub const ERROR_DEVICE_LOST: i32 = -4;
    pub const ERROR_MEMORY_MAP_FAILED: i32 = -5;
    pub const ERROR_EXTENSION_NOT_PRESENT: i32 = -7;
    pub const ERROR_UNKNOWN: i32 = -13;
}

/// Stable opcode table. Opcode 0 is the end-of-stream marker; control
/// opcodes live below 0x100, API opcodes at and above it.
pub mod opcodes {
    pub const GET_EXTENSIONS: u32 = 0x01;
    pub const SET_CHECKSUM_VERSION: u32 = 0x02;

    pub const CREATE_INSTANCE: u32 = 0x100;
    pub const DESTROY_INSTANCE: u32 = 0x101;
    pub const ENUMERATE_PHYSICAL_DEVICES: u32 = 0x102;
    pub const GET_MEMORY_PROPERTIES: u32 = 0x103;
    pub const CREATE_DEVICE: u32 = 0x104;
    pub const DESTROY_DEVICE: u32 = 0x105;
    pub const GET_DEVICE_QUEUE: u32 = 0x106;

    pub const ALLOCATE_MEMORY: u32 = 0x110;
    pub const FREE_MEMORY: u32 = 0x111;
    pub const FLUSH_MAPPED_RANGES: u32 = 0x112;
    pub const INVALIDATE_MAPPED_RANGES: u32 = 0x113;

    pub const CREATE_BUFFER: u32 = 0x120;
    pub const DESTROY_BUFFER: u32 = 0x121;
    pub const GET_BUFFER_MEMORY_REQUIREMENTS: u32 = 0x122;
    pub const BIND_BUFFER_MEMORY: u32 = 0x123;

    pub const CREATE_IMAGE: u32 = 0x130;
    pub const DESTROY_IMAGE: u32 = 0x131;
    pub const BIND_IMAGE_MEMORY2: u32 = 0x132;

    pub const CREATE_FENCE: u32 = 0x140;
    pub const DESTROY_FENCE: u32 = 0x141;
    pub const RESET_FENCES: u32 = 0x142;
    pub const WAIT_FOR_FENCES: u32 = 0x143;
    pub const CREATE_SEMAPHORE: u32 = 0x144;
    pub const DESTROY_SEMAPHORE: u32 = 0x145;

    pub const QUEUE_SUBMIT: u32 = 0x150;
    pub const QUEUE_WAIT_IDLE: u32 = 0x151;
    pub const DEVICE_WAIT_IDLE: u32 = 0x152;
    pub const ACQUIRE_IMAGE: u32 = 0x153;
    pub const QUEUE_SIGNAL_RELEASE_IMAGE: u32 = 0x154;

    pub const CREATE_COMMAND_POOL: u32 = 0x160;
    pub const DESTROY_COMMAND_POOL: u32 = 0x161;
    pub const ALLOCATE_COMMAND_BUFFERS: u32 = 0x162;
    pub const FREE_COMMAND_BUFFERS: u32 = 0x163;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: u32,
    pub heap_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
}

/// Memory property flag bits (subset of the Vulkan enumeration).
pub mod memory_property {
    pub const DEVICE_LOCAL: u32 = 0x1;
    pub const HOST_VISIBLE: u32 = 0x2;
    pub const HOST_COHERENT: u32 = 0x4;
    pub const HOST_CACHED: u32 = 0x8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedMemoryRange {
    pub memory: BoxedHandle,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmitInfo {
    pub wait_semaphores: Vec<BoxedHandle>,
    pub wait_dst_stage_masks: Vec<u32>,
    pub command_buffers: Vec<BoxedHandle>,
    pub signal_semaphores: Vec<BoxedHandle>,
}

/// ANDROID native-buffer import carried in a bind-image pNext chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBufferInfo {
    pub native_handle: u64,
    pub stride: u32,
    pub format: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

/// Suballocation placement returned for a direct-mapped allocation: the
/// offset of the host mapping inside the session's address-space window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMapping {
    pub window_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VkCommand {
    GetExtensions,
    SetChecksumVersion {
        version: u32,
    },
    CreateInstance {
        app_name: Option<String>,
        api_version: u32,
        enabled_extensions: Vec<String>,
    },
    DestroyInstance {
        instance: BoxedHandle,
    },
    EnumeratePhysicalDevices {
        instance: BoxedHandle,
    },
    GetMemoryProperties {
        physical_device: BoxedHandle,
    },
    CreateDevice {
        physical_device: BoxedHandle,
        queue_family_index: u32,
        queue_count: u32,
        enabled_extensions: Vec<String>,
    },
    DestroyDevice {
        device: BoxedHandle,
    },
    GetDeviceQueue {
        device: BoxedHandle,
        queue_family_index: u32,
        queue_index: u32,
    },
    AllocateMemory {
        device: BoxedHandle,
        size: u64,
        memory_type_index: u32,
        direct_map: bool,
    },
    FreeMemory {
        device: BoxedHandle,
        memory: BoxedHandle,
    },
    FlushMappedRanges {
        device: BoxedHandle,
        ranges: Vec<MappedMemoryRange>,
        /// Shadow-buffer contents per range; empty for direct-mapped memory.
        data: Vec<Option<Vec<u8>>>,
    },
    InvalidateMappedRanges {
        device: BoxedHandle,
        ranges: Vec<MappedMemoryRange>,
    },
    CreateBuffer {
        device: BoxedHandle,
        size: u64,
        usage: u32,
    },
    DestroyBuffer {
        device: BoxedHandle,
        buffer: BoxedHandle,
    },
    GetBufferMemoryRequirements {
        device: BoxedHandle,
        buffer: BoxedHandle,
    },
    BindBufferMemory {
        device: BoxedHandle,
        buffer: BoxedHandle,
        memory: BoxedHandle,
        offset: u64,
    },
    CreateImage {
        device: BoxedHandle,
        width: u32,
        height: u32,
        format: u32,
        usage: u32,
    },
    DestroyImage {
        device: BoxedHandle,
        image: BoxedHandle,
    },
    BindImageMemory2 {
        device: BoxedHandle,
        image: BoxedHandle,
        memory: BoxedHandle,
        offset: u64,
        native_buffer: Option<NativeBufferInfo>,
    },
    CreateFence {
        device: BoxedHandle,
        signaled: bool,
    },
    DestroyFence {
        device: BoxedHandle,
        fence: BoxedHandle,
    },
    ResetFences {
        device: BoxedHandle,
        fences: Vec<BoxedHandle>,
    },
    WaitForFences {
        device: BoxedHandle,
        fences: Vec<BoxedHandle>,
        wait_all: bool,
        timeout_ns: u64,
    },
    CreateSemaphore {
        device: BoxedHandle,
    },
    DestroySemaphore {
        device: BoxedHandle,
        semaphore: BoxedHandle,
    },
    QueueSubmit {
        queue: BoxedHandle,
        submits: Vec<SubmitInfo>,
        fence: BoxedHandle,
    },
    QueueWaitIdle {
        queue: BoxedHandle,
    },
    DeviceWaitIdle {
        device: BoxedHandle,
    },
    AcquireImage {
        queue: BoxedHandle,
        image: BoxedHandle,
        fence: BoxedHandle,
        semaphore: BoxedHandle,
    },
    QueueSignalReleaseImage {
        queue: BoxedHandle,
        image: BoxedHandle,
    },
    CreateCommandPool {
        device: BoxedHandle,
        queue_family_index: u32,
    },
    DestroyCommandPool {
        device: BoxedHandle,
        pool: BoxedHandle,
    },
    AllocateCommandBuffers {
        device: BoxedHandle,
        pool: BoxedHandle,
        count: u32,
    },
    FreeCommandBuffers {
        device: BoxedHandle,
        pool: BoxedHandle,
        buffers: Vec<BoxedHandle>,
    },
}

fn write_range(w: &mut Writer, r: &MappedMemoryRange) {
    w.write_handle(r.memory);
    w.write_u64(r.offset);
    w.write_u64(r.size);
}

fn read_range(r: &mut Reader<'_>) -> Result<MappedMemoryRange, DecodeError> {
    Ok(MappedMemoryRange {
        memory: r.read_handle()?,
        offset: r.read_u64()?,
        size: r.read_u64()?,
    })
}

fn write_submit(w: &mut Writer, s: &SubmitInfo) {
    w.write_handle_seq(&s.wait_semaphores);
    w.write_u32_seq(&s.wait_dst_stage_masks);
    w.write_handle_seq(&s.command_buffers);
    w.write_handle_seq(&s.signal_semaphores);
}

fn read_submit(r: &mut Reader<'_>) -> Result<SubmitInfo, DecodeError> {
    Ok(SubmitInfo {
        wait_semaphores: r.read_handle_seq()?,
        wait_dst_stage_masks: r.read_u32_seq()?,
        command_buffers: r.read_handle_seq()?,
        signal_semaphores: r.read_handle_seq()?,
    })
}

impl VkCommand {
    pub fn opcode(&self) -> u32 {
        use opcodes::*;
        match self {
            VkCommand::GetExtensions => GET_EXTENSIONS,
            VkCommand::SetChecksumVersion { .. } => SET_CHECKSUM_VERSION,
            VkCommand::CreateInstance { .. } => CREATE_INSTANCE,
            VkCommand::DestroyInstance { .. } => DESTROY_INSTANCE,
            VkCommand::EnumeratePhysicalDevices { .. } => ENUMERATE_PHYSICAL_DEVICES,
            VkCommand::GetMemoryProperties { .. } => GET_MEMORY_PROPERTIES,
            VkCommand::CreateDevice { .. } => CREATE_DEVICE,
            VkCommand::DestroyDevice { .. } => DESTROY_DEVICE,
            VkCommand::GetDeviceQueue { .. } => GET_DEVICE_QUEUE,
            VkCommand::AllocateMemory { .. } => ALLOCATE_MEMORY,
            VkCommand::FreeMemory { .. } => FREE_MEMORY,
            VkCommand::FlushMappedRanges { .. } => FLUSH_MAPPED_RANGES,
            VkCommand::InvalidateMappedRanges { .. } => INVALIDATE_MAPPED_RANGES,
            VkCommand::CreateBuffer { .. } => CREATE_BUFFER,
            VkCommand::DestroyBuffer { .. } => DESTROY_BUFFER,
            VkCommand::GetBufferMemoryRequirements { .. } => GET_BUFFER_MEMORY_REQUIREMENTS,
            VkCommand::BindBufferMemory { .. } => BIND_BUFFER_MEMORY,
            VkCommand::CreateImage { .. } => CREATE_IMAGE,
            VkCommand::DestroyImage { .. } => DESTROY_IMAGE,
            VkCommand::BindImageMemory2 { .. } => BIND_IMAGE_MEMORY2,
            VkCommand::CreateFence { .. } => CREATE_FENCE,
            VkCommand::DestroyFence { .. } => DESTROY_FENCE,
            VkCommand::ResetFences { .. } => RESET_FENCES,
            VkCommand::WaitForFences { .. } => WAIT_FOR_FENCES,
            VkCommand::CreateSemaphore { .. } => CREATE_SEMAPHORE,
            VkCommand::DestroySemaphore { .. } => DESTROY_SEMAPHORE,
            VkCommand::QueueSubmit { .. } => QUEUE_SUBMIT,
            VkCommand::QueueWaitIdle { .. } => QUEUE_WAIT_IDLE,
            VkCommand::DeviceWaitIdle { .. } => DEVICE_WAIT_IDLE,
            VkCommand::AcquireImage { .. } => ACQUIRE_IMAGE,
            VkCommand::QueueSignalReleaseImage { .. } => QUEUE_SIGNAL_RELEASE_IMAGE,
            VkCommand::CreateCommandPool { .. } => CREATE_COMMAND_POOL,
            VkCommand::DestroyCommandPool { .. } => DESTROY_COMMAND_POOL,
            VkCommand::AllocateCommandBuffers { .. } => ALLOCATE_COMMAND_BUFFERS,
            VkCommand::FreeCommandBuffers { .. } => FREE_COMMAND_BUFFERS,
        }
    }

    /// The handle whose order info serializes this command, if any.
    pub fn ordered_handle(&self) -> Option<BoxedHandle> {
        match *self {
            VkCommand::DestroyInstance { instance } => Some(instance),
            VkCommand::AllocateMemory { device, .. }
            | VkCommand::FreeMemory { device, .. }
            | VkCommand::FlushMappedRanges { device, .. }
            | VkCommand::InvalidateMappedRanges { device, .. }
            | VkCommand::CreateBuffer { device, .. }
            | VkCommand::DestroyBuffer { device, .. }
            | VkCommand::BindBufferMemory { device, .. }
            | VkCommand::CreateImage { device, .. }
            | VkCommand::DestroyImage { device, .. }
            | VkCommand::BindImageMemory2 { device, .. }
            | VkCommand::CreateFence { device, .. }
            | VkCommand::DestroyFence { device, .. }
            | VkCommand::ResetFences { device, .. }
            | VkCommand::CreateSemaphore { device }
            | VkCommand::DestroySemaphore { device, .. }
            | VkCommand::DeviceWaitIdle { device }
            | VkCommand::DestroyDevice { device }
            | VkCommand::CreateCommandPool { device, .. }
            | VkCommand::DestroyCommandPool { device, .. }
            | VkCommand::AllocateCommandBuffers { device, .. }
            | VkCommand::FreeCommandBuffers { device, .. } => Some(device),
            VkCommand::QueueSubmit { queue, .. }
            | VkCommand::QueueWaitIdle { queue }
            | VkCommand::AcquireImage { queue, .. }
            | VkCommand::QueueSignalReleaseImage { queue, .. } => Some(queue),
            _ => None,
        }
    }

    pub fn encode_body(&self, w: &mut Writer) {
        match self {
            VkCommand::GetExtensions => {}
            VkCommand::SetChecksumVersion { version } => w.write_u32(*version),
            VkCommand::CreateInstance {
                app_name,
                api_version,
                enabled_extensions,
            } => {
                w.write_string(app_name.as_deref());
                w.write_u32(*api_version);
                w.write_seq(enabled_extensions, |w, s| w.write_string(Some(s)));
            }
            VkCommand::DestroyInstance { instance } => w.write_handle(*instance),
            VkCommand::EnumeratePhysicalDevices { instance } => w.write_handle(*instance),
            VkCommand::GetMemoryProperties { physical_device } => {
                w.write_handle(*physical_device)
            }
            VkCommand::CreateDevice {
                physical_device,
                queue_family_index,
                queue_count,
                enabled_extensions,
            } => {
                w.write_handle(*physical_device);
                w.write_u32(*queue_family_index);
                w.write_u32(*queue_count);
                w.write_seq(enabled_extensions, |w, s| w.write_string(Some(s)));
            }
            VkCommand::DestroyDevice { device } => w.write_handle(*device),
            VkCommand::GetDeviceQueue {
                device,
                queue_family_index,
                queue_index,
            } => {
                w.write_handle(*device);
                w.write_u32(*queue_family_index);
                w.write_u32(*queue_index);
            }
            VkCommand::AllocateMemory {
                device,
                size,
                memory_type_index,
                direct_map,
            } => {
                w.write_handle(*device);
                w.write_u64(*size);
                w.write_u32(*memory_type_index);
                w.write_bool(*direct_map);
            }
            VkCommand::FreeMemory { device, memory } => {
                w.write_handle(*device);
                w.write_handle(*memory);
            }
            VkCommand::FlushMappedRanges {
                device,
                ranges,
                data,
            } => {
                w.write_handle(*device);
                w.write_seq(ranges, write_range);
                w.write_seq(data, |w, d| {
                    w.write_opt(d.as_ref(), |w, bytes| w.write_blob(bytes))
                });
            }
            VkCommand::InvalidateMappedRanges { device, ranges } => {
                w.write_handle(*device);
                w.write_seq(ranges, write_range);
            }
            VkCommand::CreateBuffer {
                device,
                size,
                usage,
            } => {
                w.write_handle(*device);
                w.write_u64(*size);
                w.write_u32(*usage);
            }
            VkCommand::DestroyBuffer { device, buffer } => {
                w.write_handle(*device);
                w.write_handle(*buffer);
            }
            VkCommand::GetBufferMemoryRequirements { device, buffer } => {
                w.write_handle(*device);
                w.write_handle(*buffer);
            }
            VkCommand::BindBufferMemory {
                device,
                buffer,
                memory,
                offset,
            } => {
                w.write_handle(*device);
                w.write_handle(*buffer);
                w.write_handle(*memory);
                w.write_u64(*offset);
            }
            VkCommand::CreateImage {
                device,
                width,
                height,
                format,
                usage,
            } => {
                w.write_handle(*device);
                w.write_u32(*width);
                w.write_u32(*height);
                w.write_u32(*format);
                w.write_u32(*usage);
            }
            VkCommand::DestroyImage { device, image } => {
                w.write_handle(*device);
                w.write_handle(*image);
            }
            VkCommand::BindImageMemory2 {
                device,
                image,
                memory,
                offset,
                native_buffer,
            } => {
                w.write_handle(*device);
                w.write_handle(*image);
                w.write_handle(*memory);
                w.write_u64(*offset);
                w.write_opt(native_buffer.as_ref(), |w, nb| {
                    w.write_u64(nb.native_handle);
                    w.write_u32(nb.stride);
                    w.write_u32(nb.format);
                });
            }
            VkCommand::CreateFence { device, signaled } => {
                w.write_handle(*device);
                w.write_bool(*signaled);
            }
            VkCommand::DestroyFence { device, fence } => {
                w.write_handle(*device);
                w.write_handle(*fence);
            }
            VkCommand::ResetFences { device, fences } => {
                w.write_handle(*device);
                w.write_handle_seq(fences);
            }
            VkCommand::WaitForFences {
                device,
                fences,
                wait_all,
                timeout_ns,
            } => {
                w.write_handle(*device);
                w.write_handle_seq(fences);
                w.write_bool(*wait_all);
                w.write_u64(*timeout_ns);
            }
            VkCommand::CreateSemaphore { device } => w.write_handle(*device),
            VkCommand::DestroySemaphore { device, semaphore } => {
                w.write_handle(*device);
                w.write_handle(*semaphore);
            }
            VkCommand::QueueSubmit {
                queue,
                submits,
                fence,
            } => {
                w.write_handle(*queue);
                w.write_seq(submits, write_submit);
                w.write_handle(*fence);
            }
            VkCommand::QueueWaitIdle { queue } => w.write_handle(*queue),
            VkCommand::DeviceWaitIdle { device } => w.write_handle(*device),
            VkCommand::AcquireImage {
                queue,
                image,
                fence,
                semaphore,
            } => {
                w.write_handle(*queue);
                w.write_handle(*image);
                w.write_handle(*fence);
                w.write_handle(*semaphore);
            }
            VkCommand::QueueSignalReleaseImage { queue, image } => {
                w.write_handle(*queue);
                w.write_handle(*image);
            }
            VkCommand::CreateCommandPool {
                device,
                queue_family_index,
            } => {
                w.write_handle(*device);
                w.write_u32(*queue_family_index);
            }
            VkCommand::DestroyCommandPool { device, pool } => {
                w.write_handle(*device);
                w.write_handle(*pool);
            }
            VkCommand::AllocateCommandBuffers {
                device,
                pool,
                count,
            } => {
                w.write_handle(*device);
                w.write_handle(*pool);
                w.write_u32(*count);
            }
            VkCommand::FreeCommandBuffers {
                device,
                pool,
                buffers,
            } => {
                w.write_handle(*device);
                w.write_handle(*pool);
                w.write_handle_seq(buffers);
            }
        }
    }

    pub fn decode(opcode: u32, r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        use opcodes::*;
        let cmd = match opcode {
            GET_EXTENSIONS => VkCommand::GetExtensions,
            SET_CHECKSUM_VERSION => VkCommand::SetChecksumVersion {
                version: r.read_u32()?,
            },
            CREATE_INSTANCE => VkCommand::CreateInstance {
                app_name: r.read_string()?,
                api_version: r.read_u32()?,
                enabled_extensions: r.read_seq(|r| {
                    r.read_string()?.ok_or(DecodeError::BadString)
                })?,
            },
            DESTROY_INSTANCE => VkCommand::DestroyInstance {
                instance: r.read_handle()?,
            },
            ENUMERATE_PHYSICAL_DEVICES => VkCommand::EnumeratePhysicalDevices {
                instance: r.read_handle()?,
            },
            GET_MEMORY_PROPERTIES => VkCommand::GetMemoryProperties {
                physical_device: r.read_handle()?,
            },
            CREATE_DEVICE => VkCommand::CreateDevice {
                physical_device: r.read_handle()?,
                queue_family_index: r.read_u32()?,
                queue_count: r.read_u32()?,
                enabled_extensions: r.read_seq(|r| {
                    r.read_string()?.ok_or(DecodeError::BadString)
                })?,
            },
            DESTROY_DEVICE => VkCommand::DestroyDevice {
                device: r.read_handle()?,
            },
            GET_DEVICE_QUEUE => VkCommand::GetDeviceQueue {
                device: r.read_handle()?,
                queue_family_index: r.read_u32()?,
                queue_index: r.read_u32()?,
            },
            ALLOCATE_MEMORY => VkCommand::AllocateMemory {
                device: r.read_handle()?,
                size: r.read_u64()?,
                memory_type_index: r.read_u32()?,
                direct_map: r.read_bool()?,
            },
            FREE_MEMORY => VkCommand::FreeMemory {
                device: r.read_handle()?,
                memory: r.read_handle()?,
            },
            FLUSH_MAPPED_RANGES => VkCommand::FlushMappedRanges {
                device: r.read_handle()?,
                ranges: r.read_seq(read_range)?,
                data: r.read_seq(|r| r.read_opt(|r| r.read_blob()))?,
            },
            INVALIDATE_MAPPED_RANGES => VkCommand::InvalidateMappedRanges {
                device: r.read_handle()?,
                ranges: r.read_seq(read_range)?,
            },
            CREATE_BUFFER => VkCommand::CreateBuffer {
                device: r.read_handle()?,
                size: r.read_u64()?,
                usage: r.read_u32()?,
            },
            DESTROY_BUFFER => VkCommand::DestroyBuffer {
                device: r.read_handle()?,
                buffer: r.read_handle()?,
            },
            GET_BUFFER_MEMORY_REQUIREMENTS => VkCommand::GetBufferMemoryRequirements {
                device: r.read_handle()?,
                buffer: r.read_handle()?,
            },
            BIND_BUFFER_MEMORY => VkCommand::BindBufferMemory {
                device: r.read_handle()?,
                buffer: r.read_handle()?,
                memory: r.read_handle()?,
                offset: r.read_u64()?,
            },
            CREATE_IMAGE => VkCommand::CreateImage {
                device: r.read_handle()?,
                width: r.read_u32()?,
                height: r.read_u32()?,
                format: r.read_u32()?,
                usage: r.read_u32()?,
            },
            DESTROY_IMAGE => VkCommand::DestroyImage {
                device: r.read_handle()?,
                image: r.read_handle()?,
            },
            BIND_IMAGE_MEMORY2 => VkCommand::BindImageMemory2 {
                device: r.read_handle()?,
                image: r.read_handle()?,
                memory: r.read_handle()?,
                offset: r.read_u64()?,
                native_buffer: r.read_opt(|r| {
                    Ok(NativeBufferInfo {
                        native_handle: r.read_u64()?,
                        stride: r.read_u32()?,
                        format: r.read_u32()?,
                    })
                })?,
            },
            CREATE_FENCE => VkCommand::CreateFence {
                device: r.read_handle()?,
                signaled: r.read_bool()?,
            },
            DESTROY_FENCE => VkCommand::DestroyFence {
                device: r.read_handle()?,
                fence: r.read_handle()?,
            },
            RESET_FENCES => VkCommand::ResetFences {
                device: r.read_handle()?,
                fences: r.read_handle_seq()?,
            },
            WAIT_FOR_FENCES => VkCommand::WaitForFences {
                device: r.read_handle()?,
                fences: r.read_handle_seq()?,
                wait_all: r.read_bool()?,
                timeout_ns: r.read_u64()?,
            },
            CREATE_SEMAPHORE => VkCommand::CreateSemaphore {
                device: r.read_handle()?,
            },
            DESTROY_SEMAPHORE => VkCommand::DestroySemaphore {
                device: r.read_handle()?,
                semaphore: r.read_handle()?,
            },
            QUEUE_SUBMIT => VkCommand::QueueSubmit {
                queue: r.read_handle()?,
                submits: r.read_seq(read_submit)?,
                fence: r.read_handle()?,
            },
            QUEUE_WAIT_IDLE => VkCommand::QueueWaitIdle {
                queue: r.read_handle()?,
            },
            DEVICE_WAIT_IDLE => VkCommand::DeviceWaitIdle {
                device: r.read_handle()?,
            },
            ACQUIRE_IMAGE => VkCommand::AcquireImage {
                queue: r.read_handle()?,
                image: r.read_handle()?,
                fence: r.read_handle()?,
                semaphore: r.read_handle()?,
            },
            QUEUE_SIGNAL_RELEASE_IMAGE => VkCommand::QueueSignalReleaseImage {
                queue: r.read_handle()?,
                image: r.read_handle()?,
            },
            CREATE_COMMAND_POOL => VkCommand::CreateCommandPool {
                device: r.read_handle()?,
                queue_family_index: r.read_u32()?,
            },
            DESTROY_COMMAND_POOL => VkCommand::DestroyCommandPool {
                device: r.read_handle()?,
                pool: r.read_handle()?,
            },
            ALLOCATE_COMMAND_BUFFERS => VkCommand::AllocateCommandBuffers {
                device: r.read_handle()?,
                pool: r.read_handle()?,
                count: r.read_u32()?,
            },
            FREE_COMMAND_BUFFERS => VkCommand::FreeCommandBuffers {
                device: r.read_handle()?,
                pool: r.read_handle()?,
                buffers: r.read_handle_seq()?,
            },
            other => return Err(DecodeError::BadOpcode(other)),
        };
        Ok(cmd)
    }
}

/// Response bodies. A response frame carries the opcode and sequence number
/// of the command it answers; the body starts with a kind tag.
#[derive(Debug, Clone, PartialEq)]
pub enum VkResponse {
    Ok,
    Error {
        result: i32,
    },
    Handle {
        handle: BoxedHandle,
    },
    Handles {
        handles: Vec<BoxedHandle>,
    },
    MemoryProperties {
        props: MemoryProperties,
    },
    MemoryAllocated {
        handle: BoxedHandle,
        direct: Option<DirectMapping>,
    },
    MemoryRequirements {
        reqs: MemoryRequirements,
    },
    WaitResult {
        result: i32,
    },
    SyncFd {
        fd: i64,
    },
    ExtensionList {
        extensions: String,
    },
    RangeData {
        data: Vec<Vec<u8>>,
    },
}

mod response_kind {
    pub const OK: u32 = 0;
    pub const ERROR: u32 = 1;
    pub const HANDLE: u32 = 2;
    pub const HANDLES: u32 = 3;
    pub const MEMORY_PROPERTIES: u32 = 4;
    pub const MEMORY_ALLOCATED: u32 = 5;
    pub const MEMORY_REQUIREMENTS: u32 = 6;
    pub const WAIT_RESULT: u32 = 7;
    pub const SYNC_FD: u32 = 8;
    pub const EXTENSION_LIST: u32 = 9;
    pub const RANGE_DATA: u32 = 10;
}

impl VkResponse {
    pub fn error(result: i32) -> Self {
        VkResponse::Error { result }
    }

    pub fn encode_body(&self, w: &mut Writer) {
        use response_kind::*;
        match self {
            VkResponse::Ok => w.write_u32(OK),
            VkResponse::Error { result } => {
                w.write_u32(ERROR);
                w.write_i32(*result);
            }
            VkResponse::Handle { handle } => {
                w.write_u32(HANDLE);
                w.write_handle(*handle);
            }
            VkResponse::Handles { handles } => {
                w.write_u32(HANDLES);
                w.write_handle_seq(handles);
            }
            VkResponse::MemoryProperties { props } => {
                w.write_u32(MEMORY_PROPERTIES);
                w.write_seq(&props.memory_types, |w, t| {
                    w.write_u32(t.property_flags);
                    w.write_u32(t.heap_index);
                });
                w.write_seq(&props.memory_heaps, |w, h| {
                    w.write_u64(h.size);
                    w.write_u32(h.flags);
                });
            }
            VkResponse::MemoryAllocated { handle, direct } => {
                w.write_u32(MEMORY_ALLOCATED);
                w.write_handle(*handle);
                w.write_opt(direct.as_ref(), |w, d| {
                    w.write_u64(d.window_offset);
                    w.write_u64(d.size);
                });
            }
            VkResponse::MemoryRequirements { reqs } => {
                w.write_u32(MEMORY_REQUIREMENTS);
                w.write_u64(reqs.size);
                w.write_u64(reqs.alignment);
                w.write_u32(reqs.memory_type_bits);
            }
            VkResponse::WaitResult { result } => {
                w.write_u32(WAIT_RESULT);
                w.write_i32(*result);
            }
            VkResponse::SyncFd { fd } => {
                w.write_u32(SYNC_FD);
                w.write_i64(*fd);
            }
            VkResponse::ExtensionList { extensions } => {
                w.write_u32(EXTENSION_LIST);
                w.write_string(Some(extensions));
            }
            VkResponse::RangeData { data } => {
                w.write_u32(RANGE_DATA);
                w.write_seq(data, |w, d| w.write_blob(d));
            }
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        use response_kind::*;
        let kind = r.read_u32()?;
        let resp = match kind {
            OK => VkResponse::Ok,
            ERROR => VkResponse::Error {
                result: r.read_i32()?,
            },
            HANDLE => VkResponse::Handle {
                handle: r.read_handle()?,
            },
            HANDLES => VkResponse::Handles {
                handles: r.read_handle_seq()?,
            },
            MEMORY_PROPERTIES => VkResponse::MemoryProperties {
                props: MemoryProperties {
                    memory_types: r.read_seq(|r| {
                        Ok(MemoryType {
                            property_flags: r.read_u32()?,
                            heap_index: r.read_u32()?,
                        })
                    })?,
                    memory_heaps: r.read_seq(|r| {
                        Ok(MemoryHeap {
                            size: r.read_u64()?,
                            flags: r.read_u32()?,
                        })
                    })?,
                },
            },
            MEMORY_ALLOCATED => VkResponse::MemoryAllocated {
                handle: r.read_handle()?,
                direct: r.read_opt(|r| {
                    Ok(DirectMapping {
                        window_offset: r.read_u64()?,
                        size: r.read_u64()?,
                    })
                })?,
            },
            MEMORY_REQUIREMENTS => VkResponse::MemoryRequirements {
                reqs: MemoryRequirements {
                    size: r.read_u64()?,
                    alignment: r.read_u64()?,
                    memory_type_bits: r.read_u32()?,
                },
            },
            WAIT_RESULT => VkResponse::WaitResult {
                result: r.read_i32()?,
            },
            SYNC_FD => VkResponse::SyncFd { fd: r.read_i64()? },
            EXTENSION_LIST => VkResponse::ExtensionList {
                extensions: r.read_string()?.ok_or(DecodeError::BadString)?,
            },
            RANGE_DATA => VkResponse::RangeData {
                data: r.read_seq(|r| r.read_blob())?,
            },
            tag => {
                return Err(DecodeError::BadTag {
                    what: "VkResponse",
                    tag,
                })
            }
        };
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(cmd: VkCommand) {
        let mut w = Writer::new();
        cmd.encode_body(&mut w);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        let decoded = VkCommand::decode(cmd.opcode(), &mut r).unwrap();
        r.finish().unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn commands_round_trip() {
        round_trip(VkCommand::CreateInstance {
            app_name: Some("triangle".into()),
            api_version: 0x40_0000,
            enabled_extensions: vec!["VK_KHR_surface".into()],
        });
        round_trip(VkCommand::AllocateMemory {
            device: 0x1_0000_0002,
            size: 16384,
            memory_type_index: 1,
            direct_map: true,
        });
        round_trip(VkCommand::QueueSubmit {
            queue: 0x1_0000_0004,
            submits: vec![SubmitInfo {
                wait_semaphores: vec![10, 11],
                wait_dst_stage_masks: vec![0x400, 0x800],
                command_buffers: vec![12],
                signal_semaphores: vec![],
            }],
            fence: 13,
        });
        round_trip(VkCommand::BindImageMemory2 {
            device: 2,
            image: 3,
            memory: 0,
            offset: 0,
            native_buffer: Some(NativeBufferInfo {
                native_handle: 0xCAFE,
                stride: 256,
                format: 37,
            }),
        });
        round_trip(VkCommand::FlushMappedRanges {
            device: 2,
            ranges: vec![MappedMemoryRange {
                memory: 5,
                offset: 0,
                size: 4096,
            }],
            data: vec![Some(vec![0xAB; 16]), None],
        });
    }

    #[test]
    fn responses_round_trip() {
        for resp in [
            VkResponse::Ok,
            VkResponse::Error {
                result: vk_result::ERROR_DEVICE_LOST,
            },
            VkResponse::Handles {
                handles: vec![1, 2, 3],
            },
            VkResponse::MemoryAllocated {
                handle: 77,
                direct: Some(DirectMapping {
                    window_offset: 0x1000,
                    size: 16384,
                }),
            },
            VkResponse::ExtensionList {
                extensions: "GSTREAM_vulkan GSTREAM_checksum_v1".into(),
            },
        ] {
            let mut w = Writer::new();
            resp.encode_body(&mut w);
            let bytes = w.into_bytes();
            let mut r = Reader::new(&bytes);
            assert_eq!(VkResponse::decode(&mut r).unwrap(), resp);
            r.finish().unwrap();
        }
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let mut r = Reader::new(&[]);
        assert_eq!(
            VkCommand::decode(0xFFFF, &mut r),
            Err(DecodeError::BadOpcode(0xFFFF))
        );
    }
}
