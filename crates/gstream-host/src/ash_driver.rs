//! Real-GPU driver backed by the machine's Vulkan ICD via `ash`.
//!
//! Native handles cross the [`HostDriver`] seam as raw u64 values; wrapper
//! objects (`ash::Instance`, `ash::Device`) are kept here keyed by those
//! raw values. Direct mapping of host-visible memory into the guest's
//! address-space window needs VM integration this driver does not have, so
//! it reports every allocation as non-direct and the guest falls back to
//! shadow buffers.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk::{self, Handle};
use dashmap::{DashMap, DashSet};
use tracing::{debug, error, info};

use gstream_protocol::commands::{
    vk_result, MemoryHeap, MemoryProperties, MemoryRequirements, MemoryType, NativeBufferInfo,
};

use crate::driver::{
    AllocatedMemory, DriverError, DriverResult, HostDriver, ReleaseSignal, ResolvedSubmit,
};

fn vk_err(result: vk::Result) -> DriverError {
    DriverError::new(result.as_raw())
}

pub struct AshDriver {
    entry: Arc<ash::Entry>,
    instances: DashMap<u64, ash::Instance>,
    /// physical device raw -> owning instance raw
    physical_devices: DashMap<u64, u64>,
    devices: DashMap<u64, ash::Device>,
    /// (device raw, family) -> queue count actually created
    queue_counts: DashMap<(u64, u32), u32>,
    /// queue raw -> owning device raw
    queue_devices: DashMap<u64, u64>,
    /// Fences signaled by internal acquire submits, cleared at idle.
    in_flight_fences: DashSet<u64>,
}

impl AshDriver {
    pub fn load() -> DriverResult<Self> {
        // SAFETY: loading the system loader; no Vulkan calls made yet.
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            error!("failed to load Vulkan loader: {e}");
            DriverError::new(vk_result::ERROR_EXTENSION_NOT_PRESENT)
        })?;
        info!("Vulkan loader ready");
        Ok(Self {
            entry: Arc::new(entry),
            instances: DashMap::new(),
            physical_devices: DashMap::new(),
            devices: DashMap::new(),
            queue_counts: DashMap::new(),
            queue_devices: DashMap::new(),
            in_flight_fences: DashSet::new(),
        })
    }

    fn instance_of_physical(&self, physical_device: u64) -> DriverResult<ash::Instance> {
        let instance_raw = self
            .physical_devices
            .get(&physical_device)
            .map(|e| *e.value())
            .ok_or(DriverError::new(vk_result::ERROR_UNKNOWN))?;
        self.instances
            .get(&instance_raw)
            .map(|i| i.clone())
            .ok_or(DriverError::new(vk_result::ERROR_UNKNOWN))
    }

    fn device(&self, device: u64) -> DriverResult<ash::Device> {
        self.devices
            .get(&device)
            .map(|d| d.clone())
            .ok_or(DriverError::new(vk_result::ERROR_DEVICE_LOST))
    }

    fn device_of_queue(&self, queue: u64) -> DriverResult<ash::Device> {
        let device_raw = self
            .queue_devices
            .get(&queue)
            .map(|e| *e.value())
            .ok_or(DriverError::new(vk_result::ERROR_DEVICE_LOST))?;
        self.device(device_raw)
    }
}

impl HostDriver for AshDriver {
    fn create_instance(
        &self,
        app_name: Option<&str>,
        api_version: u32,
        enabled_extensions: &[String],
    ) -> DriverResult<u64> {
        let app_name_c = app_name
            .map(|s| CString::new(s).unwrap_or_default());
        let mut app_info = vk::ApplicationInfo::default().api_version(if api_version == 0 {
            vk::make_api_version(0, 1, 1, 0)
        } else {
            api_version
        });
        if let Some(name) = &app_name_c {
            app_info = app_info.application_name(name.as_c_str());
        }

        let extension_names: Vec<CString> = enabled_extensions
            .iter()
            .filter_map(|s| CString::new(s.as_str()).ok())
            .collect();
        let extension_ptrs: Vec<*const i8> =
            extension_names.iter().map(|s| s.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs);

        // SAFETY: create_info and everything it points at outlive the call.
        let instance = unsafe { self.entry.create_instance(&create_info, None) }
            .map_err(vk_err)?;
        let raw = instance.handle().as_raw();
        self.instances.insert(raw, instance);
        info!(instance = format_args!("{raw:#x}"), "created instance");
        Ok(raw)
    }

    fn destroy_instance(&self, instance: u64) {
        if let Some((_, wrapper)) = self.instances.remove(&instance) {
            self.physical_devices.retain(|_, inst| *inst != instance);
            // SAFETY: all child objects are destroyed by the decoder first.
            unsafe { wrapper.destroy_instance(None) };
        }
    }

    fn enumerate_physical_devices(&self, instance: u64) -> DriverResult<Vec<u64>> {
        let wrapper = self
            .instances
            .get(&instance)
            .ok_or(DriverError::new(vk_result::ERROR_UNKNOWN))?;
        // SAFETY: instance is live.
        let devices = unsafe { wrapper.enumerate_physical_devices() }.map_err(vk_err)?;
        let mut raws = Vec::with_capacity(devices.len());
        for pd in devices {
            let raw = pd.as_raw();
            self.physical_devices.insert(raw, instance);
            raws.push(raw);
        }
        debug!(count = raws.len(), "enumerated physical devices");
        Ok(raws)
    }

    fn memory_properties(&self, physical_device: u64) -> DriverResult<MemoryProperties> {
        let instance = self.instance_of_physical(physical_device)?;
        let pd = vk::PhysicalDevice::from_raw(physical_device);
        // SAFETY: pd came from this instance's enumeration.
        let props = unsafe { instance.get_physical_device_memory_properties(pd) };
        Ok(MemoryProperties {
            memory_types: (0..props.memory_type_count as usize)
                .map(|i| MemoryType {
                    property_flags: props.memory_types[i].property_flags.as_raw(),
                    heap_index: props.memory_types[i].heap_index,
                })
                .collect(),
            memory_heaps: (0..props.memory_heap_count as usize)
                .map(|i| MemoryHeap {
                    size: props.memory_heaps[i].size,
                    flags: props.memory_heaps[i].flags.as_raw(),
                })
                .collect(),
        })
    }

    fn non_coherent_atom_size(&self, physical_device: u64) -> u64 {
        let Ok(instance) = self.instance_of_physical(physical_device) else {
            return 64;
        };
        let pd = vk::PhysicalDevice::from_raw(physical_device);
        // SAFETY: pd came from this instance's enumeration.
        let props = unsafe { instance.get_physical_device_properties(pd) };
        props.limits.non_coherent_atom_size
    }

    fn create_device(
        &self,
        physical_device: u64,
        queue_family_index: u32,
        queue_count: u32,
        enabled_extensions: &[String],
    ) -> DriverResult<u64> {
        let instance = self.instance_of_physical(physical_device)?;
        let pd = vk::PhysicalDevice::from_raw(physical_device);

        // SAFETY: pd came from this instance's enumeration.
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(pd) };
        let available = families
            .get(queue_family_index as usize)
            .map(|f| f.queue_count)
            .unwrap_or(1);
        let created = queue_count.clamp(1, available);
        let priorities = vec![1.0f32; created as usize];

        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);
        let queue_infos = [queue_info];

        let extension_names: Vec<CString> = enabled_extensions
            .iter()
            .filter_map(|s| CString::new(s.as_str()).ok())
            .collect();
        let extension_ptrs: Vec<*const i8> =
            extension_names.iter().map(|s| s.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs);

        // SAFETY: create_info and everything it points at outlive the call.
        let device = unsafe { instance.create_device(pd, &create_info, None) }
            .map_err(vk_err)?;
        let raw = device.handle().as_raw();
        self.devices.insert(raw, device);
        self.queue_counts.insert((raw, queue_family_index), created);
        info!(device = format_args!("{raw:#x}"), created, "created device");
        Ok(raw)
    }

    fn destroy_device(&self, device: u64) {
        if let Some((_, wrapper)) = self.devices.remove(&device) {
            self.queue_counts.retain(|&(dev, _), _| dev != device);
            self.queue_devices.retain(|_, dev| *dev != device);
            // SAFETY: the decoder waited for idle before destroying.
            unsafe { wrapper.destroy_device(None) };
        }
    }

    fn device_queue(
        &self,
        device: u64,
        queue_family_index: u32,
        queue_index: u32,
    ) -> DriverResult<u64> {
        let wrapper = self.device(device)?;
        let created = self
            .queue_counts
            .get(&(device, queue_family_index))
            .map(|c| *c.value())
            .unwrap_or(1);
        // Indices past what was created collapse onto the last real queue;
        // the decoder virtualizes them.
        let index = queue_index.min(created.saturating_sub(1));
        // SAFETY: the index was clamped to what create_device requested.
        let queue = unsafe { wrapper.get_device_queue(queue_family_index, index) };
        let raw = queue.as_raw();
        self.queue_devices.insert(raw, device);
        Ok(raw)
    }

    fn allocate_memory(
        &self,
        device: u64,
        size: u64,
        memory_type_index: u32,
        _direct_map: bool,
    ) -> DriverResult<AllocatedMemory> {
        let wrapper = self.device(device)?;
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        // SAFETY: info is fully initialized.
        let memory = unsafe { wrapper.allocate_memory(&info, None) }.map_err(vk_err)?;
        Ok(AllocatedMemory {
            handle: memory.as_raw(),
            // Window integration is a VMM concern; shadow path only.
            direct: None,
        })
    }

    fn free_memory(&self, device: u64, memory: u64) {
        if let Ok(wrapper) = self.device(device) {
            // SAFETY: the decoder guarantees the memory is unbound.
            unsafe { wrapper.free_memory(vk::DeviceMemory::from_raw(memory), None) };
        }
    }

    fn write_memory(
        &self,
        device: u64,
        memory: u64,
        offset: u64,
        data: &[u8],
    ) -> DriverResult<()> {
        let wrapper = self.device(device)?;
        let memory = vk::DeviceMemory::from_raw(memory);
        // SAFETY: the guest only flushes ranges inside its allocation.
        unsafe {
            let ptr = wrapper
                .map_memory(memory, offset, data.len() as u64, vk::MemoryMapFlags::empty())
                .map_err(vk_err)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            wrapper.unmap_memory(memory);
        }
        Ok(())
    }

    fn read_memory(
        &self,
        device: u64,
        memory: u64,
        offset: u64,
        size: u64,
    ) -> DriverResult<Vec<u8>> {
        let wrapper = self.device(device)?;
        let memory = vk::DeviceMemory::from_raw(memory);
        let mut out = vec![0u8; size as usize];
        // SAFETY: the guest only invalidates ranges inside its allocation.
        unsafe {
            let ptr = wrapper
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
                .map_err(vk_err)?;
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.as_mut_ptr(), out.len());
            wrapper.unmap_memory(memory);
        }
        Ok(out)
    }

    fn create_buffer(&self, device: u64, size: u64, usage: u32) -> DriverResult<u64> {
        let wrapper = self.device(device)?;
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::from_raw(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: info is fully initialized.
        let buffer = unsafe { wrapper.create_buffer(&info, None) }.map_err(vk_err)?;
        Ok(buffer.as_raw())
    }

    fn destroy_buffer(&self, device: u64, buffer: u64) {
        if let Ok(wrapper) = self.device(device) {
            // SAFETY: externally synchronized by the decoder.
            unsafe { wrapper.destroy_buffer(vk::Buffer::from_raw(buffer), None) };
        }
    }

    fn buffer_memory_requirements(
        &self,
        device: u64,
        buffer: u64,
    ) -> DriverResult<MemoryRequirements> {
        let wrapper = self.device(device)?;
        // SAFETY: buffer is live.
        let reqs = unsafe {
            wrapper.get_buffer_memory_requirements(vk::Buffer::from_raw(buffer))
        };
        Ok(MemoryRequirements {
            size: reqs.size,
            alignment: reqs.alignment,
            memory_type_bits: reqs.memory_type_bits,
        })
    }

    fn bind_buffer_memory(
        &self,
        device: u64,
        buffer: u64,
        memory: u64,
        offset: u64,
    ) -> DriverResult<()> {
        let wrapper = self.device(device)?;
        // SAFETY: handles are live, offset honors the alignment the guest
        // obtained from the requirements query.
        unsafe {
            wrapper.bind_buffer_memory(
                vk::Buffer::from_raw(buffer),
                vk::DeviceMemory::from_raw(memory),
                offset,
            )
        }
        .map_err(vk_err)
    }

    fn create_image(
        &self,
        device: u64,
        width: u32,
        height: u32,
        format: u32,
        usage: u32,
    ) -> DriverResult<u64> {
        let wrapper = self.device(device)?;
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::from_raw(format as i32))
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::from_raw(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        // SAFETY: info is fully initialized.
        let image = unsafe { wrapper.create_image(&info, None) }.map_err(vk_err)?;
        Ok(image.as_raw())
    }

    fn destroy_image(&self, device: u64, image: u64) {
        if let Ok(wrapper) = self.device(device) {
            // SAFETY: externally synchronized by the decoder.
            unsafe { wrapper.destroy_image(vk::Image::from_raw(image), None) };
        }
    }

    fn bind_image_memory(
        &self,
        device: u64,
        image: u64,
        memory: u64,
        offset: u64,
        native_buffer: Option<&NativeBufferInfo>,
    ) -> DriverResult<()> {
        if native_buffer.is_some() && memory == 0 {
            // Native-buffer imports carry their own backing; nothing to
            // bind on a stock ICD.
            return Ok(());
        }
        let wrapper = self.device(device)?;
        // SAFETY: handles are live, offset honors alignment.
        unsafe {
            wrapper.bind_image_memory(
                vk::Image::from_raw(image),
                vk::DeviceMemory::from_raw(memory),
                offset,
            )
        }
        .map_err(vk_err)
    }

    fn create_fence(&self, device: u64, signaled: bool) -> DriverResult<u64> {
        let wrapper = self.device(device)?;
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: info is fully initialized.
        let fence = unsafe { wrapper.create_fence(&info, None) }.map_err(vk_err)?;
        Ok(fence.as_raw())
    }

    fn destroy_fence(&self, device: u64, fence: u64) {
        self.in_flight_fences.remove(&fence);
        if let Ok(wrapper) = self.device(device) {
            // SAFETY: the decoder defers destruction of in-flight fences.
            unsafe { wrapper.destroy_fence(vk::Fence::from_raw(fence), None) };
        }
    }

    fn reset_fences(&self, device: u64, fences: &[u64]) -> DriverResult<()> {
        let wrapper = self.device(device)?;
        let fences: Vec<vk::Fence> =
            fences.iter().map(|&f| vk::Fence::from_raw(f)).collect();
        // SAFETY: fences are live and not in use by pending submits.
        unsafe { wrapper.reset_fences(&fences) }.map_err(vk_err)
    }

    fn wait_for_fences(
        &self,
        device: u64,
        fences: &[u64],
        wait_all: bool,
        timeout_ns: u64,
    ) -> DriverResult<i32> {
        let wrapper = self.device(device)?;
        let fences: Vec<vk::Fence> =
            fences.iter().map(|&f| vk::Fence::from_raw(f)).collect();
        // SAFETY: fences are live.
        match unsafe { wrapper.wait_for_fences(&fences, wait_all, timeout_ns) } {
            Ok(()) => Ok(vk_result::SUCCESS),
            Err(vk::Result::TIMEOUT) => Ok(vk_result::TIMEOUT),
            Err(e) => Err(vk_err(e)),
        }
    }

    fn fence_in_flight(&self, _device: u64, fence: u64) -> bool {
        self.in_flight_fences.contains(&fence)
    }

    fn create_semaphore(&self, device: u64) -> DriverResult<u64> {
        let wrapper = self.device(device)?;
        let info = vk::SemaphoreCreateInfo::default();
        // SAFETY: info is fully initialized.
        let semaphore =
            unsafe { wrapper.create_semaphore(&info, None) }.map_err(vk_err)?;
        Ok(semaphore.as_raw())
    }

    fn destroy_semaphore(&self, device: u64, semaphore: u64) {
        if let Ok(wrapper) = self.device(device) {
            // SAFETY: the decoder defers destruction of pending semaphores.
            unsafe {
                wrapper.destroy_semaphore(vk::Semaphore::from_raw(semaphore), None)
            };
        }
    }

    fn queue_submit(
        &self,
        queue: u64,
        submits: &[ResolvedSubmit],
        fence: u64,
    ) -> DriverResult<()> {
        let wrapper = self.device_of_queue(queue)?;
        let queue = vk::Queue::from_raw(queue);

        struct Converted {
            wait: Vec<vk::Semaphore>,
            stages: Vec<vk::PipelineStageFlags>,
            buffers: Vec<vk::CommandBuffer>,
            signal: Vec<vk::Semaphore>,
        }
        let converted: Vec<Converted> = submits
            .iter()
            .map(|s| Converted {
                wait: s
                    .wait_semaphores
                    .iter()
                    .map(|&h| vk::Semaphore::from_raw(h))
                    .collect(),
                stages: s
                    .wait_dst_stage_masks
                    .iter()
                    .map(|&m| vk::PipelineStageFlags::from_raw(m))
                    .collect(),
                buffers: s
                    .command_buffers
                    .iter()
                    .map(|&h| vk::CommandBuffer::from_raw(h))
                    .collect(),
                signal: s
                    .signal_semaphores
                    .iter()
                    .map(|&h| vk::Semaphore::from_raw(h))
                    .collect(),
            })
            .collect();

        let infos: Vec<vk::SubmitInfo> = converted
            .iter()
            .map(|c| {
                vk::SubmitInfo::default()
                    .wait_semaphores(&c.wait)
                    .wait_dst_stage_mask(&c.stages)
                    .command_buffers(&c.buffers)
                    .signal_semaphores(&c.signal)
            })
            .collect();

        // SAFETY: the decoder serializes submissions per physical queue;
        // `converted` outlives the call.
        unsafe { wrapper.queue_submit(queue, &infos, vk::Fence::from_raw(fence)) }
            .map_err(vk_err)
    }

    fn queue_wait_idle(&self, queue: u64) -> DriverResult<()> {
        let wrapper = self.device_of_queue(queue)?;
        // SAFETY: externally synchronized per physical queue.
        unsafe { wrapper.queue_wait_idle(vk::Queue::from_raw(queue)) }.map_err(vk_err)?;
        self.in_flight_fences.clear();
        Ok(())
    }

    fn device_wait_idle(&self, device: u64) -> DriverResult<()> {
        let wrapper = self.device(device)?;
        // SAFETY: device is live.
        unsafe { wrapper.device_wait_idle() }.map_err(vk_err)?;
        self.in_flight_fences.clear();
        Ok(())
    }

    fn acquire_image(
        &self,
        queue: u64,
        _image: u64,
        fence: u64,
        semaphore: u64,
    ) -> DriverResult<()> {
        let wrapper = self.device_of_queue(queue)?;
        let queue = vk::Queue::from_raw(queue);
        let signal: Vec<vk::Semaphore> = if semaphore != 0 {
            vec![vk::Semaphore::from_raw(semaphore)]
        } else {
            vec![]
        };
        let info = vk::SubmitInfo::default().signal_semaphores(&signal);
        // SAFETY: empty batch; only signals the guest's sync objects.
        unsafe { wrapper.queue_submit(queue, &[info], vk::Fence::from_raw(fence)) }
            .map_err(vk_err)?;
        if fence != 0 {
            self.in_flight_fences.insert(fence);
        }
        Ok(())
    }

    fn signal_release_image(
        &self,
        queue: u64,
        _image: u64,
        done: ReleaseSignal,
    ) -> DriverResult<()> {
        let wrapper = self.device_of_queue(queue)?;
        let queue_handle = vk::Queue::from_raw(queue);

        let info = vk::FenceCreateInfo::default();
        // SAFETY: info is fully initialized.
        let fence = unsafe { wrapper.create_fence(&info, None) }.map_err(vk_err)?;
        let submit = vk::SubmitInfo::default();
        // SAFETY: empty batch marking the release point on the queue.
        unsafe { wrapper.queue_submit(queue_handle, &[submit], fence) }.map_err(vk_err)?;

        let device = wrapper.clone();
        std::thread::spawn(move || {
            // SAFETY: the fence belongs to this device and is waited on by
            // only this thread.
            unsafe {
                let _ = device.wait_for_fences(&[fence], true, u64::MAX);
                device.destroy_fence(fence, None);
            }
            done();
        });
        Ok(())
    }

    fn create_command_pool(&self, device: u64, queue_family_index: u32) -> DriverResult<u64> {
        let wrapper = self.device(device)?;
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        // SAFETY: info is fully initialized.
        let pool = unsafe { wrapper.create_command_pool(&info, None) }.map_err(vk_err)?;
        Ok(pool.as_raw())
    }

    fn destroy_command_pool(&self, device: u64, pool: u64) {
        if let Ok(wrapper) = self.device(device) {
            // SAFETY: externally synchronized by the decoder.
            unsafe {
                wrapper.destroy_command_pool(vk::CommandPool::from_raw(pool), None)
            };
        }
    }

    fn allocate_command_buffers(
        &self,
        device: u64,
        pool: u64,
        count: u32,
    ) -> DriverResult<Vec<u64>> {
        let wrapper = self.device(device)?;
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(vk::CommandPool::from_raw(pool))
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        // SAFETY: pool is live and owned by this device.
        let buffers =
            unsafe { wrapper.allocate_command_buffers(&info) }.map_err(vk_err)?;
        Ok(buffers.into_iter().map(|b| b.as_raw()).collect())
    }

    fn free_command_buffers(&self, device: u64, pool: u64, buffers: &[u64]) {
        if let Ok(wrapper) = self.device(device) {
            let buffers: Vec<vk::CommandBuffer> = buffers
                .iter()
                .map(|&b| vk::CommandBuffer::from_raw(b))
                .collect();
            // SAFETY: buffers belong to this pool and are not pending.
            unsafe {
                wrapper.free_command_buffers(vk::CommandPool::from_raw(pool), &buffers)
            };
        }
    }
}
