//! The host decoder: frame loop, handle translation, driver dispatch.
//!
//! One decoder serves one guest process. Each transport channel gets its own
//! serving thread; commands stamped against the same ordered handle are
//! serialized across channels by the registry's order info, everything else
//! runs in arrival order.

use std::sync::Arc;

use dashmap::DashMap;
use gstream_common::AddressSpaceWindow;
use gstream_protocol::commands::{vk_result, DirectMapping, VkCommand, VkResponse};
use gstream_protocol::handle::{BoxedHandle, HandleTag, NULL_HANDLE, VIRTUAL_QUEUE_BIT};
use gstream_protocol::{Reader, Writer};
use gstream_transport::error::TransportError;
use gstream_transport::frame::{read_frame, write_eos, write_frame};
use gstream_transport::handshake::SessionInfo;
use gstream_transport::Channel;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::driver::{DriverError, HostDriver, ResolvedSubmit};
use crate::process::ProcessResources;
use crate::queue::QueueTable;
use crate::registry::HandleRegistry;
use crate::snapshot::{HostSnapshot, MemoryImage, ReplayEntry, SnapshotError};

struct AllocationRecord {
    device: BoxedHandle,
    size: u64,
    direct: Option<DirectMapping>,
}

pub struct Decoder {
    registry: Arc<HandleRegistry>,
    driver: Arc<dyn HostDriver>,
    window: Option<Arc<AddressSpaceWindow>>,
    queues: QueueTable,
    process: ProcessResources,
    allocations: DashMap<BoxedHandle, AllocationRecord>,
    /// Semaphores handed to AcquireImage and not yet retired, keyed to
    /// their device.
    pending_release: DashMap<BoxedHandle, BoxedHandle>,
    replay_log: Mutex<Vec<ReplayEntry>>,
}

impl Decoder {
    pub fn new(
        puid: u64,
        driver: Arc<dyn HostDriver>,
        window: Option<Arc<AddressSpaceWindow>>,
    ) -> Self {
        Self {
            registry: Arc::new(HandleRegistry::new()),
            driver,
            window,
            queues: QueueTable::new(),
            process: ProcessResources::new(puid),
            allocations: DashMap::new(),
            pending_release: DashMap::new(),
            replay_log: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Serve one channel until end-of-stream or a fatal error. A wire
    /// failure (bad checksum, bad opcode) poisons the channel: the guest is
    /// told via EOS and the error is returned.
    pub fn serve(
        &self,
        channel: &mut impl Channel,
        session: &SessionInfo,
    ) -> Result<(), TransportError> {
        loop {
            let frame = match read_frame(channel, session.checksum) {
                Ok(frame) => frame,
                Err(err) => return self.fail_channel(channel, session, err),
            };
            if frame.is_eos() {
                debug!(puid = session.puid, "guest closed the stream");
                return Ok(());
            }

            let mut reader = Reader::new(&frame.body);
            let command = match VkCommand::decode(frame.header.opcode, &mut reader) {
                Ok(command) => command,
                Err(err) => {
                    return self.fail_channel(
                        channel,
                        session,
                        gstream_protocol::wire::WireError::from(err).into(),
                    )
                }
            };

            let response = self.execute(frame.header.seqno, &command);
            let mut writer = Writer::new();
            response.encode_body(&mut writer);
            write_frame(
                channel,
                frame.header.opcode,
                frame.header.seqno,
                writer.as_bytes(),
                session.checksum,
            )?;
            channel.flush()?;
        }
    }

    fn fail_channel(
        &self,
        channel: &mut impl Channel,
        session: &SessionInfo,
        err: TransportError,
    ) -> Result<(), TransportError> {
        error!(puid = session.puid, %err, "stream failed");
        if matches!(err, TransportError::Disconnected) {
            // The guest died without tearing down; reclaim its objects.
            self.sweep_process();
        } else {
            let _ = write_eos(channel, session.checksum);
        }
        channel.mark_exiting();
        Err(err)
    }

    /// Execute one command, honoring its sequence stamp.
    pub fn execute(&self, seqno: u32, command: &VkCommand) -> VkResponse {
        let order = command
            .ordered_handle()
            .and_then(|handle| self.registry.order_info(handle));
        if let Some(order) = &order {
            order.wait_for_turn(seqno);
        }
        let response = self.run(command);
        if let Some(order) = &order {
            order.complete(seqno);
        }
        response
    }

    pub fn sweep_process(&self) {
        self.process.sweep(&self.registry, &self.driver);
        self.allocations.clear();
        self.pending_release.clear();
        self.replay_log.lock().clear();
    }

    fn run(&self, command: &VkCommand) -> VkResponse {
        match self.run_inner(command) {
            Ok(response) => response,
            Err(err) => VkResponse::error(err.result),
        }
    }

    fn unbox_queue(&self, queue: BoxedHandle) -> u64 {
        self.registry.unbox_dispatchable(queue, HandleTag::Queue)
    }

    fn unbox_device(&self, device: BoxedHandle) -> u64 {
        self.registry.unbox_dispatchable(device, HandleTag::Device)
    }

    fn log_replay(&self, command: &VkCommand, handles: &[BoxedHandle], refs: &[BoxedHandle]) {
        let mut writer = Writer::new();
        command.encode_body(&mut writer);
        self.replay_log.lock().push(ReplayEntry {
            opcode: command.opcode(),
            body: writer.into_bytes(),
            handles: handles.to_vec(),
            refs: refs.to_vec(),
        });
    }

    /// Drop replay entries that issued or depend on `boxed`, cascading to
    /// the handles those entries issued.
    fn unlog_replay(&self, boxed: BoxedHandle) {
        let mut log = self.replay_log.lock();
        let mut dead = vec![boxed];
        let mut idx = 0;
        while idx < dead.len() {
            let handle = dead[idx];
            idx += 1;
            let mut kept = Vec::with_capacity(log.len());
            for entry in log.drain(..) {
                if entry.handles.contains(&handle) || entry.refs.contains(&handle) {
                    for &child in &entry.handles {
                        if !dead.contains(&child) {
                            dead.push(child);
                        }
                    }
                } else {
                    kept.push(entry);
                }
            }
            *log = kept;
        }
    }

    fn run_inner(&self, command: &VkCommand) -> Result<VkResponse, DriverError> {
        let registry = &self.registry;
        match command {
            VkCommand::GetExtensions | VkCommand::SetChecksumVersion { .. } => {
                warn!("control command after handshake");
                Ok(VkResponse::error(vk_result::ERROR_UNKNOWN))
            }

            VkCommand::CreateInstance {
                app_name,
                api_version,
                enabled_extensions,
            } => {
                let native = self.driver.create_instance(
                    app_name.as_deref(),
                    *api_version,
                    enabled_extensions,
                )?;
                let boxed = registry.new_boxed(native, HandleTag::Instance);
                self.process.track(boxed, HandleTag::Instance, NULL_HANDLE);
                self.log_replay(command, &[boxed], &[]);
                debug!(instance = format_args!("{boxed:#x}"), "created instance");
                Ok(VkResponse::Handle { handle: boxed })
            }

            VkCommand::DestroyInstance { instance } => {
                let native = registry.unbox_dispatchable(*instance, HandleTag::Instance);
                self.driver.destroy_instance(native);
                registry.delete(*instance);
                self.process.untrack(*instance);
                self.unlog_replay(*instance);
                Ok(VkResponse::Ok)
            }

            VkCommand::EnumeratePhysicalDevices { instance } => {
                let native = registry.unbox_dispatchable(*instance, HandleTag::Instance);
                let natives = self.driver.enumerate_physical_devices(native)?;
                let mut boxed = Vec::with_capacity(natives.len());
                let mut fresh = true;
                for native in natives {
                    match registry.unboxed_to_boxed(native) {
                        Some(existing) => {
                            fresh = false;
                            boxed.push(existing);
                        }
                        None => {
                            let handle =
                                registry.new_boxed(native, HandleTag::PhysicalDevice);
                            self.process.track(
                                handle,
                                HandleTag::PhysicalDevice,
                                NULL_HANDLE,
                            );
                            boxed.push(handle);
                        }
                    }
                }
                if fresh {
                    self.log_replay(command, &boxed, &[*instance]);
                }
                Ok(VkResponse::Handles { handles: boxed })
            }

            VkCommand::GetMemoryProperties { physical_device } => {
                let native =
                    registry.unbox_dispatchable(*physical_device, HandleTag::PhysicalDevice);
                let props = self.driver.memory_properties(native)?;
                Ok(VkResponse::MemoryProperties { props })
            }

            VkCommand::CreateDevice {
                physical_device,
                queue_family_index,
                queue_count,
                enabled_extensions,
            } => {
                let native =
                    registry.unbox_dispatchable(*physical_device, HandleTag::PhysicalDevice);
                let device_native = self.driver.create_device(
                    native,
                    *queue_family_index,
                    *queue_count,
                    enabled_extensions,
                )?;
                let boxed = registry.new_boxed(device_native, HandleTag::Device);
                self.process.track(boxed, HandleTag::Device, NULL_HANDLE);
                self.log_replay(command, &[boxed], &[*physical_device]);
                debug!(device = format_args!("{boxed:#x}"), "created device");
                Ok(VkResponse::Handle { handle: boxed })
            }

            VkCommand::DestroyDevice { device } => {
                let native = self.unbox_device(*device);
                self.driver.device_wait_idle(native)?;
                registry.process_delayed_removes(*device);
                self.pending_release.retain(|_, dev| *dev != *device);
                self.driver.destroy_device(native);
                self.queues.forget_device(*device);
                self.allocations.retain(|_, rec| rec.device != *device);
                registry.delete(*device);
                self.process.untrack(*device);
                self.unlog_replay(*device);
                Ok(VkResponse::Ok)
            }

            VkCommand::GetDeviceQueue {
                device,
                queue_family_index,
                queue_index,
            } => {
                if let Some(queue) =
                    self.queues.existing(*device, *queue_family_index, *queue_index)
                {
                    return Ok(VkResponse::Handle { handle: queue });
                }
                let device_native = self.unbox_device(*device);
                let native = self.driver.device_queue(
                    device_native,
                    *queue_family_index,
                    *queue_index,
                )?;
                // If the physical queue is already boxed, this one is a
                // virtual queue multiplexed onto it.
                let underlying = if registry.unboxed_to_boxed(native).is_some() {
                    native | VIRTUAL_QUEUE_BIT
                } else {
                    native
                };
                let boxed = registry.new_boxed(underlying, HandleTag::Queue);
                self.queues
                    .record(*device, *queue_family_index, *queue_index, boxed);
                self.process.track(boxed, HandleTag::Queue, *device);
                self.log_replay(command, &[boxed], &[*device]);
                Ok(VkResponse::Handle { handle: boxed })
            }

            VkCommand::AllocateMemory {
                device,
                size,
                memory_type_index,
                direct_map,
            } => {
                let device_native = self.unbox_device(*device);
                let allocated = self.driver.allocate_memory(
                    device_native,
                    *size,
                    *memory_type_index,
                    *direct_map,
                )?;
                let boxed = registry.new_boxed(allocated.handle, HandleTag::DeviceMemory);
                self.allocations.insert(
                    boxed,
                    AllocationRecord {
                        device: *device,
                        size: *size,
                        direct: allocated.direct,
                    },
                );
                self.process.track(boxed, HandleTag::DeviceMemory, *device);
                self.log_replay(command, &[boxed], &[*device]);
                Ok(VkResponse::MemoryAllocated {
                    handle: boxed,
                    direct: allocated.direct,
                })
            }

            VkCommand::FreeMemory { device, memory } => {
                let device_native = self.unbox_device(*device);
                let native = registry.unbox_or_null(*memory, HandleTag::DeviceMemory);
                if native != 0 {
                    self.driver.free_memory(device_native, native);
                }
                self.allocations.remove(memory);
                registry.delete(*memory);
                self.process.untrack(*memory);
                self.unlog_replay(*memory);
                Ok(VkResponse::Ok)
            }

            VkCommand::FlushMappedRanges {
                device,
                ranges,
                data,
            } => {
                let device_native = self.unbox_device(*device);
                for (i, range) in ranges.iter().enumerate() {
                    let Some(bytes) = data.get(i).and_then(|d| d.as_ref()) else {
                        // Direct-mapped range: the bytes are already in the
                        // window, nothing to move.
                        continue;
                    };
                    let native = registry.unbox_or_null(range.memory, HandleTag::DeviceMemory);
                    if native == 0 {
                        continue;
                    }
                    self.driver
                        .write_memory(device_native, native, range.offset, bytes)?;
                }
                Ok(VkResponse::Ok)
            }

            VkCommand::InvalidateMappedRanges { device, ranges } => {
                let device_native = self.unbox_device(*device);
                let mut out = Vec::with_capacity(ranges.len());
                for range in ranges {
                    let direct = self
                        .allocations
                        .get(&range.memory)
                        .is_some_and(|rec| rec.direct.is_some());
                    if direct {
                        out.push(Vec::new());
                        continue;
                    }
                    let native = registry.unbox_or_null(range.memory, HandleTag::DeviceMemory);
                    if native == 0 {
                        out.push(Vec::new());
                        continue;
                    }
                    out.push(self.driver.read_memory(
                        device_native,
                        native,
                        range.offset,
                        range.size,
                    )?);
                }
                Ok(VkResponse::RangeData { data: out })
            }

            VkCommand::CreateBuffer {
                device,
                size,
                usage,
            } => {
                let device_native = self.unbox_device(*device);
                let native = self.driver.create_buffer(device_native, *size, *usage)?;
                let boxed = registry.new_boxed(native, HandleTag::Buffer);
                self.process.track(boxed, HandleTag::Buffer, *device);
                self.log_replay(command, &[boxed], &[*device]);
                Ok(VkResponse::Handle { handle: boxed })
            }

            VkCommand::DestroyBuffer { device, buffer } => {
                let device_native = self.unbox_device(*device);
                let native = registry.unbox_or_null(*buffer, HandleTag::Buffer);
                if native != 0 {
                    self.driver.destroy_buffer(device_native, native);
                }
                registry.delete(*buffer);
                self.process.untrack(*buffer);
                self.unlog_replay(*buffer);
                Ok(VkResponse::Ok)
            }

            VkCommand::GetBufferMemoryRequirements { device, buffer } => {
                let device_native = self.unbox_device(*device);
                let native = registry.unbox_or_null(*buffer, HandleTag::Buffer);
                let reqs = self.driver.buffer_memory_requirements(device_native, native)?;
                Ok(VkResponse::MemoryRequirements { reqs })
            }

            VkCommand::BindBufferMemory {
                device,
                buffer,
                memory,
                offset,
            } => {
                let device_native = self.unbox_device(*device);
                let buffer_native = registry.unbox_or_null(*buffer, HandleTag::Buffer);
                let memory_native = registry.unbox_or_null(*memory, HandleTag::DeviceMemory);
                self.driver.bind_buffer_memory(
                    device_native,
                    buffer_native,
                    memory_native,
                    *offset,
                )?;
                self.log_replay(command, &[], &[*device, *buffer, *memory]);
                Ok(VkResponse::Ok)
            }

            VkCommand::CreateImage {
                device,
                width,
                height,
                format,
                usage,
            } => {
                let device_native = self.unbox_device(*device);
                let native = self
                    .driver
                    .create_image(device_native, *width, *height, *format, *usage)?;
                let boxed = registry.new_boxed(native, HandleTag::Image);
                self.process.track(boxed, HandleTag::Image, *device);
                self.log_replay(command, &[boxed], &[*device]);
                Ok(VkResponse::Handle { handle: boxed })
            }

            VkCommand::DestroyImage { device, image } => {
                let device_native = self.unbox_device(*device);
                let native = registry.unbox_or_null(*image, HandleTag::Image);
                if native != 0 {
                    self.driver.destroy_image(device_native, native);
                }
                registry.delete(*image);
                self.process.untrack(*image);
                self.unlog_replay(*image);
                Ok(VkResponse::Ok)
            }

            VkCommand::BindImageMemory2 {
                device,
                image,
                memory,
                offset,
                native_buffer,
            } => {
                let device_native = self.unbox_device(*device);
                let image_native = registry.unbox_or_null(*image, HandleTag::Image);
                let memory_native = if *memory == NULL_HANDLE {
                    0
                } else {
                    registry.unbox_or_null(*memory, HandleTag::DeviceMemory)
                };
                self.driver.bind_image_memory(
                    device_native,
                    image_native,
                    memory_native,
                    *offset,
                    native_buffer.as_ref(),
                )?;
                self.log_replay(command, &[], &[*device, *image]);
                Ok(VkResponse::Ok)
            }

            VkCommand::CreateFence { device, signaled } => {
                let device_native = self.unbox_device(*device);
                let native = self.driver.create_fence(device_native, *signaled)?;
                let boxed = registry.new_boxed(native, HandleTag::Fence);
                self.process.track(boxed, HandleTag::Fence, *device);
                self.log_replay(command, &[boxed], &[*device]);
                Ok(VkResponse::Handle { handle: boxed })
            }

            VkCommand::DestroyFence { device, fence } => {
                let device_native = self.unbox_device(*device);
                let native = registry.unbox_or_null(*fence, HandleTag::Fence);
                self.process.untrack(*fence);
                self.unlog_replay(*fence);
                if native == 0 {
                    registry.delete(*fence);
                } else if self.driver.fence_in_flight(device_native, native) {
                    // Still backs an internal submit; defer to the next
                    // idle point.
                    let driver = Arc::clone(&self.driver);
                    registry.delayed_delete(
                        *fence,
                        *device,
                        Box::new(move || driver.destroy_fence(device_native, native)),
                    );
                } else {
                    self.driver.destroy_fence(device_native, native);
                    registry.delete(*fence);
                }
                Ok(VkResponse::Ok)
            }

            VkCommand::ResetFences { device, fences } => {
                let device_native = self.unbox_device(*device);
                let natives: Vec<u64> = fences
                    .iter()
                    .map(|f| registry.unbox_or_null(*f, HandleTag::Fence))
                    .filter(|&n| n != 0)
                    .collect();
                self.driver.reset_fences(device_native, &natives)?;
                Ok(VkResponse::Ok)
            }

            VkCommand::WaitForFences {
                device,
                fences,
                wait_all,
                timeout_ns,
            } => {
                let device_native = self.unbox_device(*device);
                let natives: Vec<u64> = fences
                    .iter()
                    .map(|f| registry.unbox_or_null(*f, HandleTag::Fence))
                    .filter(|&n| n != 0)
                    .collect();
                let result = self.driver.wait_for_fences(
                    device_native,
                    &natives,
                    *wait_all,
                    *timeout_ns,
                )?;
                Ok(VkResponse::WaitResult { result })
            }

            VkCommand::CreateSemaphore { device } => {
                let device_native = self.unbox_device(*device);
                let native = self.driver.create_semaphore(device_native)?;
                let boxed = registry.new_boxed(native, HandleTag::Semaphore);
                self.process.track(boxed, HandleTag::Semaphore, *device);
                self.log_replay(command, &[boxed], &[*device]);
                Ok(VkResponse::Handle { handle: boxed })
            }

            VkCommand::DestroySemaphore { device, semaphore } => {
                let device_native = self.unbox_device(*device);
                let native = registry.unbox_or_null(*semaphore, HandleTag::Semaphore);
                self.process.untrack(*semaphore);
                self.unlog_replay(*semaphore);
                if native == 0 {
                    registry.delete(*semaphore);
                } else if self.pending_release.contains_key(semaphore) {
                    let driver = Arc::clone(&self.driver);
                    registry.delayed_delete(
                        *semaphore,
                        *device,
                        Box::new(move || driver.destroy_semaphore(device_native, native)),
                    );
                } else {
                    self.driver.destroy_semaphore(device_native, native);
                    registry.delete(*semaphore);
                }
                Ok(VkResponse::Ok)
            }

            VkCommand::QueueSubmit {
                queue,
                submits,
                fence,
            } => {
                let queue_native = self.unbox_queue(*queue);
                let resolved: Vec<ResolvedSubmit> = submits
                    .iter()
                    .map(|s| ResolvedSubmit {
                        wait_semaphores: s
                            .wait_semaphores
                            .iter()
                            .map(|h| registry.unbox_or_null(*h, HandleTag::Semaphore))
                            .collect(),
                        wait_dst_stage_masks: s.wait_dst_stage_masks.clone(),
                        command_buffers: s
                            .command_buffers
                            .iter()
                            .map(|h| {
                                registry.unbox_dispatchable(*h, HandleTag::CommandBuffer)
                            })
                            .collect(),
                        signal_semaphores: s
                            .signal_semaphores
                            .iter()
                            .map(|h| registry.unbox_or_null(*h, HandleTag::Semaphore))
                            .collect(),
                    })
                    .collect();
                let fence_native = registry.unbox_or_null(*fence, HandleTag::Fence);

                // Virtual queues on one physical queue submit one at a time.
                let lock = self.queues.submit_lock(queue_native);
                let _guard = lock.lock();
                self.driver.queue_submit(queue_native, &resolved, fence_native)?;
                Ok(VkResponse::Ok)
            }

            VkCommand::QueueWaitIdle { queue } => {
                let queue_native = self.unbox_queue(*queue);
                self.driver.queue_wait_idle(queue_native)?;
                if let Some(device) = self.queues.device_of(*queue) {
                    registry.process_delayed_removes(device);
                    self.pending_release.retain(|_, dev| *dev != device);
                }
                Ok(VkResponse::Ok)
            }

            VkCommand::DeviceWaitIdle { device } => {
                let device_native = self.unbox_device(*device);
                self.driver.device_wait_idle(device_native)?;
                registry.process_delayed_removes(*device);
                self.pending_release.retain(|_, dev| *dev != *device);
                Ok(VkResponse::Ok)
            }

            VkCommand::AcquireImage {
                queue,
                image,
                fence,
                semaphore,
            } => {
                let queue_native = self.unbox_queue(*queue);
                let image_native = registry.unbox_or_null(*image, HandleTag::Image);
                let fence_native = registry.unbox_or_null(*fence, HandleTag::Fence);
                let semaphore_native =
                    registry.unbox_or_null(*semaphore, HandleTag::Semaphore);

                let lock = self.queues.submit_lock(queue_native);
                let _guard = lock.lock();
                self.driver.acquire_image(
                    queue_native,
                    image_native,
                    fence_native,
                    semaphore_native,
                )?;
                if *semaphore != NULL_HANDLE {
                    if let Some(device) = self.queues.device_of(*queue) {
                        self.pending_release.insert(*semaphore, device);
                    }
                }
                Ok(VkResponse::Ok)
            }

            VkCommand::QueueSignalReleaseImage { queue, image } => {
                let queue_native = self.unbox_queue(*queue);
                let image_native = registry.unbox_or_null(*image, HandleTag::Image);
                self.signal_release(queue_native, image_native)
            }

            VkCommand::CreateCommandPool {
                device,
                queue_family_index,
            } => {
                let device_native = self.unbox_device(*device);
                let native = self
                    .driver
                    .create_command_pool(device_native, *queue_family_index)?;
                let boxed = registry.new_boxed(native, HandleTag::CommandPool);
                self.process.track(boxed, HandleTag::CommandPool, *device);
                self.log_replay(command, &[boxed], &[*device]);
                Ok(VkResponse::Handle { handle: boxed })
            }

            VkCommand::DestroyCommandPool { device, pool } => {
                let device_native = self.unbox_device(*device);
                let native = registry.unbox_or_null(*pool, HandleTag::CommandPool);
                if native != 0 {
                    self.driver.destroy_command_pool(device_native, native);
                }
                registry.delete(*pool);
                self.process.untrack(*pool);
                self.unlog_replay(*pool);
                Ok(VkResponse::Ok)
            }

            VkCommand::AllocateCommandBuffers {
                device,
                pool,
                count,
            } => {
                let device_native = self.unbox_device(*device);
                let pool_native = registry.unbox_or_null(*pool, HandleTag::CommandPool);
                let natives =
                    self.driver
                        .allocate_command_buffers(device_native, pool_native, *count)?;
                let mut boxed = Vec::with_capacity(natives.len());
                for native in natives {
                    let handle = registry.new_boxed(native, HandleTag::CommandBuffer);
                    self.process.track(handle, HandleTag::CommandBuffer, *device);
                    boxed.push(handle);
                }
                self.log_replay(command, &boxed, &[*device, *pool]);
                Ok(VkResponse::Handles { handles: boxed })
            }

            VkCommand::FreeCommandBuffers {
                device,
                pool,
                buffers,
            } => {
                let device_native = self.unbox_device(*device);
                let pool_native = registry.unbox_or_null(*pool, HandleTag::CommandPool);
                let natives: Vec<u64> = buffers
                    .iter()
                    .map(|b| {
                        registry.unbox_dispatchable(*b, HandleTag::CommandBuffer)
                    })
                    .collect();
                self.driver
                    .free_command_buffers(device_native, pool_native, &natives);
                for buffer in buffers {
                    registry.delete(*buffer);
                    self.process.untrack(*buffer);
                    self.unlog_replay(*buffer);
                }
                Ok(VkResponse::Ok)
            }
        }
    }

    #[cfg(unix)]
    fn signal_release(&self, queue_native: u64, image_native: u64) -> Result<VkResponse, DriverError> {
        let (signaler, sync_fd) = gstream_common::sync_fd::sync_pair()
            .map_err(|_| DriverError::new(vk_result::ERROR_OUT_OF_HOST_MEMORY))?;
        self.driver.signal_release_image(
            queue_native,
            image_native,
            Box::new(move || {
                let _ = signaler.signal();
            }),
        )?;
        Ok(VkResponse::SyncFd {
            fd: sync_fd.into_raw(),
        })
    }

    #[cfg(not(unix))]
    fn signal_release(&self, queue_native: u64, image_native: u64) -> Result<VkResponse, DriverError> {
        self.driver
            .signal_release_image(queue_native, image_native, Box::new(|| {}))?;
        Ok(VkResponse::SyncFd { fd: -1 })
    }

    /// Capture the process state. Call only while the transport is
    /// quiesced; `ring` comes from the channel's quiesce.
    pub fn snapshot(
        &self,
        ring: Option<gstream_transport::RingSnapshot>,
    ) -> Result<HostSnapshot, SnapshotError> {
        let entries = self.replay_log.lock().clone();
        let mut memory = Vec::new();
        for entry in self.allocations.iter() {
            let (boxed, record) = (*entry.key(), entry.value());
            let bytes = match (record.direct, self.window.as_ref()) {
                (Some(direct), Some(window)) => {
                    let mut buf = vec![0u8; record.size as usize];
                    // SAFETY: the range was suballocated to this block and
                    // nothing mutates it while the session is quiesced.
                    unsafe { window.read_at(direct.window_offset, &mut buf) };
                    buf
                }
                _ => {
                    let device_native = self
                        .registry
                        .get(record.device)
                        .map(|d| d.underlying)
                        .unwrap_or_default();
                    let native = self
                        .registry
                        .get(boxed)
                        .map(|m| m.underlying)
                        .unwrap_or_default();
                    self.driver
                        .read_memory(device_native, native, 0, record.size)
                        .map_err(|e| SnapshotError::Replay {
                            opcode: 0,
                            result: e.result,
                        })?
                }
            };
            memory.push(MemoryImage {
                memory: boxed,
                bytes,
            });
        }
        Ok(HostSnapshot {
            puid: self.process.puid(),
            entries,
            memory,
            ring,
        })
    }

    /// Rebuild a decoder from a snapshot: replay every recorded creation so
    /// each lands on its original boxed handle, then restore memory
    /// contents.
    pub fn restore(
        snapshot: &HostSnapshot,
        driver: Arc<dyn HostDriver>,
        window: Option<Arc<AddressSpaceWindow>>,
    ) -> Result<Self, SnapshotError> {
        let decoder = Decoder::new(snapshot.puid, driver, window);
        let replay: Vec<BoxedHandle> = snapshot
            .entries
            .iter()
            .flat_map(|e| e.handles.iter().copied())
            .collect();
        decoder.registry.begin_replay(replay);

        for entry in &snapshot.entries {
            let mut reader = Reader::new(&entry.body);
            let command = VkCommand::decode(entry.opcode, &mut reader).map_err(|_| {
                SnapshotError::Replay {
                    opcode: entry.opcode,
                    result: vk_result::ERROR_UNKNOWN,
                }
            })?;
            let issued = match decoder.run(&command) {
                VkResponse::Handle { handle } => vec![handle],
                VkResponse::Handles { handles } => handles,
                VkResponse::MemoryAllocated { handle, .. } => vec![handle],
                VkResponse::Error { result } => {
                    return Err(SnapshotError::Replay {
                        opcode: entry.opcode,
                        result,
                    })
                }
                _ => Vec::new(),
            };
            if issued != entry.handles {
                return Err(SnapshotError::HandleMismatch {
                    expected: entry.handles.first().copied().unwrap_or_default(),
                    got: issued.first().copied().unwrap_or_default(),
                });
            }
        }

        for image in &snapshot.memory {
            let Some(record) = decoder.allocations.get(&image.memory) else {
                continue;
            };
            let device_native = decoder
                .registry
                .get(record.device)
                .map(|d| d.underlying)
                .unwrap_or_default();
            let native = decoder
                .registry
                .get(image.memory)
                .map(|m| m.underlying)
                .unwrap_or_default();
            drop(record);
            decoder
                .driver
                .write_memory(device_native, native, 0, &image.bytes)
                .map_err(|e| SnapshotError::Replay {
                    opcode: 0,
                    result: e.result,
                })?;
        }

        Ok(decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDriver;
    use gstream_protocol::commands::MappedMemoryRange;

    fn handle(resp: VkResponse) -> BoxedHandle {
        match resp {
            VkResponse::Handle { handle } => handle,
            other => panic!("expected a handle, got {:?}", other),
        }
    }

    fn setup() -> (Decoder, BoxedHandle, BoxedHandle) {
        let window = Arc::new(AddressSpaceWindow::new(1 << 20));
        let driver = Arc::new(TestDriver::with_window(Some(Arc::clone(&window))));
        let decoder = Decoder::new(1, driver, Some(window));

        let instance = handle(decoder.execute(
            0,
            &VkCommand::CreateInstance {
                app_name: None,
                api_version: 0,
                enabled_extensions: vec![],
            },
        ));
        let physical = match decoder.execute(
            0,
            &VkCommand::EnumeratePhysicalDevices { instance },
        ) {
            VkResponse::Handles { handles } => handles[0],
            other => panic!("expected handles, got {:?}", other),
        };
        let device = handle(decoder.execute(
            0,
            &VkCommand::CreateDevice {
                physical_device: physical,
                queue_family_index: 0,
                queue_count: 2,
                enabled_extensions: vec![],
            },
        ));
        (decoder, instance, device)
    }

    #[test]
    fn allocation_and_free_round_trip() {
        let (decoder, _instance, device) = setup();
        let resp = decoder.execute(
            0,
            &VkCommand::AllocateMemory {
                device,
                size: 8192,
                memory_type_index: 1,
                direct_map: true,
            },
        );
        let (memory, direct) = match resp {
            VkResponse::MemoryAllocated { handle, direct } => (handle, direct),
            other => panic!("expected allocation, got {:?}", other),
        };
        assert!(direct.is_some(), "host-visible allocation should direct-map");

        match decoder.execute(0, &VkCommand::FreeMemory { device, memory }) {
            VkResponse::Ok => {}
            other => panic!("expected ok, got {:?}", other),
        }
        assert!(decoder.registry.get(memory).is_none());
    }

    #[test]
    fn virtual_queues_share_the_physical_queue() {
        let (decoder, _instance, device) = setup();
        let q0 = handle(decoder.execute(
            0,
            &VkCommand::GetDeviceQueue {
                device,
                queue_family_index: 0,
                queue_index: 0,
            },
        ));
        let q1 = handle(decoder.execute(
            0,
            &VkCommand::GetDeviceQueue {
                device,
                queue_family_index: 0,
                queue_index: 1,
            },
        ));
        assert_ne!(q0, q1);

        let info0 = decoder.registry.get(q0).expect("q0 missing");
        let info1 = decoder.registry.get(q1).expect("q1 missing");
        assert_eq!(info1.underlying & VIRTUAL_QUEUE_BIT, VIRTUAL_QUEUE_BIT);
        assert_eq!(
            info0.underlying & !VIRTUAL_QUEUE_BIT,
            info1.underlying & !VIRTUAL_QUEUE_BIT
        );

        // Repeat lookups return the same boxed queue.
        let again = handle(decoder.execute(
            0,
            &VkCommand::GetDeviceQueue {
                device,
                queue_family_index: 0,
                queue_index: 1,
            },
        ));
        assert_eq!(again, q1);
    }

    #[test]
    fn fence_destruction_defers_while_in_flight() {
        let (decoder, _instance, device) = setup();
        let queue = handle(decoder.execute(
            0,
            &VkCommand::GetDeviceQueue {
                device,
                queue_family_index: 0,
                queue_index: 0,
            },
        ));
        let image = handle(decoder.execute(
            0,
            &VkCommand::CreateImage {
                device,
                width: 64,
                height: 64,
                format: 37,
                usage: 0x10,
            },
        ));
        let fence = handle(decoder.execute(
            0,
            &VkCommand::CreateFence {
                device,
                signaled: false,
            },
        ));

        decoder.execute(
            0,
            &VkCommand::AcquireImage {
                queue,
                image,
                fence,
                semaphore: NULL_HANDLE,
            },
        );
        decoder.execute(0, &VkCommand::DestroyFence { device, fence });
        // Deferred: the handle is still live until the device drains.
        assert!(decoder.registry.get(fence).is_some());

        decoder.execute(0, &VkCommand::DeviceWaitIdle { device });
        assert!(decoder.registry.get(fence).is_none());
    }

    #[test]
    fn shadow_flush_and_invalidate_move_bytes() {
        let (decoder, _instance, device) = setup();
        let resp = decoder.execute(
            0,
            &VkCommand::AllocateMemory {
                device,
                size: 4096,
                memory_type_index: 0,
                direct_map: false,
            },
        );
        let memory = match resp {
            VkResponse::MemoryAllocated { handle, direct } => {
                assert!(direct.is_none());
                handle
            }
            other => panic!("expected allocation, got {:?}", other),
        };

        let range = MappedMemoryRange {
            memory,
            offset: 128,
            size: 4,
        };
        decoder.execute(
            0,
            &VkCommand::FlushMappedRanges {
                device,
                ranges: vec![range],
                data: vec![Some(vec![0xDE, 0xAD, 0xBE, 0xEF])],
            },
        );
        match decoder.execute(
            0,
            &VkCommand::InvalidateMappedRanges {
                device,
                ranges: vec![range],
            },
        ) {
            VkResponse::RangeData { data } => {
                assert_eq!(data[0], vec![0xDE, 0xAD, 0xBE, 0xEF])
            }
            other => panic!("expected range data, got {:?}", other),
        }
    }

    #[test]
    fn snapshot_restores_handles_and_memory_contents() {
        let (decoder, instance, device) = setup();
        let resp = decoder.execute(
            0,
            &VkCommand::AllocateMemory {
                device,
                size: 4096,
                memory_type_index: 1,
                direct_map: true,
            },
        );
        let (memory, direct) = match resp {
            VkResponse::MemoryAllocated { handle, direct } => {
                (handle, direct.expect("direct mapping"))
            }
            other => panic!("expected allocation, got {:?}", other),
        };

        // Guest writes through its window alias.
        let window = decoder.window.as_ref().map(Arc::clone).expect("window");
        unsafe { window.write_at(direct.window_offset, &[0xFF; 32]) };

        let snapshot = decoder.snapshot(None).unwrap();

        // Fresh host, fresh driver: replay into a new window.
        let new_window = Arc::new(AddressSpaceWindow::new(1 << 20));
        let new_driver = Arc::new(TestDriver::with_window(Some(Arc::clone(&new_window))));
        let restored =
            Decoder::restore(&snapshot, new_driver.clone(), Some(Arc::clone(&new_window)))
                .unwrap();

        // Same boxed values resolve in the restored registry.
        assert!(restored.registry.get(instance).is_some());
        assert!(restored.registry.get(device).is_some());
        let record = restored.allocations.get(&memory).expect("allocation");
        let offset = record.direct.expect("direct mapping").window_offset;
        drop(record);

        let mut buf = [0u8; 32];
        unsafe { new_window.read_at(offset, &mut buf) };
        assert_eq!(buf, [0xFF; 32]);
    }

    #[test]
    fn destroyed_objects_drop_out_of_the_replay_log() {
        let (decoder, _instance, device) = setup();
        let buffer = handle(decoder.execute(
            0,
            &VkCommand::CreateBuffer {
                device,
                size: 1024,
                usage: 0x20,
            },
        ));
        decoder.execute(0, &VkCommand::DestroyBuffer { device, buffer });

        let snapshot = decoder.snapshot(None).unwrap();
        assert!(snapshot
            .entries
            .iter()
            .all(|e| !e.handles.contains(&buffer)));
    }

    #[cfg(unix)]
    #[test]
    fn release_fence_fires_when_the_gpu_work_retires() {
        use gstream_common::sync_fd::{SyncFd, DEFAULT_SYNC_WAIT};
        use std::time::Duration;

        let driver = Arc::new(TestDriver::new().deferred_releases());
        let decoder = Decoder::new(1, Arc::clone(&driver) as Arc<dyn HostDriver>, None);

        let instance = handle(decoder.execute(
            0,
            &VkCommand::CreateInstance {
                app_name: None,
                api_version: 0,
                enabled_extensions: vec![],
            },
        ));
        let physical = match decoder.execute(
            0,
            &VkCommand::EnumeratePhysicalDevices { instance },
        ) {
            VkResponse::Handles { handles } => handles[0],
            other => panic!("expected handles, got {:?}", other),
        };
        let device = handle(decoder.execute(
            0,
            &VkCommand::CreateDevice {
                physical_device: physical,
                queue_family_index: 0,
                queue_count: 1,
                enabled_extensions: vec![],
            },
        ));
        let queue = handle(decoder.execute(
            0,
            &VkCommand::GetDeviceQueue {
                device,
                queue_family_index: 0,
                queue_index: 0,
            },
        ));
        let image = handle(decoder.execute(
            0,
            &VkCommand::CreateImage {
                device,
                width: 64,
                height: 64,
                format: 37,
                usage: 0x10,
            },
        ));

        let fd = match decoder.execute(
            0,
            &VkCommand::QueueSignalReleaseImage { queue, image },
        ) {
            VkResponse::SyncFd { fd } => fd,
            other => panic!("expected a sync fd, got {:?}", other),
        };
        let sync = unsafe { SyncFd::from_raw(fd) };

        // The queue work has not retired; the fence must stay unsignaled.
        assert!(sync.wait(Duration::from_millis(20)).is_err());

        driver.fire_pending_releases();
        assert_eq!(sync.wait(DEFAULT_SYNC_WAIT).unwrap(), 0);
    }
}
