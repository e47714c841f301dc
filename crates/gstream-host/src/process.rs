//! Per-process resource tracking.
//!
//! Everything created on behalf of a guest process is recorded against its
//! puid. When the process dies without cleaning up (crash, kill), the sweep
//! destroys its leftovers in reverse creation order so children go before
//! parents.

use std::sync::Arc;

use gstream_protocol::handle::{BoxedHandle, HandleTag};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::driver::HostDriver;
use crate::registry::HandleRegistry;

pub struct ProcessResources {
    puid: u64,
    created: Mutex<Vec<(BoxedHandle, HandleTag, BoxedHandle)>>,
}

impl ProcessResources {
    pub fn new(puid: u64) -> Self {
        Self {
            puid,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn puid(&self) -> u64 {
        self.puid
    }

    /// Record a freshly boxed handle and its owning device (null for
    /// instance-level objects).
    pub fn track(&self, boxed: BoxedHandle, tag: HandleTag, device: BoxedHandle) {
        self.created.lock().push((boxed, tag, device));
    }

    pub fn untrack(&self, boxed: BoxedHandle) {
        self.created.lock().retain(|&(b, _, _)| b != boxed);
    }

    /// Destroy every resource the process left behind.
    pub fn sweep(&self, registry: &HandleRegistry, driver: &Arc<dyn HostDriver>) {
        let mut leftovers = std::mem::take(&mut *self.created.lock());
        if leftovers.is_empty() {
            return;
        }
        warn!(
            puid = self.puid,
            count = leftovers.len(),
            "sweeping leaked resources"
        );

        while let Some((boxed, tag, device)) = leftovers.pop() {
            let Some(info) = registry.get(boxed) else {
                continue;
            };
            let device_native = registry
                .get(device)
                .map(|d| d.underlying)
                .unwrap_or_default();
            match tag {
                HandleTag::Instance => driver.destroy_instance(info.underlying),
                HandleTag::Device => {
                    driver.destroy_device(info.underlying);
                }
                HandleTag::DeviceMemory => driver.free_memory(device_native, info.underlying),
                HandleTag::Buffer => driver.destroy_buffer(device_native, info.underlying),
                HandleTag::Image => driver.destroy_image(device_native, info.underlying),
                HandleTag::Fence => driver.destroy_fence(device_native, info.underlying),
                HandleTag::Semaphore => {
                    driver.destroy_semaphore(device_native, info.underlying)
                }
                HandleTag::CommandPool => {
                    driver.destroy_command_pool(device_native, info.underlying)
                }
                // Physical devices, queues and command buffers go away with
                // their parents.
                _ => {}
            }
            registry.delete(boxed);
            debug!(puid = self.puid, boxed = format_args!("{boxed:#x}"), ?tag, "swept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDriver;

    #[test]
    fn sweep_removes_everything_in_reverse_order() {
        let registry = HandleRegistry::new();
        let driver: Arc<dyn HostDriver> = Arc::new(TestDriver::new());
        let process = ProcessResources::new(7);

        let instance_native = driver.create_instance(None, 0, &[]).unwrap();
        let instance = registry.new_boxed(instance_native, HandleTag::Instance);
        process.track(instance, HandleTag::Instance, 0);

        let device_native = driver.create_device(1, 0, 1, &[]).unwrap();
        let device = registry.new_boxed(device_native, HandleTag::Device);
        process.track(device, HandleTag::Device, 0);

        let fence_native = driver.create_fence(device_native, false).unwrap();
        let fence = registry.new_boxed(fence_native, HandleTag::Fence);
        process.track(fence, HandleTag::Fence, device);

        process.sweep(&registry, &driver);
        assert!(registry.get(fence).is_none());
        assert!(registry.get(device).is_none());
        assert!(registry.get(instance).is_none());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn untracked_handles_survive_the_sweep() {
        let registry = HandleRegistry::new();
        let driver: Arc<dyn HostDriver> = Arc::new(TestDriver::new());
        let process = ProcessResources::new(8);

        let buffer = registry.new_boxed(0x55, HandleTag::Buffer);
        process.track(buffer, HandleTag::Buffer, 0);
        process.untrack(buffer);
        process.sweep(&registry, &driver);
        assert!(registry.get(buffer).is_some());
    }
}
