//! Boxed handle values and type tags.
//!
//! A boxed handle is a process-unique opaque u64 handed out by the host and
//! retained by the guest. The host registry encodes a slot index and a
//! generation into the value; on the wire it is just the u64.

/// Opaque 64-bit handle exposed to the guest.
pub type BoxedHandle = u64;

/// The null handle; never allocated by the registry.
pub const NULL_HANDLE: BoxedHandle = 0;

/// Marks a queue's underlying handle as a virtual queue multiplexed onto a
/// physical one. Stripped before the handle reaches the host driver.
pub const VIRTUAL_QUEUE_BIT: u64 = 1 << 63;

/// Type tag carried by every registry slot, asserted on unbox in debug
/// builds so a boxed VkImage cannot silently stand in for a VkBuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleTag {
    Invalid = 0,
    Instance,
    PhysicalDevice,
    Device,
    Queue,
    DeviceMemory,
    Buffer,
    Image,
    ImageView,
    Sampler,
    CommandPool,
    CommandBuffer,
    Fence,
    Semaphore,
    RenderPass,
    Framebuffer,
    Generic,
}

impl HandleTag {
    /// Dispatchable handles carry a dispatch table and order info; they match
    /// the Vulkan dispatchable object taxonomy.
    pub fn is_dispatchable(self) -> bool {
        matches!(
            self,
            HandleTag::Instance
                | HandleTag::PhysicalDevice
                | HandleTag::Device
                | HandleTag::Queue
                | HandleTag::CommandBuffer
        )
    }

    /// Handles that can be used concurrently from several guest threads and
    /// therefore carry order-maintenance info.
    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            HandleTag::Instance | HandleTag::Device | HandleTag::Queue | HandleTag::CommandBuffer
        )
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => HandleTag::Invalid,
            1 => HandleTag::Instance,
            2 => HandleTag::PhysicalDevice,
            3 => HandleTag::Device,
            4 => HandleTag::Queue,
            5 => HandleTag::DeviceMemory,
            6 => HandleTag::Buffer,
            7 => HandleTag::Image,
            8 => HandleTag::ImageView,
            9 => HandleTag::Sampler,
            10 => HandleTag::CommandPool,
            11 => HandleTag::CommandBuffer,
            12 => HandleTag::Fence,
            13 => HandleTag::Semaphore,
            14 => HandleTag::RenderPass,
            15 => HandleTag::Framebuffer,
            16 => HandleTag::Generic,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatchable_taxonomy() {
        assert!(HandleTag::Instance.is_dispatchable());
        assert!(HandleTag::Queue.is_dispatchable());
        assert!(HandleTag::CommandBuffer.is_dispatchable());
        assert!(!HandleTag::Buffer.is_dispatchable());
        assert!(!HandleTag::Fence.is_dispatchable());
    }

    #[test]
    fn tag_round_trip() {
        for v in 0..=16u8 {
            let tag = HandleTag::from_u8(v).unwrap();
            assert_eq!(tag as u8, v);
        }
        assert!(HandleTag::from_u8(17).is_none());
    }
}
