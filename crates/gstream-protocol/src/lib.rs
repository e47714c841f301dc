pub mod codec;
pub mod commands;
pub mod features;
pub mod handle;
pub mod wire;

pub use codec::{DecodeError, Reader, Writer};
pub use features::SessionFeatures;
pub use handle::{BoxedHandle, HandleTag, NULL_HANDLE, VIRTUAL_QUEUE_BIT};
pub use wire::{ChecksumVersion, FrameHeader, WireError};
