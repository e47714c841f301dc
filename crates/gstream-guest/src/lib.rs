//! Guest-side half of the gstream Vulkan transport: the encoder the guest
//! ICD calls, the session RPC layer underneath it, and the host-visible
//! memory virtualizer that keeps small allocations off the wire.

pub mod encoder;
pub mod handles;
pub mod memory;
pub mod session;
pub mod staging;

pub use encoder::{Encoder, GuestMemory};
pub use handles::GuestHandles;
pub use memory::{MemoryTable, MemoryTypeTranslation, SubAllocator};
pub use session::{GuestError, GuestSession};
