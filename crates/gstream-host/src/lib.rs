//! Host side: the decoder, the boxed handle registry and the driver bridge.

pub mod ash_driver;
pub mod decoder;
pub mod driver;
pub mod process;
pub mod queue;
pub mod registry;
pub mod snapshot;
pub mod testing;

pub use decoder::Decoder;
pub use driver::{DriverError, HostDriver};
pub use registry::{HandleRegistry, OrderInfo, FAST_PATH_CAPACITY, N_GRACE};
pub use snapshot::HostSnapshot;
