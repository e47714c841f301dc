pub mod logging;
pub mod sync_fd;
pub mod window;

pub use window::AddressSpaceWindow;
