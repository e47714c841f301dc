pub mod config;
pub mod error;

pub use config::{GstreamConfig, TransportKind};
pub use error::CoreError;
