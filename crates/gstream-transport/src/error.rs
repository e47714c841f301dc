use gstream_protocol::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("peer disconnected")]
    Disconnected,

    #[error("session is exiting")]
    Exiting,

    #[error("timeout")]
    Timeout,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("snapshot refused: {0}")]
    SnapshotRefused(String),
}

impl TransportError {
    /// Fatal errors terminate the session; every outstanding call then
    /// surfaces as device-lost to the application.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Timeout)
    }
}
