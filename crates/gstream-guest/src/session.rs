//! Guest session: one negotiated channel plus the lock that serializes it.
//!
//! Commands are synchronous RPCs: the caller encodes into its thread's
//! staging buffer, takes the session lock, writes the frame, and reads the
//! reply before unlocking. Any wire failure poisons the session; every call
//! after that reports a lost device without touching the transport.

use std::sync::atomic::{AtomicBool, Ordering};

use gstream_protocol::codec::DecodeError;
use gstream_protocol::commands::{VkCommand, VkResponse};
use gstream_protocol::features::SessionFeatures;
use gstream_protocol::wire;
use gstream_protocol::{Reader, Writer};
use gstream_transport::error::TransportError;
use gstream_transport::frame::{read_frame, write_eos};
use gstream_transport::handshake::{guest_connect, SessionInfo};
use gstream_transport::Channel;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error};

use crate::staging::with_staging;

#[derive(Debug, Error)]
pub enum GuestError {
    /// The session is dead: transport failure, checksum mismatch, or the
    /// host closed the stream underneath us.
    #[error("device lost")]
    DeviceLost,
    #[error("host driver returned {result}")]
    Driver { result: i32 },
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
    #[error("unknown guest memory id {0}")]
    UnknownMemory(u64),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("reply decode failed: {0}")]
    Decode(#[from] DecodeError),
}

pub struct GuestSession {
    channel: Mutex<Box<dyn Channel>>,
    info: SessionInfo,
    poisoned: AtomicBool,
}

impl GuestSession {
    /// Handshake over a fresh channel.
    pub fn connect(
        mut channel: Box<dyn Channel>,
        requested: SessionFeatures,
    ) -> Result<Self, GuestError> {
        let info = guest_connect(&mut channel, requested)?;
        Ok(Self {
            channel: Mutex::new(channel),
            info,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Connect via TCP, the external test-harness transport.
    pub fn connect_tcp(
        addr: &str,
        requested: SessionFeatures,
    ) -> Result<Self, GuestError> {
        let stream = gstream_transport::tcp::connect(addr)?;
        Self::connect(Box::new(stream), requested)
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn features(&self) -> SessionFeatures {
        self.info.features
    }

    fn poison(&self) -> GuestError {
        self.poisoned.store(true, Ordering::Release);
        self.channel.lock().mark_exiting();
        GuestError::DeviceLost
    }

    /// Send one command and wait for its reply.
    pub fn call(&self, command: &VkCommand, seqno: u32) -> Result<VkResponse, GuestError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(GuestError::DeviceLost);
        }

        let checksum = self.info.checksum;
        let mut body = Writer::new();
        command.encode_body(&mut body);

        let frame = with_staging(|staging| {
            let buf = staging.begin();
            *buf = wire::encode_frame(command.opcode(), seqno, body.as_bytes(), checksum);
            let bytes = staging.submit();

            let mut channel = self.channel.lock();
            let result = channel
                .write_bytes(bytes)
                .and_then(|_| channel.flush())
                .and_then(|_| read_frame(&mut *channel, checksum));
            drop(channel);
            staging.release();
            result
        });

        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                error!(%err, "session failed");
                return Err(self.poison());
            }
        };
        if frame.is_eos() {
            // The host poisoned the stream (bad checksum or decode).
            debug!("host closed the stream");
            return Err(self.poison());
        }

        let mut reader = Reader::new(&frame.body);
        Ok(VkResponse::decode(&mut reader)?)
    }

    /// Clean shutdown: tell the host we are done.
    pub fn shutdown(&self) {
        if self.poisoned.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut channel = self.channel.lock();
        let _ = write_eos(&mut *channel, self.info.checksum);
        channel.mark_exiting();
    }
}

impl Drop for GuestSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
