pub mod error;
pub mod frame;
pub mod handshake;
pub mod pipe;
pub mod ring;
pub mod tcp;

pub use error::TransportError;
pub use frame::{read_frame, write_frame, Frame};
pub use ring::{ring_pair, RingConsumer, RingProducer, RingSnapshot};

use gstream_protocol::wire::STREAM_BUFFER_SIZE;

/// Capacity of the host-to-guest reply ring. Replies are small; the bulk of
/// the traffic flows guest-to-host.
pub const REPLY_BUFFER_SIZE: usize = 256 * 1024;

/// One ordered byte channel with a reply path. Both directions block; all
/// failures are fatal to the session.
pub trait Channel: Send {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
    fn flush(&mut self) -> Result<(), TransportError>;
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;
    fn mark_exiting(&self);
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write_bytes(bytes)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush()
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).read_fully(buf)
    }

    fn mark_exiting(&self) {
        (**self).mark_exiting()
    }
}

/// Guest endpoint of an ASG session: commands out, replies in.
pub struct GuestAsgChannel {
    to_host: RingProducer,
    from_host: RingConsumer,
}

/// Host endpoint of an ASG session.
pub struct HostAsgChannel {
    from_guest: RingConsumer,
    to_guest: RingProducer,
}

/// Build a connected ASG session: a 4 MiB command ring and a small reply
/// ring.
pub fn asg_channel_pair() -> (GuestAsgChannel, HostAsgChannel) {
    asg_channel_pair_with_capacity(STREAM_BUFFER_SIZE)
}

pub fn asg_channel_pair_with_capacity(capacity: usize) -> (GuestAsgChannel, HostAsgChannel) {
    let (cmd_tx, cmd_rx) = ring::ring_pair(capacity);
    let (reply_tx, reply_rx) = ring::ring_pair(REPLY_BUFFER_SIZE);
    (
        GuestAsgChannel {
            to_host: cmd_tx,
            from_host: reply_rx,
        },
        HostAsgChannel {
            from_guest: cmd_rx,
            to_guest: reply_tx,
        },
    )
}

impl Channel for GuestAsgChannel {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.to_host.write_bytes(bytes)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.to_host.flush()
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.from_host.read_fully(buf)
    }

    fn mark_exiting(&self) {
        self.to_host.mark_exiting();
        self.from_host.mark_exiting();
    }
}

impl Channel for HostAsgChannel {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.to_guest.write_bytes(bytes)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.to_guest.flush()
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.from_guest.read_fully(buf)
    }

    fn mark_exiting(&self) {
        self.from_guest.mark_exiting();
        self.to_guest.mark_exiting();
    }
}

impl HostAsgChannel {
    /// Snapshot support: refuse unless the command ring is drained.
    pub fn quiesce(&self) -> Result<RingSnapshot, TransportError> {
        self.from_guest.quiesce()
    }
}
