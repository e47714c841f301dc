//! One-shot pipe transport.
//!
//! Unlike the ASG ring, a pipe moves bytes through a bounded transfer buffer:
//! every write is partitioned into chunks of at most
//! [`TRANSFER_CHUNK`](gstream_protocol::wire::TRANSFER_CHUNK) bytes, and a
//! wait for the peer's completion of the prior transfer precedes each next
//! chunk.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gstream_protocol::wire::TRANSFER_CHUNK;

use crate::error::TransportError;
use crate::Channel;

pub struct PipeStream<S: Read + Write + Send> {
    stream: S,
    exiting: Arc<AtomicBool>,
}

impl<S: Read + Write + Send> PipeStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            exiting: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_exiting(&self) -> Result<(), TransportError> {
        if self.exiting.load(Ordering::Acquire) {
            return Err(TransportError::Exiting);
        }
        Ok(())
    }

    /// Block until the peer has consumed the previous transfer. Stream-backed
    /// pipes piggyback completion on the kernel buffer, so this reduces to a
    /// flush.
    pub fn wait(&mut self) -> Result<(), TransportError> {
        self.check_exiting()?;
        self.stream.flush()?;
        Ok(())
    }
}

impl<S: Read + Write + Send> Channel for PipeStream<S> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.check_exiting()?;
        let mut offset = 0;
        while offset < bytes.len() {
            let chunk = (bytes.len() - offset).min(TRANSFER_CHUNK);
            if offset > 0 {
                // Transfer buffer was filled by the previous chunk.
                self.wait()?;
            }
            self.stream.write_all(&bytes[offset..offset + chunk])?;
            offset += chunk;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.check_exiting()?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.check_exiting()?;
        self.stream.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Disconnected
            } else {
                TransportError::Io(e)
            }
        })
    }

    fn mark_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
    }
}

/// Connected in-process pipe pair (one-shot pipe mode, tests and
/// single-machine setups).
#[cfg(unix)]
pub fn pipe_pair() -> std::io::Result<(
    PipeStream<std::os::unix::net::UnixStream>,
    PipeStream<std::os::unix::net::UnixStream>,
)> {
    let (a, b) = std::os::unix::net::UnixStream::pair()?;
    Ok((PipeStream::new(a), PipeStream::new(b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gstream_protocol::wire::ChecksumVersion;

    #[test]
    fn frames_cross_a_unix_pipe() {
        let (mut guest, mut host) = pipe_pair().unwrap();

        let reader = std::thread::spawn(move || {
            crate::frame::read_frame(&mut host, ChecksumVersion::V0).unwrap()
        });

        crate::frame::write_frame(&mut guest, 0x120, 3, b"create-buffer", ChecksumVersion::V0)
            .unwrap();
        guest.flush().unwrap();

        let frame = reader.join().expect("reader panicked");
        assert_eq!(frame.header.opcode, 0x120);
        assert_eq!(frame.body, b"create-buffer");
    }

    #[test]
    fn disconnect_is_fatal() {
        let (guest, mut host) = pipe_pair().unwrap();
        drop(guest);
        let mut buf = [0u8; 4];
        assert!(matches!(
            host.read_fully(&mut buf),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn large_transfers_are_chunked() {
        let (mut guest, mut host) = pipe_pair().unwrap();
        let payload = vec![0x5Au8; TRANSFER_CHUNK + 1234];

        let writer = std::thread::spawn({
            let payload = payload.clone();
            move || {
                guest.write_bytes(&payload).unwrap();
                guest.flush().unwrap();
            }
        });

        let mut out = vec![0u8; payload.len()];
        host.read_fully(&mut out).unwrap();
        writer.join().expect("writer panicked");
        assert_eq!(out, payload);
    }
}
