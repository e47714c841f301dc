//! Exported fence file descriptors.
//!
//! The host signals a GPU fence by writing one byte into a pipe; the guest
//! presentation path waits on the read end with `poll`. The pair stands in
//! for the platform's native sync object on targets that lack one.

use std::io;
use std::time::Duration;

/// Default timeout used by the guest presentation path.
pub const DEFAULT_SYNC_WAIT: Duration = Duration::from_secs(3);

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

    /// Read end of a fence pipe, handed to the guest compositor.
    #[derive(Debug)]
    pub struct SyncFd {
        fd: OwnedFd,
    }

    /// Write end, retained by the host until the GPU work completes.
    #[derive(Debug)]
    pub struct SyncSignaler {
        fd: OwnedFd,
    }

    /// Create a connected signaler/waiter pair.
    pub fn sync_pair() -> io::Result<(SyncSignaler, SyncFd)> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid out-array of two descriptors.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 returned ownership of both descriptors.
        let (read, write) = unsafe {
            (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))
        };
        Ok((SyncSignaler { fd: write }, SyncFd { fd: read }))
    }

    impl SyncSignaler {
        /// Mark the fence signaled. Consumes the signaler; a fence fires once.
        pub fn signal(self) -> io::Result<()> {
            let byte = [1u8];
            // SAFETY: fd is open for writing and byte is one valid byte.
            let n = unsafe {
                libc::write(self.fd.as_raw_fd(), byte.as_ptr().cast(), 1)
            };
            if n != 1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl SyncFd {
        /// Block until the fence signals or `timeout` elapses.
        /// Returns 0 when signaled, mirroring the platform sync_wait contract.
        pub fn wait(&self, timeout: Duration) -> io::Result<i32> {
            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
            // SAFETY: pfd is a valid pollfd for the lifetime of the call.
            let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
            match rc {
                1 => Ok(0),
                0 => Err(io::Error::from(io::ErrorKind::TimedOut)),
                _ => Err(io::Error::last_os_error()),
            }
        }

        /// Hand the descriptor across an API boundary as a plain integer.
        pub fn into_raw(self) -> i64 {
            self.fd.into_raw_fd() as i64
        }

        /// Re-adopt a descriptor previously produced by [`SyncFd::into_raw`].
        ///
        /// # Safety
        /// `raw` must be an open pipe read end owned by the caller.
        pub unsafe fn from_raw(raw: i64) -> Self {
            Self {
                fd: unsafe { OwnedFd::from_raw_fd(raw as RawFd) },
            }
        }
    }
}

#[cfg(unix)]
pub use unix::{sync_pair, SyncFd, SyncSignaler};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaled_fence_wakes_waiter() {
        let (signaler, waiter) = sync_pair().unwrap();
        signaler.signal().unwrap();
        assert_eq!(waiter.wait(DEFAULT_SYNC_WAIT).unwrap(), 0);
    }

    #[test]
    fn unsignaled_fence_times_out() {
        let (_signaler, waiter) = sync_pair().unwrap();
        let err = waiter.wait(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn raw_round_trip_preserves_signal() {
        let (signaler, waiter) = sync_pair().unwrap();
        let raw = waiter.into_raw();
        signaler.signal().unwrap();
        let waiter = unsafe { SyncFd::from_raw(raw) };
        assert_eq!(waiter.wait(DEFAULT_SYNC_WAIT).unwrap(), 0);
    }
}
