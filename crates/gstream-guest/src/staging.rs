//! Per-thread staging buffers.
//!
//! Frames are encoded into a thread-local buffer while no lock is held; only
//! the finished bytes cross the session lock into the transport. Each buffer
//! carries a sync word: the buffer is handed to the transport in the
//! read-pending state and may only be reused once the transport has consumed
//! it and it returns to read-complete.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

pub const READ_COMPLETE: u64 = 0;
pub const READ_PENDING: u64 = 1;

pub struct StagingBuffer {
    sync: AtomicU64,
    buf: Vec<u8>,
}

impl StagingBuffer {
    pub fn new() -> Self {
        Self {
            sync: AtomicU64::new(READ_COMPLETE),
            buf: Vec::with_capacity(4096),
        }
    }

    /// Start a new frame. The previous consumer must have released the
    /// buffer.
    pub fn begin(&mut self) -> &mut Vec<u8> {
        debug_assert_eq!(
            self.sync.load(Ordering::Acquire),
            READ_COMPLETE,
            "staging buffer reused while still pending"
        );
        self.buf.clear();
        &mut self.buf
    }

    /// Hand the encoded bytes to a consumer.
    pub fn submit(&mut self) -> &[u8] {
        self.sync.store(READ_PENDING, Ordering::Release);
        &self.buf
    }

    /// Consumer is done with the bytes.
    pub fn release(&self) {
        self.sync.store(READ_COMPLETE, Ordering::Release);
    }
}

impl Default for StagingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static STAGING: RefCell<StagingBuffer> = RefCell::new(StagingBuffer::new());
}

/// Run `f` with this thread's staging buffer.
pub fn with_staging<R>(f: impl FnOnce(&mut StagingBuffer) -> R) -> R {
    STAGING.with(|cell| f(&mut cell.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_cycles_through_states() {
        let mut staging = StagingBuffer::new();
        staging.begin().extend_from_slice(b"frame");
        assert_eq!(staging.submit(), b"frame");
        staging.release();
        // Reusable after release; contents reset.
        assert!(staging.begin().is_empty());
    }

    #[test]
    fn each_thread_gets_its_own_buffer() {
        with_staging(|s| {
            s.begin().push(1);
        });
        std::thread::spawn(|| {
            with_staging(|s| {
                assert!(s.begin().is_empty());
            });
        })
        .join()
        .expect("staging thread panicked");
    }
}
