//! The address-space graphics (ASG) ring.
//!
//! A single-producer single-consumer byte ring with monotonically increasing
//! cursors (the ring index is `pos % capacity`; the cursors themselves never
//! wrap as integers). The producer is the guest encoder, serialized by the
//! session lock; the consumer is the host decoder thread.
//!
//! Wakeups: the consumer sleeps on a ping channel when `read_pos ==
//! write_pos` and is pinged when committed-but-unconsumed bytes cross
//! `WAKE_THRESHOLD` or on an explicit flush. The producer blocks on a condvar
//! when the ring is full and is woken whenever the consumer advances.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

use crate::error::TransportError;

/// Committed bytes that trigger an implicit consumer ping.
pub const WAKE_THRESHOLD: u64 = 4096;

/// Host consumer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HostState {
    Running = 0,
    WaitingOnData = 1,
    Exiting = 2,
}

/// Guest producer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GuestState {
    Running = 0,
    Flushing = 1,
    Exiting = 2,
}

struct RingShared {
    buf: Box<[UnsafeCell<u8>]>,
    /// Total bytes ever committed by the producer.
    write_pos: AtomicU64,
    /// Total bytes ever consumed.
    read_pos: AtomicU64,
    host_state: AtomicU32,
    guest_state: AtomicU32,
    /// Producer parks here when the ring is full.
    space_lock: Mutex<()>,
    space_cond: Condvar,
    /// Consumer ping (capacity 1; pings coalesce).
    ping_tx: Sender<()>,
    ping_rx: Receiver<()>,
    /// Bytes committed since the last ping, for the wake threshold.
    unpinged: AtomicU64,
}

// The cursor discipline makes buffer ranges exclusively owned: the producer
// only writes between write_pos and read_pos + capacity, the consumer only
// reads between read_pos and write_pos.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0);
        let (ping_tx, ping_rx) = bounded(1);
        let buf = (0..capacity)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            buf,
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            host_state: AtomicU32::new(HostState::Running as u32),
            guest_state: AtomicU32::new(GuestState::Running as u32),
            space_lock: Mutex::new(()),
            space_cond: Condvar::new(),
            ping_tx,
            ping_rx,
            unpinged: AtomicU64::new(0),
        })
    }

    fn capacity(&self) -> u64 {
        self.buf.len() as u64
    }

    fn host_exiting(&self) -> bool {
        self.host_state.load(Ordering::Acquire) == HostState::Exiting as u32
    }

    fn guest_exiting(&self) -> bool {
        self.guest_state.load(Ordering::Acquire) == GuestState::Exiting as u32
    }

    fn ping(&self) {
        self.unpinged.store(0, Ordering::Relaxed);
        match self.ping_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {}
        }
    }
}

/// Guest half of the ring.
pub struct RingProducer {
    shared: Arc<RingShared>,
    /// Reservation scratch for `alloc_buffer`/`commit_buffer`.
    staging: Vec<u8>,
}

/// Host half of the ring.
pub struct RingConsumer {
    shared: Arc<RingShared>,
}

/// Create a connected producer/consumer pair over a fresh ring.
pub fn ring_pair(capacity: usize) -> (RingProducer, RingConsumer) {
    let shared = RingShared::new(capacity);
    (
        RingProducer {
            shared: Arc::clone(&shared),
            staging: Vec::new(),
        },
        RingConsumer { shared },
    )
}

impl RingProducer {
    /// Reserve at least `min_size` contiguous bytes for the caller to fill.
    /// The reservation is published by [`RingProducer::commit_buffer`].
    pub fn alloc_buffer(&mut self, min_size: usize) -> &mut [u8] {
        if self.staging.len() < min_size {
            self.staging.resize(min_size, 0);
        }
        &mut self.staging[..min_size]
    }

    /// Publish `size` bytes previously reserved. Blocks while the ring is
    /// full, wrapping internally once the consumer frees the tail.
    pub fn commit_buffer(&mut self, size: usize) -> Result<(), TransportError> {
        debug_assert!(size <= self.staging.len());
        let staged = std::mem::take(&mut self.staging);
        let result = self.write_bytes(&staged[..size]);
        self.staging = staged;
        result
    }

    /// Copy `bytes` into the ring, blocking on backpressure.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let shared = &self.shared;
        let capacity = shared.capacity();
        let mut offset = 0usize;

        while offset < bytes.len() {
            if shared.guest_exiting() {
                return Err(TransportError::Exiting);
            }
            if shared.host_exiting() {
                return Err(TransportError::Disconnected);
            }

            let write = shared.write_pos.load(Ordering::Acquire);
            let read = shared.read_pos.load(Ordering::Acquire);
            let available = capacity - (write - read);

            if available == 0 {
                // Ring full: make sure the consumer is awake, then wait for
                // its cursor to move.
                shared.ping();
                let mut guard = shared.space_lock.lock();
                let read_now = shared.read_pos.load(Ordering::Acquire);
                if read_now == read && !shared.host_exiting() {
                    shared.space_cond.wait(&mut guard);
                }
                continue;
            }

            let index = (write % capacity) as usize;
            let until_wrap = capacity as usize - index;
            let chunk = (bytes.len() - offset)
                .min(available as usize)
                .min(until_wrap);

            // SAFETY: [write, write + chunk) is unowned by the consumer,
            // and this producer is the only writer.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(offset),
                    shared.buf[index].get(),
                    chunk,
                );
            }
            shared.write_pos.store(write + chunk as u64, Ordering::Release);
            offset += chunk;

            let unpinged = shared
                .unpinged
                .fetch_add(chunk as u64, Ordering::Relaxed)
                + chunk as u64;
            if unpinged >= WAKE_THRESHOLD {
                shared.ping();
            }
        }
        Ok(())
    }

    /// Make committed bytes visible and ping the consumer if it sleeps.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        if self.shared.guest_exiting() {
            return Err(TransportError::Exiting);
        }
        if self.shared.host_exiting() {
            return Err(TransportError::Disconnected);
        }
        self.shared
            .guest_state
            .store(GuestState::Flushing as u32, Ordering::Release);
        self.shared.ping();
        self.shared
            .guest_state
            .store(GuestState::Running as u32, Ordering::Release);
        Ok(())
    }

    /// Mark the guest side exiting. The consumer drains what was committed
    /// and then observes end-of-stream.
    pub fn mark_exiting(&self) {
        self.shared
            .guest_state
            .store(GuestState::Exiting as u32, Ordering::Release);
        self.shared.ping();
    }

    pub fn is_peer_exiting(&self) -> bool {
        self.shared.host_exiting()
    }
}

impl RingConsumer {
    /// Read exactly `buf.len()` bytes, blocking until they arrive.
    /// Peer shutdown with fewer bytes committed is fatal.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let shared = &self.shared;
        let capacity = shared.capacity();
        let mut offset = 0usize;

        while offset < buf.len() {
            if shared.host_exiting() {
                return Err(TransportError::Exiting);
            }

            let write = shared.write_pos.load(Ordering::Acquire);
            let read = shared.read_pos.load(Ordering::Acquire);
            let available = write - read;

            if available == 0 {
                if shared.guest_exiting() {
                    return Err(TransportError::Disconnected);
                }
                shared
                    .host_state
                    .store(HostState::WaitingOnData as u32, Ordering::Release);
                // Re-check after publishing the waiting state; the producer
                // pings after committing.
                if shared.write_pos.load(Ordering::Acquire) == read {
                    let _ = shared.ping_rx.recv();
                }
                shared
                    .host_state
                    .store(HostState::Running as u32, Ordering::Release);
                continue;
            }

            let index = (read % capacity) as usize;
            let until_wrap = capacity as usize - index;
            let chunk = (buf.len() - offset)
                .min(available as usize)
                .min(until_wrap);

            // SAFETY: [read, read + chunk) was published by the producer and
            // this consumer is the only reader.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    shared.buf[index].get(),
                    buf.as_mut_ptr().add(offset),
                    chunk,
                );
            }
            shared.read_pos.store(read + chunk as u64, Ordering::Release);
            offset += chunk;

            let _guard = shared.space_lock.lock();
            shared.space_cond.notify_one();
        }
        Ok(())
    }

    /// Bytes committed but not yet consumed.
    pub fn pending(&self) -> u64 {
        let write = self.shared.write_pos.load(Ordering::Acquire);
        let read = self.shared.read_pos.load(Ordering::Acquire);
        write - read
    }

    pub fn is_peer_exiting(&self) -> bool {
        self.shared.guest_exiting()
    }

    /// Mark the host side exiting and wake a blocked producer.
    pub fn mark_exiting(&self) {
        self.shared
            .host_state
            .store(HostState::Exiting as u32, Ordering::Release);
        let _guard = self.shared.space_lock.lock();
        self.shared.space_cond.notify_one();
    }

    /// Verify the ring is quiesced for snapshot: all committed bytes
    /// consumed, no in-flight transfer.
    pub fn quiesce(&self) -> Result<RingSnapshot, TransportError> {
        if self.pending() != 0 {
            return Err(TransportError::SnapshotRefused(format!(
                "{} committed bytes not yet consumed",
                self.pending()
            )));
        }
        Ok(RingSnapshot {
            capacity: self.shared.capacity() as usize,
        })
    }
}

/// Quiesced ring descriptor. Cursors are implicitly zero: restore allocates
/// a fresh ring and both sides resume at running.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RingSnapshot {
    pub capacity: usize,
}

impl RingSnapshot {
    pub fn restore(&self) -> (RingProducer, RingConsumer) {
        ring_pair(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_cross_the_ring_in_order() {
        let (mut producer, mut consumer) = ring_pair(64);
        let payload: Vec<u8> = (0..255u8).collect();

        let writer = std::thread::spawn({
            let payload = payload.clone();
            move || {
                // 255 bytes through a 64-byte ring forces wraps and
                // backpressure.
                producer.write_bytes(&payload).unwrap();
                producer.flush().unwrap();
            }
        });

        let mut out = vec![0u8; 255];
        consumer.read_fully(&mut out).unwrap();
        writer.join().expect("writer panicked");
        assert_eq!(out, payload);
    }

    #[test]
    fn alloc_commit_publishes_reservation() {
        let (mut producer, mut consumer) = ring_pair(1024);
        let buf = producer.alloc_buffer(8);
        buf.copy_from_slice(&[9, 8, 7, 6, 5, 4, 3, 2]);
        producer.commit_buffer(8).unwrap();
        producer.flush().unwrap();

        let mut out = [0u8; 8];
        consumer.read_fully(&mut out).unwrap();
        assert_eq!(out, [9, 8, 7, 6, 5, 4, 3, 2]);
    }

    #[test]
    fn producer_exit_is_fatal_to_reader() {
        let (producer, mut consumer) = ring_pair(64);
        producer.mark_exiting();
        let mut out = [0u8; 4];
        assert!(matches!(
            consumer.read_fully(&mut out),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn consumer_exit_unblocks_full_producer() {
        let (mut producer, consumer) = ring_pair(16);
        producer.write_bytes(&[0u8; 16]).unwrap();

        let writer = std::thread::spawn(move || producer.write_bytes(&[1u8; 8]));
        std::thread::sleep(std::time::Duration::from_millis(30));
        consumer.mark_exiting();
        assert!(matches!(
            writer.join().expect("writer panicked"),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn quiesce_requires_drained_ring() {
        let (mut producer, mut consumer) = ring_pair(64);
        producer.write_bytes(&[1, 2, 3]).unwrap();
        assert!(consumer.quiesce().is_err());

        let mut out = [0u8; 3];
        consumer.read_fully(&mut out).unwrap();
        let snapshot = consumer.quiesce().unwrap();
        assert_eq!(snapshot.capacity, 64);

        // Restore yields a fresh running ring.
        let (mut p2, mut c2) = snapshot.restore();
        p2.write_bytes(&[4]).unwrap();
        let mut one = [0u8; 1];
        c2.read_fully(&mut one).unwrap();
        assert_eq!(one[0], 4);
    }
}
