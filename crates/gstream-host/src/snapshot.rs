//! Snapshot blobs.
//!
//! A snapshot is taken only at a quiesced point: the ring is drained, no
//! command is mid-execution. State is captured as the minimal replay needed
//! to rebuild it: the creation commands in their original order (with the
//! boxed handles they issued, so restore re-issues the same values), plus
//! the raw contents of every live device-memory allocation.

use gstream_protocol::handle::BoxedHandle;
use gstream_transport::ring::RingSnapshot;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot serialization failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("replayed command failed: opcode {opcode:#x}, result {result}")]
    Replay { opcode: u32, result: i32 },
    #[error("replayed handle mismatch: expected {expected:#x}, got {got:#x}")]
    HandleMismatch { expected: u64, got: u64 },
}

/// One state-building command, recorded at execute time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub opcode: u32,
    /// Encoded command body, boxed handles and all.
    pub body: Vec<u8>,
    /// Boxed handles this command issued, in reply order.
    pub handles: Vec<BoxedHandle>,
    /// Boxed handles this command depends on; the entry dies with them.
    pub refs: Vec<BoxedHandle>,
}

/// Contents of one live allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryImage {
    pub memory: BoxedHandle,
    pub bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
pub struct HostSnapshot {
    pub puid: u64,
    pub entries: Vec<ReplayEntry>,
    pub memory: Vec<MemoryImage>,
    /// Command ring geometry, captured after quiesce.
    pub ring: Option<RingSnapshot>,
}

impl HostSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips_through_bincode() {
        let snapshot = HostSnapshot {
            puid: 42,
            entries: vec![ReplayEntry {
                opcode: 0x100,
                body: vec![1, 2, 3],
                handles: vec![0x1_0000_0001],
                refs: vec![],
            }],
            memory: vec![MemoryImage {
                memory: 0x2_0000_0002,
                bytes: vec![0xFF; 64],
            }],
            ring: None,
        };
        let bytes = snapshot.to_bytes().unwrap();
        let back = HostSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(back.puid, 42);
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].handles, vec![0x1_0000_0001]);
        assert_eq!(back.memory[0].bytes.len(), 64);
    }
}
