//! Frame-level framing: header, checksum trailer, session constants.
//!
//! Every frame is `{u32 opcode, u32 total_length, u32 seqno}` followed by the
//! body. `total_length` covers the header and body but never the trailer, so
//! a receiver that does not understand an opcode can still skip the frame
//! once it knows the negotiated trailer size. Frames are concatenated without
//! padding. Opcode 0 is reserved and indicates end-of-stream.

use crate::codec::DecodeError;

/// Ring capacity per session. Constant, not negotiated.
pub const STREAM_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Per-transfer limit for pipe-mode transports.
pub const TRANSFER_CHUNK: usize = 1024 * 1024;

/// opcode(4) + total_length(4) + seqno(4)
pub const HEADER_SIZE: usize = 12;

/// End-of-stream marker opcode.
pub const OPCODE_EOS: u32 = 0;

/// Upper bound on a single frame; anything larger is a decode error.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Checksum scheme agreed at session startup via the extension handshake.
/// v2+ formats are reserved; they are never offered during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumVersion {
    #[default]
    V0,
    V1,
}

impl ChecksumVersion {
    pub fn trailer_size(self) -> usize {
        match self {
            ChecksumVersion::V0 => 0,
            ChecksumVersion::V1 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: u32,
    pub total_length: u32,
    pub seqno: u32,
}

impl FrameHeader {
    pub fn body_len(&self) -> usize {
        self.total_length as usize - HEADER_SIZE
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame length {0} shorter than header")]
    InvalidLength(u32),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode one frame: header, body, then the trailer for `checksum`.
pub fn encode_frame(
    opcode: u32,
    seqno: u32,
    body: &[u8],
    checksum: ChecksumVersion,
) -> Vec<u8> {
    let total_length = (HEADER_SIZE + body.len()) as u32;
    let mut frame =
        Vec::with_capacity(total_length as usize + checksum.trailer_size());
    frame.extend_from_slice(&opcode.to_le_bytes());
    frame.extend_from_slice(&total_length.to_le_bytes());
    frame.extend_from_slice(&seqno.to_le_bytes());
    frame.extend_from_slice(body);
    if let ChecksumVersion::V1 = checksum {
        frame.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
    }
    frame
}

pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<FrameHeader, WireError> {
    let opcode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let total_length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let seqno = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

    if total_length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(total_length));
    }
    if (total_length as usize) < HEADER_SIZE {
        return Err(WireError::InvalidLength(total_length));
    }

    Ok(FrameHeader {
        opcode,
        total_length,
        seqno,
    })
}

/// Verify a body against its trailer under the negotiated checksum scheme.
pub fn verify_trailer(
    body: &[u8],
    trailer: &[u8],
    checksum: ChecksumVersion,
) -> Result<(), WireError> {
    match checksum {
        ChecksumVersion::V0 => Ok(()),
        ChecksumVersion::V1 => {
            debug_assert_eq!(trailer.len(), 4);
            let expected =
                u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
            let computed = crc32fast::hash(body);
            if expected != computed {
                return Err(WireError::ChecksumMismatch { expected, computed });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let frame = encode_frame(0x66, 9, &[1, 2, 3], ChecksumVersion::V0);
        assert_eq!(frame.len(), HEADER_SIZE + 3);

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&frame[..HEADER_SIZE]);
        let h = decode_header(&header).unwrap();
        assert_eq!(h.opcode, 0x66);
        assert_eq!(h.seqno, 9);
        assert_eq!(h.body_len(), 3);
    }

    #[test]
    fn v1_trailer_detects_corruption() {
        let mut frame = encode_frame(0x66, 0, b"payload", ChecksumVersion::V1);
        let body_start = HEADER_SIZE;
        let body_end = frame.len() - 4;

        let (body, trailer) = frame.split_at(body_end);
        verify_trailer(&body[body_start..], trailer, ChecksumVersion::V1).unwrap();

        // flip one payload byte
        frame[body_start] ^= 0x01;
        let (body, trailer) = frame.split_at(body_end);
        assert!(matches!(
            verify_trailer(&body[body_start..], trailer, ChecksumVersion::V1),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut header = [0u8; HEADER_SIZE];
        header[4..8].copy_from_slice(&(MAX_FRAME_SIZE + 1).to_le_bytes());
        assert!(matches!(
            decode_header(&header),
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn undersized_length_rejected() {
        let mut header = [0u8; HEADER_SIZE];
        header[4..8].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            decode_header(&header),
            Err(WireError::InvalidLength(4))
        ));
    }
}
