//! Frame IO over a [`Channel`].

use gstream_protocol::wire::{
    self, ChecksumVersion, FrameHeader, HEADER_SIZE, OPCODE_EOS,
};

use crate::error::TransportError;
use crate::Channel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn is_eos(&self) -> bool {
        self.header.opcode == OPCODE_EOS
    }
}

/// Write one frame (header, body, trailer). Does not flush.
pub fn write_frame(
    channel: &mut impl Channel,
    opcode: u32,
    seqno: u32,
    body: &[u8],
    checksum: ChecksumVersion,
) -> Result<(), TransportError> {
    let frame = wire::encode_frame(opcode, seqno, body, checksum);
    channel.write_bytes(&frame)
}

/// Signal end-of-stream to the peer.
pub fn write_eos(
    channel: &mut impl Channel,
    checksum: ChecksumVersion,
) -> Result<(), TransportError> {
    write_frame(channel, OPCODE_EOS, 0, &[], checksum)?;
    channel.flush()
}

/// Read one frame, verifying the checksum trailer. A mismatch is fatal.
pub fn read_frame(
    channel: &mut impl Channel,
    checksum: ChecksumVersion,
) -> Result<Frame, TransportError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    channel.read_fully(&mut header_buf)?;
    let header = wire::decode_header(&header_buf)?;

    let mut body = vec![0u8; header.body_len()];
    channel.read_fully(&mut body)?;

    let trailer_size = checksum.trailer_size();
    if trailer_size > 0 {
        let mut trailer = vec![0u8; trailer_size];
        channel.read_fully(&mut trailer)?;
        wire::verify_trailer(&body, &trailer, checksum)?;
    }

    Ok(Frame { header, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg_channel_pair_with_capacity;

    #[test]
    fn frames_cross_the_channel() {
        let (mut guest, mut host) = asg_channel_pair_with_capacity(4096);

        write_frame(&mut guest, 0x150, 7, b"submit", ChecksumVersion::V1).unwrap();
        guest.flush().unwrap();

        let frame = read_frame(&mut host, ChecksumVersion::V1).unwrap();
        assert_eq!(frame.header.opcode, 0x150);
        assert_eq!(frame.header.seqno, 7);
        assert_eq!(frame.body, b"submit");
    }

    #[test]
    fn eos_frame_is_recognized() {
        let (mut guest, mut host) = asg_channel_pair_with_capacity(4096);
        write_eos(&mut guest, ChecksumVersion::V0).unwrap();
        let frame = read_frame(&mut host, ChecksumVersion::V0).unwrap();
        assert!(frame.is_eos());
    }

    #[test]
    fn corrupted_body_fails_the_checksum() {
        let (mut guest, mut host) = asg_channel_pair_with_capacity(4096);

        let mut raw = gstream_protocol::wire::encode_frame(
            0x150,
            0,
            b"payload",
            ChecksumVersion::V1,
        );
        raw[HEADER_SIZE] ^= 0x40;
        guest.write_bytes(&raw).unwrap();
        guest.flush().unwrap();

        match read_frame(&mut host, ChecksumVersion::V1) {
            Err(TransportError::Wire(
                gstream_protocol::wire::WireError::ChecksumMismatch { .. },
            )) => {}
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }
}
