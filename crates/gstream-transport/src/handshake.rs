//! Session establishment.
//!
//! On connect the guest sends `u32 client_flags = 0`; the host replies with a
//! 64-bit per-process UID (puid). A single extension request/reply then
//! establishes which feature extensions are in play, and the guest commits
//! the checksum scheme with one final control command. No API traffic may
//! flow before the handshake completes.

use gstream_protocol::commands::{opcodes, VkCommand, VkResponse};
use gstream_protocol::features::SessionFeatures;
use gstream_protocol::wire::ChecksumVersion;
use gstream_protocol::{Reader, Writer};
use tracing::debug;

use crate::error::TransportError;
use crate::frame::{read_frame, write_frame};
use crate::Channel;

/// Magic sent as `client_flags`. No flag bits are defined yet.
pub const CLIENT_FLAGS: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub puid: u64,
    pub features: SessionFeatures,
    pub checksum: ChecksumVersion,
}

/// Guest side: negotiate a session over a fresh channel.
pub fn guest_connect(
    channel: &mut impl Channel,
    requested: SessionFeatures,
) -> Result<SessionInfo, TransportError> {
    channel.write_bytes(&CLIENT_FLAGS.to_le_bytes())?;
    channel.flush()?;

    let mut puid_buf = [0u8; 8];
    channel.read_fully(&mut puid_buf)?;
    let puid = u64::from_le_bytes(puid_buf);

    // Extension exchange runs without a trailer; checksum applies only
    // after it is negotiated.
    send_command(channel, &VkCommand::GetExtensions)?;
    let host_features = match recv_response(channel, opcodes::GET_EXTENSIONS)? {
        VkResponse::ExtensionList { extensions } => {
            SessionFeatures::from_extension_string(&extensions)
        }
        other => {
            return Err(TransportError::HandshakeFailed(format!(
                "unexpected extension reply: {other:?}"
            )))
        }
    };

    let features = requested & host_features;
    let checksum = features.checksum_version();

    send_command(
        channel,
        &VkCommand::SetChecksumVersion {
            version: match checksum {
                ChecksumVersion::V0 => 0,
                ChecksumVersion::V1 => 1,
            },
        },
    )?;
    match recv_response(channel, opcodes::SET_CHECKSUM_VERSION)? {
        VkResponse::Ok => {}
        other => {
            return Err(TransportError::HandshakeFailed(format!(
                "checksum negotiation rejected: {other:?}"
            )))
        }
    }

    debug!(puid, ?features, ?checksum, "guest session established");
    Ok(SessionInfo {
        puid,
        features,
        checksum,
    })
}

/// Host side: accept a session, advertising `advertised` and assigning
/// `puid`.
pub fn host_accept(
    channel: &mut impl Channel,
    advertised: SessionFeatures,
    puid: u64,
) -> Result<SessionInfo, TransportError> {
    let mut flags_buf = [0u8; 4];
    channel.read_fully(&mut flags_buf)?;
    let client_flags = u32::from_le_bytes(flags_buf);
    if client_flags != CLIENT_FLAGS {
        return Err(TransportError::HandshakeFailed(format!(
            "unknown client flags {client_flags:#x}"
        )));
    }

    channel.write_bytes(&puid.to_le_bytes())?;
    channel.flush()?;

    let mut checksum = ChecksumVersion::V0;
    loop {
        let frame = read_frame(channel, ChecksumVersion::V0)?;
        let mut reader = Reader::new(&frame.body);
        let command = VkCommand::decode(frame.header.opcode, &mut reader)
            .map_err(gstream_protocol::wire::WireError::from)?;

        match command {
            VkCommand::GetExtensions => {
                send_response(
                    channel,
                    frame.header.opcode,
                    &VkResponse::ExtensionList {
                        extensions: advertised.to_extension_string(),
                    },
                )?;
            }
            VkCommand::SetChecksumVersion { version } => {
                // v2+ formats are reserved; fall back to v1.
                checksum = match version {
                    0 => ChecksumVersion::V0,
                    _ => ChecksumVersion::V1,
                };
                send_response(channel, frame.header.opcode, &VkResponse::Ok)?;
                break;
            }
            other => {
                return Err(TransportError::HandshakeFailed(format!(
                    "API command {other:?} before handshake completed"
                )))
            }
        }
    }

    debug!(puid, ?checksum, "host session established");
    Ok(SessionInfo {
        puid,
        features: advertised,
        checksum,
    })
}

fn send_command(
    channel: &mut impl Channel,
    command: &VkCommand,
) -> Result<(), TransportError> {
    let mut writer = Writer::new();
    command.encode_body(&mut writer);
    write_frame(
        channel,
        command.opcode(),
        0,
        writer.as_bytes(),
        ChecksumVersion::V0,
    )?;
    channel.flush()
}

fn send_response(
    channel: &mut impl Channel,
    opcode: u32,
    response: &VkResponse,
) -> Result<(), TransportError> {
    let mut writer = Writer::new();
    response.encode_body(&mut writer);
    write_frame(channel, opcode, 0, writer.as_bytes(), ChecksumVersion::V0)?;
    channel.flush()
}

fn recv_response(
    channel: &mut impl Channel,
    expected_opcode: u32,
) -> Result<VkResponse, TransportError> {
    let frame = read_frame(channel, ChecksumVersion::V0)?;
    if frame.header.opcode != expected_opcode {
        return Err(TransportError::HandshakeFailed(format!(
            "reply opcode {:#x}, expected {expected_opcode:#x}",
            frame.header.opcode
        )));
    }
    let mut reader = Reader::new(&frame.body);
    let response =
        VkResponse::decode(&mut reader).map_err(gstream_protocol::wire::WireError::from)?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg_channel_pair_with_capacity;

    fn full_features() -> SessionFeatures {
        SessionFeatures::all()
    }

    #[test]
    fn puid_and_features_are_negotiated() {
        let (mut guest, mut host) = asg_channel_pair_with_capacity(16384);

        let host_thread = std::thread::spawn(move || {
            host_accept(&mut host, full_features(), 0xBEEF_CAFE).unwrap()
        });

        let session = guest_connect(&mut guest, full_features()).unwrap();
        let host_session = host_thread.join().expect("host panicked");

        assert_eq!(session.puid, 0xBEEF_CAFE);
        assert_eq!(host_session.puid, 0xBEEF_CAFE);
        assert_eq!(session.checksum, ChecksumVersion::V1);
        assert_eq!(host_session.checksum, ChecksumVersion::V1);
        assert!(session.features.contains(SessionFeatures::VULKAN));
    }

    #[test]
    fn checksum_falls_back_to_v0_when_host_lacks_it() {
        let (mut guest, mut host) = asg_channel_pair_with_capacity(16384);
        let advertised = SessionFeatures::VULKAN | SessionFeatures::DIRECT_MEM;

        let host_thread =
            std::thread::spawn(move || host_accept(&mut host, advertised, 1).unwrap());

        let session = guest_connect(&mut guest, full_features()).unwrap();
        let host_session = host_thread.join().expect("host panicked");

        assert_eq!(session.checksum, ChecksumVersion::V0);
        assert_eq!(host_session.checksum, ChecksumVersion::V0);
        assert!(!session.features.contains(SessionFeatures::CHECKSUM_V1));
    }

    #[test]
    fn api_traffic_before_handshake_is_rejected() {
        let (mut guest, mut host) = asg_channel_pair_with_capacity(16384);

        let host_thread =
            std::thread::spawn(move || host_accept(&mut host, full_features(), 2));

        guest.write_bytes(&CLIENT_FLAGS.to_le_bytes()).unwrap();
        guest.flush().unwrap();
        let mut puid = [0u8; 8];
        guest.read_fully(&mut puid).unwrap();

        // Skip the extension exchange and fire an API command.
        send_command(
            &mut guest,
            &VkCommand::DestroyInstance { instance: 42 },
        )
        .unwrap();

        assert!(matches!(
            host_thread.join().expect("host panicked"),
            Err(TransportError::HandshakeFailed(_))
        ));
    }
}
