//! Capability bits negotiated through the extension-string handshake.

use crate::wire::ChecksumVersion;

bitflags::bitflags! {
    /// Feature extensions a host may advertise. The guest intersects this
    /// set with its own support before any API traffic flows.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionFeatures: u32 {
        const CHECKSUM_V1          = 0b0000_0000_0001;
        const NATIVE_SYNC_V2       = 0b0000_0000_0010;
        const NATIVE_SYNC_V3       = 0b0000_0000_0100;
        const NATIVE_SYNC_V4       = 0b0000_0000_1000;
        const DMA_V1               = 0b0000_0001_0000;
        const GLES_MAX_V3          = 0b0000_0010_0000;
        const DIRECT_MEM           = 0b0000_0100_0000;
        const VULKAN               = 0b0000_1000_0000;
        const ASYNC_QUEUE_SUBMIT   = 0b0001_0000_0000;
        const ASYNC_QSRI           = 0b0010_0000_0000;
        const SHARED_SLOTS_HOST_MEMORY = 0b0100_0000_0000;
    }
}

const EXTENSION_TABLE: &[(SessionFeatures, &str)] = &[
    (SessionFeatures::CHECKSUM_V1, "GSTREAM_checksum_v1"),
    (SessionFeatures::NATIVE_SYNC_V2, "GSTREAM_native_sync_v2"),
    (SessionFeatures::NATIVE_SYNC_V3, "GSTREAM_native_sync_v3"),
    (SessionFeatures::NATIVE_SYNC_V4, "GSTREAM_native_sync_v4"),
    (SessionFeatures::DMA_V1, "GSTREAM_dma_v1"),
    (SessionFeatures::GLES_MAX_V3, "GSTREAM_gles_max_v3"),
    (SessionFeatures::DIRECT_MEM, "GSTREAM_direct_mem"),
    (SessionFeatures::VULKAN, "GSTREAM_vulkan"),
    (SessionFeatures::ASYNC_QUEUE_SUBMIT, "GSTREAM_async_queue_submit"),
    (SessionFeatures::ASYNC_QSRI, "GSTREAM_async_qsri"),
    (
        SessionFeatures::SHARED_SLOTS_HOST_MEMORY,
        "GSTREAM_shared_slots_host_memory",
    ),
];

impl SessionFeatures {
    /// Render as the space-separated ASCII extension list sent on the wire.
    pub fn to_extension_string(self) -> String {
        let mut out = String::new();
        for (flag, name) in EXTENSION_TABLE {
            if self.contains(*flag) {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(name);
            }
        }
        out
    }

    /// Parse an extension list; unknown tokens are ignored (narrow
    /// capability bits this build does not know about).
    pub fn from_extension_string(s: &str) -> Self {
        let mut features = SessionFeatures::empty();
        for token in s.split_ascii_whitespace() {
            if let Some((flag, _)) = EXTENSION_TABLE.iter().find(|(_, name)| *name == token) {
                features |= *flag;
            }
        }
        features
    }

    pub fn checksum_version(self) -> ChecksumVersion {
        if self.contains(SessionFeatures::CHECKSUM_V1) {
            ChecksumVersion::V1
        } else {
            ChecksumVersion::V0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_string_round_trip() {
        let features = SessionFeatures::VULKAN
            | SessionFeatures::DIRECT_MEM
            | SessionFeatures::CHECKSUM_V1;
        let s = features.to_extension_string();
        assert!(s.contains("GSTREAM_vulkan"));
        assert_eq!(SessionFeatures::from_extension_string(&s), features);
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let f = SessionFeatures::from_extension_string(
            "GSTREAM_vulkan GSTREAM_frobnicate_v9 GSTREAM_direct_mem",
        );
        assert_eq!(
            f,
            SessionFeatures::VULKAN | SessionFeatures::DIRECT_MEM
        );
    }

    #[test]
    fn checksum_selection() {
        assert_eq!(
            SessionFeatures::empty().checksum_version(),
            ChecksumVersion::V0
        );
        assert_eq!(
            SessionFeatures::CHECKSUM_V1.checksum_version(),
            ChecksumVersion::V1
        );
    }
}
