use serde::{Deserialize, Serialize};

/// Top-level gstream configuration, loaded from gstream.toml.
/// Everything here has a working default; the file is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GstreamConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport mode; overridden by the GFXSTREAM_TRANSPORT environment
    /// variable when set.
    #[serde(default)]
    pub kind: TransportKind,
    /// Address for the tcp transport (test-harness mode).
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: String,
    /// Enable the v1 frame checksum when the host offers it.
    #[serde(default = "default_true")]
    pub checksum: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Host-visible heap carved per memory type, bytes.
    #[serde(default = "default_heap_size")]
    pub virtual_host_visible_heap_size: u64,
    /// In-flight frame cap; bounds the fence pool.
    #[serde(default = "default_in_flight_frames")]
    pub in_flight_frames: usize,
}

/// Transport selection, matching the GFXSTREAM_TRANSPORT descriptor values.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportKind {
    /// Ring transport layered on virtio-gpu (default when Vulkan is in play).
    #[default]
    #[serde(rename = "virtio-gpu-asg")]
    VirtioGpuAsg,
    /// One-shot pipe layered on virtio-gpu.
    #[serde(rename = "virtio-gpu-pipe")]
    VirtioGpuPipe,
    /// Bare address-space ring.
    #[serde(rename = "asg")]
    Asg,
    /// Bare pipe.
    #[serde(rename = "pipe")]
    Pipe,
    /// TCP loopback, test-harness mode.
    #[serde(rename = "tcp")]
    Tcp,
}

impl TransportKind {
    pub fn from_descriptor(s: &str) -> Option<Self> {
        match s {
            "virtio-gpu-asg" => Some(TransportKind::VirtioGpuAsg),
            "virtio-gpu-pipe" => Some(TransportKind::VirtioGpuPipe),
            "asg" => Some(TransportKind::Asg),
            "pipe" => Some(TransportKind::Pipe),
            "tcp" => Some(TransportKind::Tcp),
            _ => None,
        }
    }
}

impl Default for GstreamConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            tcp_addr: default_tcp_addr(),
            checksum: true,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            virtual_host_visible_heap_size: default_heap_size(),
            in_flight_frames: default_in_flight_frames(),
        }
    }
}

impl GstreamConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, crate::error::CoreError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| crate::error::CoreError::ConfigError(e.to_string()))
    }

    /// Load configuration from file if it exists, otherwise return defaults,
    /// then apply environment overrides.
    pub fn load_or_default(path: &str) -> Self {
        let mut config = Self::load(path).unwrap_or_default();
        config.apply_env();
        config
    }

    /// GFXSTREAM_TRANSPORT selects the transport descriptor.
    pub fn apply_env(&mut self) {
        if let Ok(descriptor) = std::env::var("GFXSTREAM_TRANSPORT") {
            if let Some(kind) = TransportKind::from_descriptor(&descriptor) {
                self.transport.kind = kind;
            }
        }
    }
}

fn default_tcp_addr() -> String {
    "127.0.0.1:7531".to_string()
}

fn default_heap_size() -> u64 {
    512 * 1024 * 1024
}

fn default_in_flight_frames() -> usize {
    3
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GstreamConfig::default();
        assert_eq!(config.transport.kind, TransportKind::VirtioGpuAsg);
        assert_eq!(
            config.memory.virtual_host_visible_heap_size,
            512 * 1024 * 1024
        );
        assert!(config.transport.checksum);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: GstreamConfig = toml::from_str(
            r#"
            [transport]
            kind = "tcp"
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.kind, TransportKind::Tcp);
        assert_eq!(config.memory.in_flight_frames, 3);
    }

    #[test]
    fn config_loads_from_a_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[memory]\nvirtual_host_visible_heap_size = 1048576\nin_flight_frames = 2"
        )
        .unwrap();

        let config = GstreamConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.memory.virtual_host_visible_heap_size, 1 << 20);
        assert_eq!(config.memory.in_flight_frames, 2);

        let missing = GstreamConfig::load_or_default("/nonexistent/gstream.toml");
        assert_eq!(missing.memory.in_flight_frames, 3);
    }

    #[test]
    fn descriptor_parsing() {
        let known = [
            ("virtio-gpu-asg", TransportKind::VirtioGpuAsg),
            ("virtio-gpu-pipe", TransportKind::VirtioGpuPipe),
            ("asg", TransportKind::Asg),
            ("pipe", TransportKind::Pipe),
            ("tcp", TransportKind::Tcp),
        ];
        for (descriptor, kind) in known {
            assert_eq!(TransportKind::from_descriptor(descriptor), Some(kind));
        }
        assert_eq!(TransportKind::from_descriptor("bogus"), None);
    }
}
