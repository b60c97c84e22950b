// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! On-disk bridge configuration: native library search paths, cloud
//! credentials, global stream defaults, and a per-camera override list.
//! Environment overrides (`X_<URI>`/`X_ALL`) are layered on top by the
//! caller via [`crate::envcfg`] once the camera list is known.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{BridgeError, Result};
use crate::model::FrameSize;
use crate::supervisor::StreamPolicy;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    #[serde(default)]
    pub native_library: NativeLibraryConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub defaults: StreamDefaultsConfig,
    /// Per-camera overrides keyed by nickname or mac; cameras not listed
    /// here still stream with `defaults` once discovered via the cloud
    /// collaborator.
    #[serde(default)]
    pub cameras: Vec<CameraOverride>,
    #[serde(default)]
    pub relay: RelayConfigSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NativeLibraryConfig {
    #[serde(default)]
    pub search_paths: Vec<String>,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_max_channels")]
    pub max_channels: u32,
    #[serde(default)]
    pub license_key: String,
}

impl Default for NativeLibraryConfig {
    fn default() -> Self {
        NativeLibraryConfig {
            search_paths: Vec::new(),
            udp_port: default_udp_port(),
            max_channels: default_max_channels(),
            license_key: String::new(),
        }
    }
}

fn default_udp_port() -> u16 {
    0
}
fn default_max_channels() -> u32 {
    32
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CloudConfig {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub fresh_data: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamDefaultsConfig {
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default = "default_record")]
    pub record: bool,
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub net_mode: String,
    #[serde(default = "default_max_noready")]
    pub max_noready: u32,
    #[serde(default = "default_max_badres")]
    pub max_badres: u32,
    #[serde(default)]
    pub ignore_offline: bool,
}

impl Default for StreamDefaultsConfig {
    fn default() -> Self {
        StreamDefaultsConfig {
            quality: None,
            record: default_record(),
            audio: false,
            net_mode: String::new(),
            max_noready: default_max_noready(),
            max_badres: default_max_badres(),
            ignore_offline: false,
        }
    }
}

fn default_record() -> bool {
    true
}
fn default_max_noready() -> u32 {
    100
}
fn default_max_badres() -> u32 {
    100
}

/// Per-camera TOML overrides; `id` matches either a nickname or a mac
/// address as listed by the cloud collaborator.
#[derive(Debug, Deserialize, Clone)]
pub struct CameraOverride {
    pub id: String,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub record: Option<bool>,
    #[serde(default)]
    pub audio: Option<bool>,
    #[serde(default)]
    pub net_mode: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfigSettings {
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub event_pipe_path: Option<PathBuf>,
    /// RTSP port the media relay listens on; each stream's ffmpeg sink
    /// pushes to `rtsp://127.0.0.1:<rtsp_port>/<uri>`.
    #[serde(default = "default_rtsp_port")]
    pub rtsp_port: u16,
}

impl Default for RelayConfigSettings {
    fn default() -> Self {
        RelayConfigSettings { config_path: None, event_pipe_path: None, rtsp_port: default_rtsp_port() }
    }
}

fn default_rtsp_port() -> u16 {
    8554
}

impl BridgeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| BridgeError::Config(format!("cannot read config file: {e}")))?;
        let config: BridgeConfig = toml::from_str(&content).map_err(|e| BridgeError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.native_library.max_channels == 0 {
            return Err(BridgeError::Config("max_channels must be > 0".into()));
        }
        for cam in &self.cameras {
            if cam.id.trim().is_empty() {
                return Err(BridgeError::Config("camera override missing 'id'".into()));
            }
        }
        Ok(())
    }

    /// Find an override entry matching a nickname or mac.
    pub fn override_for(&self, nickname: &str, mac: &str) -> Option<&CameraOverride> {
        self.cameras.iter().find(|c| c.id.eq_ignore_ascii_case(nickname) || c.id.eq_ignore_ascii_case(mac))
    }
}

/// Build the effective per-stream policy by layering a [`CameraOverride`]
/// (if any) over the global defaults.
pub fn resolve_policy(defaults: &StreamDefaultsConfig, over: Option<&CameraOverride>, rtsp_port: u16) -> StreamPolicy {
    let net_mode_str = over.and_then(|o| o.net_mode.clone()).unwrap_or_else(|| defaults.net_mode.clone());
    StreamPolicy {
        net_mode: crate::session::NetModePolicy::parse(&net_mode_str),
        ignore_offline: defaults.ignore_offline,
        offline_cooldown: std::time::Duration::from_secs(10),
        max_noready: defaults.max_noready,
        max_badres: defaults.max_badres,
        rtsp_port,
    }
}

/// Build the effective stream options, applying the override's quality
/// string (or the default one) via [`crate::model::StreamOptions::apply_quality`].
pub fn resolve_options(defaults: &StreamDefaultsConfig, over: Option<&CameraOverride>) -> crate::model::StreamOptions {
    let mut options = crate::model::StreamOptions {
        record: over.and_then(|o| o.record).unwrap_or(defaults.record),
        audio: over.and_then(|o| o.audio).unwrap_or(defaults.audio),
        frame_size: FrameSize::Hd,
        ..Default::default()
    };
    if let Some(quality) = over.and_then(|o| o.quality.clone()).or_else(|| defaults.quality.clone()) {
        options.apply_quality(&quality);
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[native_library]\nmax_channels = 8\n").unwrap();
        let cfg = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.native_library.max_channels, 8);
    }

    #[test]
    fn rejects_blank_camera_id() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[cameras]]\nid = \"\"\n").unwrap();
        assert!(BridgeConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn override_resolution_prefers_override_quality() {
        let defaults = StreamDefaultsConfig { quality: Some("HD120".into()), ..Default::default() };
        let over = CameraOverride { id: "cam1".into(), quality: Some("SD60".into()), record: None, audio: None, net_mode: None };
        let options = resolve_options(&defaults, Some(&over));
        assert_eq!(options.bitrate, 60);
    }
}
