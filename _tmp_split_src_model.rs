// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Shared data model: camera descriptors, stream options/state, session info,
//! frame headers, and the small derived tables (model labels, capability
//! bits) used across the bridge.

use std::sync::atomic::{AtomicI32, Ordering};

use serde::{Deserialize, Serialize};

/// Opaque cloud credential plus any in-flight MFA state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    pub phone_id: String,
    #[serde(default)]
    pub mfa: Option<MfaState>,
}

/// MFA challenge in progress; cleared once a code is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaState {
    pub kind: String,
    pub verification_id: String,
    pub code: Option<String>,
}

/// Product model code → human label, mirroring the fixed lookup table the
/// original bridge prints in its startup banner.
pub fn model_label(product_model: &str) -> &'static str {
    match product_model {
        "WYZECP1_JEF" => "PAN",
        "WYZEC1" => "V1",
        "WYZEC1-JZ" => "V2",
        "WYZE_CAKP2JFUS" => "V3",
        "WYZEDB3" => "DOORBELL",
        "WVOD1" => "OUTDOOR",
        _ => "UNKNOWN",
    }
}

/// Capability bits derived from the product model code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub supports_2k: bool,
    pub is_pan: bool,
    pub is_vertical_doorbell: bool,
    pub supports_substream: bool,
    pub supports_native_rtsp: bool,
}

impl ModelCapabilities {
    pub fn for_model(product_model: &str) -> Self {
        match product_model {
            "WYZECP1_JEF" => ModelCapabilities { is_pan: true, supports_substream: true, ..Default::default() },
            "WYZEDB3" => ModelCapabilities { is_vertical_doorbell: true, ..Default::default() },
            "WYZE_CAKP2JFUS" => ModelCapabilities {
                supports_2k: true,
                supports_substream: true,
                supports_native_rtsp: true,
                ..Default::default()
            },
            _ => ModelCapabilities { supports_substream: true, ..Default::default() },
        }
    }
}

/// Stable identifiers for a single camera, as listed by the cloud collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    /// ASCII peer identifier, <= 20 chars.
    pub p2p_id: String,
    /// 12 hex characters, no separators.
    pub mac: String,
    pub product_model: String,
    pub firmware_version: String,
    pub dtls: bool,
    pub parent_mac: Option<String>,
    /// >= 16 ASCII chars, 32 if `dtls`.
    pub enr: String,
    pub nickname: String,
    pub last_ip: Option<String>,
}

impl Camera {
    /// Slugified, lowercase, ASCII name used by the media relay as a path.
    pub fn uri_name(&self, separator: char) -> String {
        self.nickname
            .trim()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { separator })
            .collect::<String>()
    }

    pub fn model_label(&self) -> &'static str {
        model_label(&self.product_model)
    }

    pub fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::for_model(&self.product_model)
    }
}

/// Requested frame size. Doorbell variants report resolution on a shifted
/// numeric scale from the standard HD/SD pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameSize {
    Hd,
    Sd,
    DoorbellHd,
    DoorbellSd,
}

impl FrameSize {
    /// Numeric value sent on the wire (bytes 0 of the SetResolving payload,
    /// biased by +1 per the wire codec's `1+frame_size` convention).
    pub fn wire_value(self) -> u8 {
        match self {
            FrameSize::Hd => 0,
            FrameSize::Sd => 1,
            FrameSize::DoorbellHd => 3,
            FrameSize::DoorbellSd => 4,
        }
    }
}

/// Mutable and immutable stream parameters.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub substream: bool,
    pub record: bool,
    pub audio: bool,
    pub frame_size: FrameSize,
    /// KB/s, 1-255.
    pub bitrate: u16,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions { substream: false, record: false, audio: false, frame_size: FrameSize::Hd, bitrate: 120 }
    }
}

impl StreamOptions {
    /// Parse the `QUALITY=<HD|SD><bitrate>` environment convention.
    /// `SD0` (bitrate out of [1,255]) falls back to the default bitrate.
    pub fn apply_quality(&mut self, quality: &str) {
        let upper = quality.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("SD") {
            self.frame_size = FrameSize::Sd;
            self.apply_bitrate_digits(rest);
        } else if let Some(rest) = upper.strip_prefix("HD") {
            self.frame_size = FrameSize::Hd;
            self.apply_bitrate_digits(rest);
        }
    }

    fn apply_bitrate_digits(&mut self, digits: &str) {
        if let Ok(v) = digits.parse::<u32>() {
            if (1..=255).contains(&v) {
                self.bitrate = v as u16;
            }
        }
    }
}

/// The state machine variable. Integer codes are preserved verbatim for
/// external reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StreamState {
    Offline = -90,
    Stopping = -1,
    Disabled = 0,
    Stopped = 1,
    Connecting = 2,
    Connected = 3,
}

impl StreamState {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -90 => Some(StreamState::Offline),
            -1 => Some(StreamState::Stopping),
            0 => Some(StreamState::Disabled),
            1 => Some(StreamState::Stopped),
            2 => Some(StreamState::Connecting),
            3 => Some(StreamState::Connected),
            _ => None,
        }
    }
}

/// Transient transport codes a retry policy may need to inspect. Not part of
/// the state machine itself.
pub const TRANSIENT_RETRY_CODES: [i32; 4] = [-10, -13, -19, -68];

/// A stream's externally-observable state, safely readable without locking.
pub struct AtomicStreamState(AtomicI32);

impl AtomicStreamState {
    pub fn new(initial: StreamState) -> Self {
        AtomicStreamState(AtomicI32::new(initial.code()))
    }

    pub fn load(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn store(&self, state: StreamState) {
        self.0.store(state.code(), Ordering::Release)
    }

    pub fn store_code(&self, code: i32) {
        self.0.store(code, Ordering::Release)
    }
}

/// P2P session transport mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    P2p,
    Relay,
    Lan,
}

impl SessionMode {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(SessionMode::P2p),
            1 => Some(SessionMode::Relay),
            2 => Some(SessionMode::Lan),
            _ => None,
        }
    }
}

/// Populated once a session authenticates successfully.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub mode: SessionMode,
    pub remote_ip: String,
    pub wan_ip: String,
    pub wan_port: u16,
    pub local_nat_type: u8,
    pub remote_nat_type: u8,
    /// Video codec id: 75/78 => H.264, 80 => H.265.
    pub video_codec_id: u16,
    pub nominal_framerate: u8,
    pub dtls: bool,
    pub wifi_signal: Option<u8>,
    /// Low bits are not documented upstream; carried opaquely for logging.
    pub net_state: u32,
}

impl SessionInfo {
    pub fn codec_name(&self) -> &'static str {
        match self.video_codec_id {
            75 | 78 => "h264",
            80 => "h265",
            _ => "unknown",
        }
    }
}

/// Two wire layouts exist; distinguished by the reported struct length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeaderLayout {
    Standard32,
    Extended40,
}

/// Per-frame record returned alongside compressed frame bytes.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub codec_id: u16,
    pub is_keyframe: bool,
    pub frame_size: u8,
    pub bitrate: u8,
    pub framerate: u8,
    pub frame_no: u32,
    pub timestamp_secs: u32,
    pub timestamp_ms: u32,
    pub frame_len: u32,
    pub layout: FrameHeaderLayout,
}

/// Per-camera snapshot bookkeeping for the RTSP snapshot pass.
#[derive(Debug, Clone, Default)]
pub struct SnapshotRecord {
    pub last_rtsp_snapshot: Option<chrono::DateTime<chrono::Utc>>,
    pub last_camera_photo: Option<(String, chrono::DateTime<chrono::Utc>)>,
    pub cooldown_deadline: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_boundaries() {
        let mut opts = StreamOptions::default();
        opts.apply_quality("HD30");
        assert_eq!(opts.frame_size, FrameSize::Hd);
        assert_eq!(opts.bitrate, 30);

        let mut opts = StreamOptions::default();
        opts.apply_quality("SD240");
        assert_eq!(opts.frame_size, FrameSize::Sd);
        assert_eq!(opts.bitrate, 240);

        let mut opts = StreamOptions::default();
        opts.apply_quality("SD0");
        assert_eq!(opts.frame_size, FrameSize::Sd);
        assert_eq!(opts.bitrate, 120, "out-of-range bitrate keeps the default");
    }

    #[test]
    fn model_labels() {
        assert_eq!(model_label("WYZEDB3"), "DOORBELL");
        assert_eq!(model_label("WYZECP1_JEF"), "PAN");
        assert_eq!(model_label("nonsense"), "UNKNOWN");
    }

    #[test]
    fn state_round_trip() {
        for s in [
            StreamState::Offline,
            StreamState::Stopping,
            StreamState::Disabled,
            StreamState::Stopped,
            StreamState::Connecting,
            StreamState::Connected,
        ] {
            assert_eq!(StreamState::from_code(s.code()), Some(s));
        }
    }
}


