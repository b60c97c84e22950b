// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Session engine: drives a single camera-stream from disconnected through
//! authenticated and streaming, and owns the transport handle, mux, and
//! per-stream command queues.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::model::{Camera, FrameSize, SessionInfo, SessionMode, StreamOptions};
use crate::mux::IoctlMux;
use crate::transport::{resend_flag_for_model, AvTransport};
use crate::wire;

/// Internal connect/authenticate phase, logged but not externally reported
/// (the externally-visible variable is [`crate::model::StreamState`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Disconnected,
    IotcConnecting,
    ConnectingFailed,
    AvConnecting,
    Connected,
    AuthenticationSucceeded,
    AuthenticationFailed,
}

/// Per-camera network-mode policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetModePolicy {
    #[default]
    Any,
    P2pOnly,
    LanOnly,
}

impl NetModePolicy {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "lan" => NetModePolicy::LanOnly,
            "p2p" => NetModePolicy::P2pOnly,
            _ => NetModePolicy::Any,
        }
    }

    fn allows(self, mode: SessionMode) -> bool {
        match self {
            NetModePolicy::Any => true,
            NetModePolicy::P2pOnly => mode == SessionMode::P2p,
            NetModePolicy::LanOnly => mode == SessionMode::Lan,
        }
    }
}

/// A live, authenticated session: transport handle, ids, mux, and the
/// camera_info JSON returned by the device during authentication.
pub struct Session {
    pub camera: Camera,
    pub transport: Arc<dyn AvTransport>,
    pub session_id: i32,
    pub channel_id: i32,
    pub mux: IoctlMux,
    pub session_info: SessionInfo,
    pub camera_info: Value,
    pub phase: ConnectPhase,
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    #[serde(rename = "connectionRes")]
    connection_res: String,
    #[serde(flatten)]
    rest: Value,
}

impl Session {
    /// Run §4.D's connect sequence against `camera`, returning once CONNECTED
    /// (internal phase) or failing with [`ConnectPhase::ConnectingFailed`].
    pub async fn connect(transport: Arc<dyn AvTransport>, camera: Camera, net_mode: NetModePolicy) -> Result<Session> {
        let t = transport.clone();
        let cam = camera.clone();
        let session_id = tokio::task::spawn_blocking(move || t.connect(&cam.p2p_id, cam.dtls, &cam.enr, &cam.mac))
            .await
            .map_err(|e| BridgeError::Protocol(e.to_string()))??;

        let t = transport.clone();
        let session_info = tokio::task::spawn_blocking(move || t.session_check(session_id))
            .await
            .map_err(|e| BridgeError::Protocol(e.to_string()))??;

        if !net_mode.allows(session_info.mode) {
            return Err(BridgeError::Policy {
                uri: camera.nickname.clone(),
                reason: format!("camera connected via {:?} but policy requires {net_mode:?}", session_info.mode),
            });
        }

        let resend = resend_flag_for_model(&camera.product_model);
        let password = if camera.dtls { camera.enr.clone() } else { "888888".to_string() };
        let t = transport.clone();
        let channel_id = tokio::task::spawn_blocking(move || t.av_start(session_id, "admin", &password, resend, 10_000))
            .await
            .map_err(|e| BridgeError::Protocol(e.to_string()))??;

        let t = transport.clone();
        tokio::task::spawn_blocking(move || t.av_clean_buf(channel_id))
            .await
            .map_err(|e| BridgeError::Protocol(e.to_string()))??;

        info!(camera = camera.nickname, session_id, channel_id, mode = ?session_info.mode, "session connected");

        let mux = IoctlMux::start(transport.clone(), channel_id);

        Ok(Session {
            camera,
            transport,
            session_id,
            channel_id,
            mux,
            session_info,
            camera_info: Value::Null,
            phase: ConnectPhase::Connected,
        })
    }

    /// Run §4.D's authenticate sequence: wake (for battery cams), challenge
    /// response, SetResolving handshake.
    pub async fn authenticate(&mut self, preferred: &StreamOptions, timeout: std::time::Duration) -> Result<()> {
        let wake_payload = if self.camera.product_model == "WYZEDB3" || self.camera.product_model == "WVOD1" {
            serde_json::json!({ "cameraInfo": { "mac": self.camera.mac, "encFlag": 0, "wakeupFlag": 1 } })
                .to_string()
                .into_bytes()
        } else {
            Vec::new()
        };

        self.mux
            .send(wire::code::CONNECT_REQUEST, None, &wake_payload)
            .result(timeout)
            .await?;

        let challenge_fut = self.mux.send(wire::code::CONNECT_CHALLENGE, Some(wire::code::CONNECT_CHALLENGE), &[]);
        let challenge_data = challenge_fut.result(timeout).await?;
        let response = wire::respond_to_challenge(&challenge_data, &self.camera.enr)?;

        let use_user_auth = wire::supports_user_auth(&self.camera.product_model, &self.camera.firmware_version);
        let connect_response = if use_user_auth {
            let mut payload = response.to_vec();
            let phone_prefix: Vec<u8> = self.camera.mac.as_bytes().iter().take(4).copied().collect();
            payload.extend_from_slice(&phone_prefix);
            payload.push(1); // open video
            payload.push(u8::from(preferred.audio)); // open audio
            self.mux
                .send(wire::code::CONNECT_USER_AUTH, Some(wire::code::CONNECT_USER_AUTH_RESP), &payload)
                .result(timeout)
                .await?
        } else {
            let mut payload = response.to_vec();
            let mac_prefix: Vec<u8> = self.camera.mac.as_bytes().iter().take(4).copied().collect();
            payload.extend_from_slice(&mac_prefix);
            payload.push(1);
            payload.push(u8::from(preferred.audio));
            self.mux
                .send(wire::code::CONNECT_AUTH, Some(wire::code::CONNECT_AUTH_RESP), &payload)
                .result(timeout)
                .await?
        };

        let parsed: ConnectResponse = serde_json::from_slice(&connect_response)
            .map_err(|e| BridgeError::Protocol(format!("bad connect response JSON: {e}")))?;
        if parsed.connection_res != "1" {
            self.phase = ConnectPhase::AuthenticationFailed;
            return Err(BridgeError::Protocol(format!("connectionRes={}", parsed.connection_res)));
        }
        self.camera_info = parsed.rest;

        self.send_resolving(preferred, timeout).await?;

        self.phase = ConnectPhase::AuthenticationSucceeded;
        debug!(camera = self.camera.nickname, "authentication succeeded");
        Ok(())
    }

    /// Send the model-appropriate SetResolving message and wait for its ack.
    pub async fn send_resolving(&self, opts: &StreamOptions, timeout: std::time::Duration) -> Result<()> {
        let is_doorbell_family = matches!(opts.frame_size, FrameSize::DoorbellHd | FrameSize::DoorbellSd)
            || self.camera.capabilities().is_vertical_doorbell;

        if is_doorbell_family {
            let payload = [
                opts.bitrate as u8,
                0,
                1 + opts.frame_size.wire_value(),
                20, // fps
                0,
                0,
            ];
            self.mux.send(wire::code::DB_SET_RESOLVING, Some(0x01), &payload).result(timeout).await?;
        } else {
            let payload = [1 + opts.frame_size.wire_value(), opts.bitrate as u8, 20];
            self.mux.send(wire::code::SET_RESOLVING, Some(0x01), &payload).result(timeout).await?;
        }
        Ok(())
    }

    /// Stop AV, stop the session, close it. Idempotent.
    pub async fn disconnect(&mut self) {
        self.mux.shutdown().await;
        let t = self.transport.clone();
        let channel_id = self.channel_id;
        let _ = tokio::task::spawn_blocking(move || t.stop_av(channel_id)).await;
        let t = self.transport.clone();
        let session_id = self.session_id;
        let _ = tokio::task::spawn_blocking(move || t.close_session(session_id)).await;
        self.phase = ConnectPhase::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionMode;

    #[test]
    fn net_mode_policy_matches_mode() {
        assert!(NetModePolicy::Any.allows(SessionMode::Relay));
        assert!(NetModePolicy::LanOnly.allows(SessionMode::Lan));
        assert!(!NetModePolicy::LanOnly.allows(SessionMode::Relay));
        assert!(NetModePolicy::P2pOnly.allows(SessionMode::P2p));
        assert!(!NetModePolicy::P2pOnly.allows(SessionMode::Lan));
    }

    #[test]
    fn net_mode_parse() {
        assert_eq!(NetModePolicy::parse("LAN"), NetModePolicy::LanOnly);
        assert_eq!(NetModePolicy::parse("p2p"), NetModePolicy::P2pOnly);
        assert_eq!(NetModePolicy::parse("anything-else"), NetModePolicy::Any);
    }
}


