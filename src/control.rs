// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Control dispatcher: translates high-level command names into wire
//! messages, running as a sibling task of the frame pump over the same mux.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout as tokio_timeout;
use tracing::{info, warn};

use crate::error::{BridgeError, Result};
use crate::mux::IoctlMux;
use crate::wire::{self, CmdValue};

/// A queued command: a free-form topic plus an optional JSON payload.
#[derive(Debug, Clone)]
pub struct Command {
    pub topic: String,
    pub payload: Option<Value>,
}

/// Normalized reply posted on `cmd_out`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandReply {
    pub status: &'static str,
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl CommandReply {
    fn ok(response: String, value: Option<Value>) -> Self {
        CommandReply { status: "success", response: Some(response), value }
    }
    fn err(message: String) -> Self {
        CommandReply { status: "error", response: Some(message), value: None }
    }
}

const BOA_INTERVAL: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs while the session is authenticated; `preferred_bitrate` is shared
/// with the session so bitrate drift can be reconciled.
pub async fn run(
    mux: &IoctlMux,
    mut cmd_in: mpsc::Receiver<Command>,
    cmd_out: mpsc::Sender<(String, CommandReply)>,
    param_ids: &[u8],
    preferred_bitrate: &std::sync::atomic::AtomicU16,
) {
    loop {
        let next = tokio_timeout(BOA_INTERVAL, cmd_in.recv()).await;
        match next {
            Ok(Some(cmd)) => {
                let reply = dispatch(mux, &cmd, preferred_bitrate).await;
                if cmd_out.send((cmd.topic, reply)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break, // sender dropped: session tearing down
            Err(_) => {
                if let Err(e) = param_refresh(mux, param_ids, preferred_bitrate).await {
                    warn!(error = %e, "periodic param refresh failed");
                }
            }
        }
    }
}

async fn param_refresh(mux: &IoctlMux, param_ids: &[u8], preferred_bitrate: &std::sync::atomic::AtomicU16) -> Result<()> {
    let mut payload = vec![param_ids.len() as u8];
    payload.extend_from_slice(param_ids);
    let body = mux
        .send(wire::code::CHECK_CAMERA_INFO, Some(wire::code::CHECK_CAMERA_INFO + 1), &payload)
        .result(COMMAND_TIMEOUT)
        .await?;
    reconcile_bitrate(mux, &body, preferred_bitrate).await;
    Ok(())
}

/// Compare a reply's reported bitrate against the preferred value; on
/// mismatch, re-assert with SetResolving.
async fn reconcile_bitrate(mux: &IoctlMux, body: &[u8], preferred_bitrate: &std::sync::atomic::AtomicU16) {
    let Ok(parsed) = serde_json::from_slice::<Value>(body) else { return };
    let Some(reported) = parsed.get("bitrate").and_then(Value::as_u64) else { return };
    let preferred = preferred_bitrate.load(std::sync::atomic::Ordering::Relaxed) as u64;
    if reported != preferred {
        info!(reported, preferred, "bitrate drift detected, re-asserting SetResolving");
        let payload = [1u8, preferred as u8, 20];
        let _ = mux.send(wire::code::SET_RESOLVING, Some(0x01), &payload).result(COMMAND_TIMEOUT).await;
    }
}

async fn dispatch(mux: &IoctlMux, cmd: &Command, preferred_bitrate: &std::sync::atomic::AtomicU16) -> CommandReply {
    match cmd.topic.as_str() {
        "caminfo" => CommandReply::ok("camera_info".into(), None),
        "cruise_point" => cruise_point(mux, cmd).await,
        "bitrate" | "fps" if cmd.payload.is_some() => reframe(mux, cmd, preferred_bitrate).await,
        topic => match wire::lookup(topic) {
            Some(spec) => send_catalog_command(mux, spec, cmd.payload.as_ref()).await,
            None => CommandReply::err(format!("unknown command '{topic}'")),
        },
    }
}

async fn cruise_point(mux: &IoctlMux, cmd: &Command) -> CommandReply {
    let Some(index) = cmd.payload.as_ref().and_then(Value::as_i64) else {
        return CommandReply::err("cruise_point requires an integer index".into());
    };

    let list_result = mux
        .send(wire::code::GET_CRUISE_POINTS, Some(wire::code::GET_CRUISE_POINTS + 1), &[])
        .result(COMMAND_TIMEOUT)
        .await;
    let body = match list_result {
        Ok(b) => b,
        Err(e) => return CommandReply::err(e.to_string()),
    };

    let points: Vec<(i16, i16)> = match serde_json::from_slice::<Vec<Value>>(&body) {
        Ok(list) => list
            .iter()
            .filter_map(|p| {
                let h = p.get("horiz")?.as_i64()? as i16;
                let v = p.get("vert")?.as_i64()? as i16;
                Some((h, v))
            })
            .collect(),
        Err(e) => return CommandReply::err(format!("bad cruise points JSON: {e}")),
    };

    let selected_idx = pan_index(index, points.len());
    let Some(&(horiz, vert)) = points.get(selected_idx) else {
        return CommandReply::err(format!("cruise point index {index} out of range"));
    };

    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&vert.to_le_bytes());
    payload.extend_from_slice(&horiz.to_le_bytes());
    match mux
        .send(wire::code::SET_PTZ_POSITION, Some(wire::code::SET_PTZ_POSITION + 1), &payload)
        .result(COMMAND_TIMEOUT)
        .await
    {
        Ok(_) => CommandReply::ok("ok".into(), Some(json!({ "horiz": horiz, "vert": vert }))),
        Err(e) => CommandReply::err(e.to_string()),
    }
}

/// `points[i-1]` for `i > 0`, `points[i]` for `i <= 0`.
fn pan_index(requested: i64, len: usize) -> usize {
    let idx = if requested > 0 { requested - 1 } else { requested };
    idx.clamp(0, len.saturating_sub(1) as i64) as usize
}

async fn reframe(mux: &IoctlMux, cmd: &Command, preferred_bitrate: &std::sync::atomic::AtomicU16) -> CommandReply {
    let Some(value) = cmd.payload.as_ref().and_then(Value::as_u64) else {
        return CommandReply::err("missing numeric payload".into());
    };
    if cmd.topic == "bitrate" {
        preferred_bitrate.store(value as u16, std::sync::atomic::Ordering::Relaxed);
    }
    let payload = [1u8, value as u8, 20];
    match mux.send(wire::code::SET_RESOLVING, Some(0x01), &payload).result(COMMAND_TIMEOUT).await {
        Ok(_) => CommandReply::ok("ok".into(), Some(json!(value))),
        Err(e) => CommandReply::err(e.to_string()),
    }
}

async fn send_catalog_command(mux: &IoctlMux, spec: wire::CommandSpec, payload: Option<&Value>) -> CommandReply {
    let body = encode_payload(payload);
    let result = mux.send(spec.code, spec.response_code, &body).result(COMMAND_TIMEOUT).await;
    match result {
        Ok(bytes) => CommandReply::ok(normalize_response(&bytes), None),
        Err(e) => CommandReply::err(e.to_string()),
    }
}

fn encode_payload(payload: Option<&Value>) -> Vec<u8> {
    match payload {
        None => Vec::new(),
        Some(Value::String(s)) => match wire::resolve_cmd_value(s) {
            Some(CmdValue::Int(v)) => vec![v as u8],
            Some(CmdValue::Degrees(h, v)) => {
                let mut b = Vec::with_capacity(4);
                b.extend_from_slice(&h.to_le_bytes());
                b.extend_from_slice(&v.to_le_bytes());
                b
            }
            None => s.as_bytes().to_vec(),
        },
        Some(Value::Number(n)) => vec![n.as_u64().unwrap_or(0) as u8],
        Some(other) => other.to_string().into_bytes(),
    }
}

/// Bytes become a comma-joined decimal string; a digit string becomes an
/// integer echoed back as text.
fn normalize_response(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
            return text.parse::<u64>().map(|v| v.to_string()).unwrap_or_else(|_| text.to_string());
        }
    }
    bytes.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cruise_point_boundary_indexing() {
        assert_eq!(pan_index(0, 5), 0);
        assert_eq!(pan_index(1, 5), 0);
        assert_eq!(pan_index(2, 5), 1);
    }

    #[test]
    fn normalize_bytes_to_csv() {
        assert_eq!(normalize_response(&[1, 2, 3]), "1,2,3");
    }

    #[test]
    fn normalize_digit_string_to_int() {
        assert_eq!(normalize_response(b"042"), "42");
    }

    #[tokio::test]
    async fn unknown_topic_reports_error_without_interrupting() {
        let mock = std::sync::Arc::new(crate::transport::mock::MockAvTransport::default());
        let mux = IoctlMux::start(mock, 1);
        let reply = dispatch(&mux, &Command { topic: "bogus".into(), payload: None }, &std::sync::atomic::AtomicU16::new(120))
            .await;
        assert_eq!(reply.status, "error");
    }
}
