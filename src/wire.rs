// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Wire protocol codec: the 16-byte framed header, the command catalog, the
//! XXTEA cipher, and the connect-time challenge/response procedure.

use std::collections::HashMap;
use std::sync::OnceLock;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{BridgeError, Result};

pub const HEADER_LEN: usize = 16;
const PREFIX: [u8; 2] = *b"HL";
const PROTOCOL_VERSION: u16 = 1;

/// Decoded 16-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol: u16,
    pub code: u16,
    pub payload_len: u16,
}

/// Encode a control message: 2-byte prefix, protocol, code, payload length,
/// 8 reserved bytes, followed by the raw payload.
pub fn encode(code: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&PREFIX);
    buf.write_u16::<LittleEndian>(PROTOCOL_VERSION).expect("vec write");
    buf.write_u16::<LittleEndian>(code).expect("vec write");
    buf.write_u16::<LittleEndian>(payload.len() as u16).expect("vec write");
    buf.extend_from_slice(&[0u8; 8]);
    buf.extend_from_slice(payload);
    buf
}

/// Decode a framed message, returning the header and a slice of the payload.
pub fn decode(buf: &[u8]) -> Result<(Header, &[u8])> {
    if buf.len() < HEADER_LEN {
        return Err(BridgeError::Protocol(format!("message too short: {} bytes", buf.len())));
    }
    if buf[0..2] != PREFIX {
        return Err(BridgeError::Protocol("bad prefix".into()));
    }
    let mut cursor = &buf[2..8];
    let protocol = cursor.read_u16::<LittleEndian>().unwrap();
    let code = cursor.read_u16::<LittleEndian>().unwrap();
    let payload_len = cursor.read_u16::<LittleEndian>().unwrap();
    if payload_len as usize + HEADER_LEN != buf.len() {
        return Err(BridgeError::Protocol(format!(
            "length mismatch: header says {}, have {}",
            payload_len as usize + HEADER_LEN,
            buf.len()
        )));
    }
    Ok((Header { protocol, code, payload_len }, &buf[HEADER_LEN..]))
}

/// Command codes used by the catalog below.
pub mod code {
    pub const CONNECT_REQUEST: u16 = 10000;
    pub const CONNECT_CHALLENGE: u16 = 10001;
    pub const CONNECT_AUTH: u16 = 10002;
    pub const CONNECT_AUTH_RESP: u16 = 10003;
    pub const CONNECT_USER_AUTH: u16 = 10008;
    pub const CONNECT_USER_AUTH_RESP: u16 = 10009;
    pub const CHECK_CAMERA_INFO: u16 = 10020;
    pub const GET_VIDEO_PARAM: u16 = 10050;
    pub const DB_SET_RESOLVING: u16 = 10052;
    pub const SET_RESOLVING: u16 = 10056;
    pub const TAKE_PHOTO: u16 = 10058;
    pub const START_BOA: u16 = 10148;
    pub const GET_NETWORK_LIGHT: u16 = 10030;
    pub const SET_NETWORK_LIGHT: u16 = 10032;
    pub const GET_NIGHT_VISION: u16 = 10040;
    pub const SET_NIGHT_VISION: u16 = 10042;
    pub const GET_IRLED: u16 = 10044;
    pub const SET_IRLED: u16 = 10046;
    pub const GET_CAMERA_TIME: u16 = 10090;
    pub const SET_CAMERA_TIME: u16 = 10092;
    pub const GET_MOTION_TAGGING: u16 = 10290;
    pub const SET_MOTION_TAGGING: u16 = 10292;
    pub const SET_RTSP_SWITCH: u16 = 10600;
    pub const GET_RTSP_PARAM: u16 = 10604;
    pub const GET_NIGHT_SWITCH: u16 = 10624;
    pub const SET_NIGHT_SWITCH: u16 = 10626;
    pub const GET_ALARM_FLASHING: u16 = 10632;
    pub const SET_ALARM_FLASHING: u16 = 10630;
    pub const SET_ROTARY_BY_DEGREE: u16 = 11000;
    pub const SET_ROTARY_BY_ACTION: u16 = 11002;
    pub const RESET_ROTATE_POSITION: u16 = 11004;
    pub const GET_CRUISE_POINTS: u16 = 11010;
    pub const SET_CRUISE: u16 = 11016;
    pub const SET_PTZ_POSITION: u16 = 11018;
    pub const GET_MOTION_TRACKING: u16 = 11020;
}

/// A catalog entry: the request code, the code its response arrives on (by
/// the request-is-even/response-is-request+1 convention, except for a few
/// legacy pairs listed explicitly), and a human name used by the control
/// dispatcher's command-name lookup.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub code: u16,
    pub response_code: Option<u16>,
}

fn catalog() -> &'static HashMap<&'static str, CommandSpec> {
    static CATALOG: OnceLock<HashMap<&'static str, CommandSpec>> = OnceLock::new();
    CATALOG.get_or_init(|| {
        use code::*;
        let entries = [
            CommandSpec { name: "take_photo", code: TAKE_PHOTO, response_code: None },
            CommandSpec { name: "irled", code: GET_IRLED, response_code: Some(GET_IRLED + 1) },
            CommandSpec { name: "set_irled", code: SET_IRLED, response_code: Some(SET_IRLED + 1) },
            CommandSpec { name: "night_vision", code: GET_NIGHT_VISION, response_code: Some(GET_NIGHT_VISION + 1) },
            CommandSpec { name: "set_night_vision", code: SET_NIGHT_VISION, response_code: Some(SET_NIGHT_VISION + 1) },
            CommandSpec { name: "status_light", code: GET_NETWORK_LIGHT, response_code: Some(GET_NETWORK_LIGHT + 1) },
            CommandSpec { name: "set_status_light", code: SET_NETWORK_LIGHT, response_code: Some(SET_NETWORK_LIGHT + 1) },
            CommandSpec { name: "camera_time", code: GET_CAMERA_TIME, response_code: Some(GET_CAMERA_TIME + 1) },
            CommandSpec { name: "set_camera_time", code: SET_CAMERA_TIME, response_code: Some(SET_CAMERA_TIME + 1) },
            CommandSpec { name: "night_switch", code: GET_NIGHT_SWITCH, response_code: Some(GET_NIGHT_SWITCH + 1) },
            CommandSpec { name: "set_night_switch", code: SET_NIGHT_SWITCH, response_code: Some(SET_NIGHT_SWITCH + 1) },
            CommandSpec { name: "alarm", code: GET_ALARM_FLASHING, response_code: Some(GET_ALARM_FLASHING + 1) },
            CommandSpec { name: "set_alarm", code: SET_ALARM_FLASHING, response_code: Some(SET_ALARM_FLASHING + 1) },
            CommandSpec { name: "start_boa", code: START_BOA, response_code: None },
            CommandSpec { name: "pan_cruise", code: GET_CRUISE_POINTS, response_code: Some(GET_CRUISE_POINTS + 1) },
            CommandSpec { name: "set_pan_cruise", code: SET_CRUISE, response_code: Some(SET_CRUISE + 1) },
            CommandSpec { name: "motion_tracking", code: GET_MOTION_TRACKING, response_code: Some(GET_MOTION_TRACKING + 1) },
            CommandSpec { name: "motion_tagging", code: GET_MOTION_TAGGING, response_code: Some(GET_MOTION_TAGGING + 1) },
            CommandSpec { name: "set_motion_tagging", code: SET_MOTION_TAGGING, response_code: Some(SET_MOTION_TAGGING + 1) },
            CommandSpec { name: "camera_info", code: CHECK_CAMERA_INFO, response_code: Some(CHECK_CAMERA_INFO + 1) },
            CommandSpec { name: "rtsp", code: GET_RTSP_PARAM, response_code: Some(GET_RTSP_PARAM + 1) },
            CommandSpec { name: "set_rtsp", code: SET_RTSP_SWITCH, response_code: Some(SET_RTSP_SWITCH + 1) },
            CommandSpec { name: "rotary_action", code: SET_ROTARY_BY_ACTION, response_code: Some(SET_ROTARY_BY_ACTION + 1) },
            CommandSpec { name: "rotary_degree", code: SET_ROTARY_BY_DEGREE, response_code: Some(SET_ROTARY_BY_DEGREE + 1) },
            CommandSpec { name: "reset_rotation", code: RESET_ROTATE_POSITION, response_code: Some(RESET_ROTATE_POSITION + 1) },
            CommandSpec { name: "ptz_position", code: SET_PTZ_POSITION, response_code: Some(SET_PTZ_POSITION + 1) },
            CommandSpec { name: "fps", code: DB_SET_RESOLVING, response_code: Some(0x01) },
        ];
        entries.into_iter().map(|e| (e.name, e)).collect()
    })
}

pub fn lookup(name: &str) -> Option<CommandSpec> {
    catalog().get(name).copied()
}

/// Resolve a command-value synonym ("on"/"off"/"left"/...) to its wire
/// constant. PTZ directions resolve to `(horiz, vert)` degree pairs.
pub fn resolve_cmd_value(token: &str) -> Option<CmdValue> {
    match token.to_ascii_lowercase().as_str() {
        "on" | "true" => Some(CmdValue::Int(1)),
        "off" | "false" => Some(CmdValue::Int(2)),
        "auto" => Some(CmdValue::Int(3)),
        "left" => Some(CmdValue::Degrees(-90, 0)),
        "right" => Some(CmdValue::Degrees(90, 0)),
        "up" => Some(CmdValue::Degrees(0, 90)),
        "down" => Some(CmdValue::Degrees(0, -90)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdValue {
    Int(i32),
    Degrees(i16, i16),
}

/// Upon receiving code 10001: `data[0]` is the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Abort,
    Proceed,
}

pub fn challenge_status(status: u8) -> ChallengeOutcome {
    match status {
        2 | 4 => ChallengeOutcome::Abort,
        1 | 3 | 6 => ChallengeOutcome::Proceed,
        _ => ChallengeOutcome::Abort,
    }
}

/// Run the connect-time challenge procedure against a received 10001
/// payload, returning the 16-byte response to embed in 10002/10008.
pub fn respond_to_challenge(data: &[u8], enr: &str) -> Result<[u8; 16]> {
    if data.is_empty() {
        return Err(BridgeError::Protocol("empty challenge payload".into()));
    }
    let status = data[0];
    if challenge_status(status) == ChallengeOutcome::Abort {
        return Err(BridgeError::Protocol(format!("challenge aborted, status={status}")));
    }
    if data.len() < 17 {
        return Err(BridgeError::Protocol("challenge payload too short".into()));
    }
    let mut camera_enr_b: [u8; 16] = data[1..17].try_into().unwrap();
    let enr_bytes = enr.as_bytes();
    if enr_bytes.len() < 16 {
        return Err(BridgeError::Protocol("enr too short".into()));
    }

    let key: [u8; 16] = match status {
        3 => enr_bytes[0..16].try_into().unwrap(),
        6 => {
            if enr_bytes.len() < 32 {
                return Err(BridgeError::Protocol("enr too short for DTLS key derivation".into()));
            }
            let intermediate: [u8; 16] = enr_bytes[0..16].try_into().unwrap();
            camera_enr_b = xxtea_decrypt(&camera_enr_b, &intermediate);
            enr_bytes[16..32].try_into().unwrap()
        }
        _ => enr_bytes[0..16].try_into().unwrap(),
    };

    Ok(xxtea_decrypt(&camera_enr_b, &key))
}

/// Pick 10008 (current) vs 10002 (legacy) per the shipped capability table:
/// DTLS-capable models with firmware new enough speak the current protocol.
pub fn supports_user_auth(product_model: &str, firmware_version: &str) -> bool {
    let major: u32 = firmware_version.split('.').next().and_then(|s| s.parse().ok()).unwrap_or(0);
    match product_model {
        "WYZEC1" => false,
        _ => major >= 4,
    }
}

/// Derive the 8-byte DTLS auth key: `base64(sha256(enr || upper(mac)))[:8]`
/// with `+`/`/`/`=` substituted for filesystem/URL-unsafe alternates.
pub fn derive_dtls_auth_key(enr: &str, mac: &str) -> String {
    use base64::Engine;
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(enr.as_bytes());
    hasher.update(mac.to_ascii_uppercase().as_bytes());
    let digest = hasher.finalize();

    let encoded = base64::engine::general_purpose::STANDARD.encode(&digest[..6]);
    let substituted: String = encoded
        .chars()
        .map(|c| match c {
            '+' => 'Z',
            '/' => '9',
            '=' => 'A',
            other => other,
        })
        .collect();
    substituted.chars().take(8).collect()
}

// --- XXTEA ---------------------------------------------------------------

const DELTA: u32 = 0x9E3779B9;

fn to_u32_words(block: &[u8; 16]) -> [u32; 4] {
    let mut v = [0u32; 4];
    for i in 0..4 {
        v[i] = u32::from_le_bytes(block[i * 4..i * 4 + 4].try_into().unwrap());
    }
    v
}

fn from_u32_words(v: [u32; 4]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..4 {
        out[i * 4..i * 4 + 4].copy_from_slice(&v[i].to_le_bytes());
    }
    out
}

fn mx(sum: u32, y: u32, z: u32, p: u32, e: u32, key: &[u32; 4]) -> u32 {
    ((z >> 5) ^ (y << 2)).wrapping_add((y >> 3) ^ (z << 4))
        ^ (sum ^ y).wrapping_add(key[((p & 3) ^ e) as usize] ^ z)
}

/// Encrypt exactly one 16-byte block, no padding.
pub fn xxtea_encrypt(block: &[u8; 16], key: &[u8; 16]) -> [u8; 16] {
    let mut v = to_u32_words(block);
    let k = to_u32_words(key);
    let n: u32 = 4;
    let rounds = 6 + 52 / n;
    let mut sum: u32 = 0;
    let mut y;
    let mut z = v[(n - 1) as usize];
    for _ in 0..rounds {
        sum = sum.wrapping_add(DELTA);
        let e = (sum >> 2) & 3;
        for p in 0..n {
            y = v[((p + 1) % n) as usize];
            z = v[p as usize].wrapping_add(mx(sum, y, z, p, e, &k));
            v[p as usize] = z;
        }
    }
    from_u32_words(v)
}

/// Decrypt exactly one 16-byte block, no padding.
pub fn xxtea_decrypt(block: &[u8; 16], key: &[u8; 16]) -> [u8; 16] {
    let mut v = to_u32_words(block);
    let k = to_u32_words(key);
    let n: u32 = 4;
    let rounds = 6 + 52 / n;
    let mut sum = rounds.wrapping_mul(DELTA);
    let mut y = v[0];
    let mut z;
    while sum != 0 {
        let e = (sum >> 2) & 3;
        for p in (0..n).rev() {
            z = v[((p + n - 1) % n) as usize];
            y = v[p as usize].wrapping_sub(mx(sum, y, z, p, e, &k));
            v[p as usize] = y;
        }
        sum = sum.wrapping_sub(DELTA);
    }
    from_u32_words(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trip() {
        for code in [0u16, 10000, 65535] {
            for payload in [&b""[..], &b"hello"[..], &[0xAB; 200][..]] {
                let framed = encode(code, payload);
                let (header, decoded_payload) = decode(&framed).unwrap();
                assert_eq!(header.code, code);
                assert_eq!(header.protocol, PROTOCOL_VERSION);
                assert_eq!(header.payload_len as usize, payload.len());
                assert_eq!(decoded_payload, payload);
            }
        }
    }

    #[test]
    fn decode_rejects_bad_prefix() {
        let mut framed = encode(1, b"x");
        framed[0] = b'X';
        assert!(decode(&framed).is_err());
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut framed = encode(1, b"x");
        framed.push(0xFF);
        assert!(decode(&framed).is_err());
    }

    #[test]
    fn xxtea_round_trip() {
        let key = [7u8; 16];
        let plain = [42u8; 16];
        let cipher = xxtea_encrypt(&plain, &key);
        assert_ne!(cipher, plain);
        let back = xxtea_decrypt(&cipher, &key);
        assert_eq!(back, plain);
    }

    #[test]
    fn challenge_status_boundaries() {
        assert_eq!(challenge_status(2), ChallengeOutcome::Abort);
        assert_eq!(challenge_status(4), ChallengeOutcome::Abort);
        assert_eq!(challenge_status(1), ChallengeOutcome::Proceed);
        assert_eq!(challenge_status(3), ChallengeOutcome::Proceed);
        assert_eq!(challenge_status(6), ChallengeOutcome::Proceed);
        assert_eq!(challenge_status(9), ChallengeOutcome::Abort);
    }

    #[test]
    fn challenge_is_deterministic() {
        let enr = "0123456789ABCDEF0123456789ABCDEF";
        let mut data = vec![3u8];
        data.extend_from_slice(&[9u8; 16]);
        let r1 = respond_to_challenge(&data, enr).unwrap();
        let r2 = respond_to_challenge(&data, enr).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn cmd_value_synonyms() {
        assert_eq!(resolve_cmd_value("ON"), Some(CmdValue::Int(1)));
        assert_eq!(resolve_cmd_value("left"), Some(CmdValue::Degrees(-90, 0)));
        assert_eq!(resolve_cmd_value("sideways"), None);
    }
}
