// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Native P2P/AV transport binding. Thin adapter over the vendor C SDK:
//! session connect, AV channel start/stop, frame recv, IO-ctrl send/recv.
//!
//! The vendor library is genuinely process-global, so it is modeled as an
//! explicit resource (see [`NativeLibrary`]) owned behind an `Arc` rather
//! than a module-initialized singleton.

use std::path::PathBuf;
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::error::{BridgeError, Result};
use crate::model::{FrameHeader, FrameHeaderLayout, SessionInfo, SessionMode};

/// Battery-powered cameras (doorbells, outdoor) disable `resend` on the AV
/// channel; all other families enable it.
pub fn resend_flag_for_model(product_model: &str) -> i32 {
    match product_model {
        "WYZEDB3" | "WVOD1" => 0,
        _ => 1,
    }
}

/// Transport-level codes the frame pump and mux care about by name.
pub mod av_error {
    pub const DATA_NOREADY: i32 = -20012;
    pub const INCOMPLETE_FRAME: i32 = -20013;
    pub const LOSED_THIS_FRAME: i32 = -20014;
    pub const SESSION_CLOSE_BY_REMOTE: i32 = -20015;
    pub const REMOTE_TIMEOUT_DISCONNECT: i32 = -20016;
    pub const TIMEOUT: i32 = -20011;
}
pub mod iotc_error {
    pub const DEVICE_OFFLINE: i32 = -90;
    pub const TIMEOUT: i32 = -13;
    pub const CAN_NOT_FIND_DEVICE: i32 = -19;
    pub const DEVICE_REJECT_BY_WRONG_AUTH_KEY: i32 = -68;
}

/// Narrow interface over the vendor SDK. Every method is a blocking FFI
/// call; async call sites wrap them with `spawn_blocking`. Implementations
/// must allow a concurrent `close_session`/`stop_av` to unblock any pending
/// call from another task.
pub trait AvTransport: Send + Sync {
    fn connect(&self, p2p_id: &str, dtls: bool, enr: &str, mac: &str) -> Result<i32>;
    fn session_check(&self, session_id: i32) -> Result<SessionInfo>;
    fn av_start(&self, session_id: i32, username: &str, password: &str, resend_flag: i32, timeout_ms: u32) -> Result<i32>;
    fn av_clean_buf(&self, channel_id: i32) -> Result<()>;
    fn av_recv_frame(&self, channel_id: i32) -> Result<(Vec<u8>, FrameHeader)>;
    fn av_send_ioctl(&self, channel_id: i32, ctrl_type: u32, payload: &[u8]) -> Result<()>;
    fn av_recv_ioctl(&self, channel_id: i32, timeout_ms: u32) -> Result<(u16, Vec<u8>)>;
    fn stop_av(&self, channel_id: i32) -> Result<()>;
    fn close_session(&self, session_id: i32) -> Result<()>;
}

/// IOCTRL user-defined type range start, per the vendor SDK.
pub const IOTYPE_USER_DEFINED_START: u32 = 256;

/// Process-wide handle to the dynamically loaded vendor library. Callers
/// share it behind an `Arc`; the library is torn down once the last clone
/// drops.
pub struct NativeLibrary {
    lib: Library,
}

/// Default search locations for the vendor shared object, matching the
/// upstream bridge's `load_library()` probe order.
pub const DEFAULT_LIBRARY_PATHS: &[&str] =
    &["/usr/local/lib/libIOTCAPIs_ALL.so", "/usr/local/lib/libIOTCAPIs_ALL.dylib"];

impl NativeLibrary {
    /// Load the vendor SDK from the first existing path in `search_paths`,
    /// call `IOTC_Initialize2`/`avInitialize`/`TUTK_SDK_Set_License_Key`, and
    /// bump the process-wide reference count.
    pub fn init(search_paths: &[PathBuf], udp_port: u16, max_channels: u32, license_key: &str) -> Result<Self> {
        let path = search_paths
            .iter()
            .find(|p| p.exists())
            .ok_or_else(|| BridgeError::Config("vendor SDK shared library not found in configured paths".into()))?;

        let lib = unsafe { Library::new(path) }
            .map_err(|e| BridgeError::Config(format!("failed to load {path:?}: {e}")))?;

        unsafe {
            let iotc_init: Symbol<unsafe extern "C" fn(u16) -> i32> = lib
                .get(b"IOTC_Initialize2")
                .map_err(|e| BridgeError::Config(format!("missing IOTC_Initialize2: {e}")))?;
            let rc = iotc_init(udp_port);
            if rc < 0 {
                return Err(BridgeError::Config(format!("IOTC_Initialize2 failed: {rc}")));
            }

            let av_init: Symbol<unsafe extern "C" fn(i32) -> i32> = lib
                .get(b"avInitialize")
                .map_err(|e| BridgeError::Config(format!("missing avInitialize: {e}")))?;
            let max_chans = av_init(max_channels as i32);
            if max_chans < 0 {
                return Err(BridgeError::Config(format!("avInitialize failed: {max_chans}")));
            }

            if !license_key.is_empty() {
                if let Ok(set_license) =
                    lib.get::<unsafe extern "C" fn(*const std::os::raw::c_char) -> i32>(b"TUTK_SDK_Set_License_Key")
                {
                    let c_key = std::ffi::CString::new(license_key).unwrap();
                    let _ = set_license(c_key.as_ptr());
                }
            }
        }

        Ok(NativeLibrary { lib })
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        unsafe {
            if let Ok(av_deinit) = self.lib.get::<unsafe extern "C" fn() -> i32>(b"avDeInitialize") {
                let _ = av_deinit();
            }
            if let Ok(iotc_deinit) = self.lib.get::<unsafe extern "C" fn() -> i32>(b"IOTC_DeInitialize") {
                let _ = iotc_deinit();
            }
        }
    }
}

/// Production [`AvTransport`] implementation, delegating to the loaded
/// vendor library. Frame/session structs are decoded from the raw layouts
/// the SDK returns (`FrameInfoStruct`/`FrameInfo3Struct`, `SInfoStructEx`).
pub struct NativeAvTransport {
    library: Arc<NativeLibrary>,
}

impl NativeAvTransport {
    pub fn new(library: Arc<NativeLibrary>) -> Self {
        NativeAvTransport { library }
    }

    fn lib(&self) -> &Library {
        &self.library.lib
    }
}

impl AvTransport for NativeAvTransport {
    fn connect(&self, p2p_id: &str, dtls: bool, enr: &str, mac: &str) -> Result<i32> {
        let uid = std::ffi::CString::new(p2p_id).map_err(|e| BridgeError::Protocol(e.to_string()))?;
        unsafe {
            if dtls {
                let auth_key = crate::wire::derive_dtls_auth_key(enr, mac);
                let auth_c = std::ffi::CString::new(auth_key).unwrap();
                let connect_ex: Symbol<
                    unsafe extern "C" fn(*const std::os::raw::c_char, *const std::os::raw::c_char, u32) -> i32,
                > = self
                    .lib()
                    .get(b"IOTC_Connect_ByUIDEx")
                    .map_err(|e| BridgeError::Protocol(format!("missing IOTC_Connect_ByUIDEx: {e}")))?;
                let session_id = connect_ex(uid.as_ptr(), auth_c.as_ptr(), 20_000);
                if session_id < 0 {
                    return Err(BridgeError::DeviceOffline { uri: p2p_id.to_string(), code: session_id });
                }
                Ok(session_id)
            } else {
                let connect: Symbol<unsafe extern "C" fn(*const std::os::raw::c_char, u32) -> i32> = self
                    .lib()
                    .get(b"IOTC_Connect_ByUID_Parallel")
                    .map_err(|e| BridgeError::Protocol(format!("missing IOTC_Connect_ByUID_Parallel: {e}")))?;
                let session_id = connect(uid.as_ptr(), 20_000);
                if session_id < 0 {
                    return Err(BridgeError::DeviceOffline { uri: p2p_id.to_string(), code: session_id });
                }
                Ok(session_id)
            }
        }
    }

    fn session_check(&self, session_id: i32) -> Result<SessionInfo> {
        unsafe {
            let check: Symbol<unsafe extern "C" fn(i32, *mut SInfoRaw) -> i32> = self
                .lib()
                .get(b"IOTC_Session_Check_Ex")
                .map_err(|e| BridgeError::Protocol(format!("missing IOTC_Session_Check_Ex: {e}")))?;
            let mut raw = SInfoRaw::default();
            let rc = check(session_id, &mut raw as *mut _);
            if rc < 0 {
                return Err(BridgeError::Protocol(format!("session_check failed: {rc}")));
            }
            Ok(SessionInfo {
                mode: SessionMode::from_wire(raw.mode).unwrap_or(SessionMode::P2p),
                remote_ip: cstr_field(&raw.remote_ip),
                wan_ip: cstr_field(&raw.remote_wan_ip),
                wan_port: raw.remote_wan_port,
                local_nat_type: raw.local_nat_type,
                remote_nat_type: raw.remote_nat_type,
                video_codec_id: 0,
                nominal_framerate: 0,
                dtls: raw.is_secure != 0,
                wifi_signal: None,
                net_state: raw.net_state,
            })
        }
    }

    fn av_start(&self, session_id: i32, username: &str, password: &str, resend_flag: i32, timeout_ms: u32) -> Result<i32> {
        let user_c = std::ffi::CString::new(username).unwrap();
        let pass_c = std::ffi::CString::new(password).unwrap();
        unsafe {
            let start: Symbol<
                unsafe extern "C" fn(i32, *const std::os::raw::c_char, *const std::os::raw::c_char, i32, u32) -> i32,
            > = self
                .lib()
                .get(b"avClientStartEx")
                .map_err(|e| BridgeError::Protocol(format!("missing avClientStartEx: {e}")))?;
            let channel_id = start(session_id, user_c.as_ptr(), pass_c.as_ptr(), resend_flag, timeout_ms);
            if channel_id < 0 {
                return Err(BridgeError::Protocol(format!("avClientStartEx failed: {channel_id}")));
            }
            Ok(channel_id)
        }
    }

    fn av_clean_buf(&self, channel_id: i32) -> Result<()> {
        unsafe {
            let clean: Symbol<unsafe extern "C" fn(i32)> = self
                .lib()
                .get(b"avClientCleanBuf")
                .map_err(|e| BridgeError::Protocol(format!("missing avClientCleanBuf: {e}")))?;
            clean(channel_id);
        }
        Ok(())
    }

    fn av_recv_frame(&self, channel_id: i32) -> Result<(Vec<u8>, FrameHeader)> {
        unsafe {
            let recv: Symbol<
                unsafe extern "C" fn(i32, *mut u8, i32, *mut i32, *mut FrameInfoRaw, i32, *mut i32) -> i32,
            > = self
                .lib()
                .get(b"avRecvFrameData2")
                .map_err(|e| BridgeError::Protocol(format!("missing avRecvFrameData2: {e}")))?;

            let mut buf = vec![0u8; 256 * 1024];
            let mut actual_len: i32 = 0;
            let mut frame_info = FrameInfoRaw::default();
            let mut frame_info_actual: i32 = 0;
            let errno = recv(
                channel_id,
                buf.as_mut_ptr(),
                buf.len() as i32,
                &mut actual_len,
                &mut frame_info,
                std::mem::size_of::<FrameInfoRaw>() as i32,
                &mut frame_info_actual,
            );
            if errno < 0 {
                return Err(transport_error(errno));
            }
            buf.truncate(actual_len.max(0) as usize);
            let layout = if frame_info_actual as usize > std::mem::size_of::<FrameInfoRaw>() {
                FrameHeaderLayout::Extended40
            } else {
                FrameHeaderLayout::Standard32
            };
            Ok((
                buf,
                FrameHeader {
                    codec_id: frame_info.codec_id,
                    is_keyframe: frame_info.is_keyframe != 0,
                    frame_size: frame_info.frame_size,
                    bitrate: frame_info.bitrate,
                    framerate: frame_info.framerate,
                    frame_no: frame_info.frame_no,
                    timestamp_secs: frame_info.timestamp,
                    timestamp_ms: frame_info.timestamp_ms,
                    frame_len: actual_len.max(0) as u32,
                    layout,
                },
            ))
        }
    }

    fn av_send_ioctl(&self, channel_id: i32, ctrl_type: u32, payload: &[u8]) -> Result<()> {
        unsafe {
            let send: Symbol<unsafe extern "C" fn(i32, u32, *const u8, i32) -> i32> = self
                .lib()
                .get(b"avSendIOCtrl")
                .map_err(|e| BridgeError::Protocol(format!("missing avSendIOCtrl: {e}")))?;
            let rc = send(channel_id, ctrl_type, payload.as_ptr(), payload.len() as i32);
            if rc < 0 {
                return Err(transport_error(rc));
            }
        }
        Ok(())
    }

    fn av_recv_ioctl(&self, channel_id: i32, timeout_ms: u32) -> Result<(u16, Vec<u8>)> {
        unsafe {
            let recv: Symbol<unsafe extern "C" fn(i32, *mut u32, *mut u8, i32, u32) -> i32> = self
                .lib()
                .get(b"avRecvIOCtrl")
                .map_err(|e| BridgeError::Protocol(format!("missing avRecvIOCtrl: {e}")))?;
            let mut buf = vec![0u8; 4096];
            let mut ctrl_type: u32 = 0;
            let actual_len = recv(channel_id, &mut ctrl_type, buf.as_mut_ptr(), buf.len() as i32, timeout_ms);
            if actual_len < 0 {
                return Err(transport_error(actual_len));
            }
            buf.truncate(actual_len as usize);
            Ok((ctrl_type as u16, buf))
        }
    }

    fn stop_av(&self, channel_id: i32) -> Result<()> {
        unsafe {
            let stop: Symbol<unsafe extern "C" fn(i32)> = self
                .lib()
                .get(b"avClientStop")
                .map_err(|e| BridgeError::Protocol(format!("missing avClientStop: {e}")))?;
            stop(channel_id);
        }
        Ok(())
    }

    fn close_session(&self, session_id: i32) -> Result<()> {
        unsafe {
            let close: Symbol<unsafe extern "C" fn(i32)> = self
                .lib()
                .get(b"IOTC_Session_Close")
                .map_err(|e| BridgeError::Protocol(format!("missing IOTC_Session_Close: {e}")))?;
            close(session_id);
        }
        Ok(())
    }
}

pub fn transport_error(code: i32) -> BridgeError {
    match code {
        av_error::DATA_NOREADY | av_error::INCOMPLETE_FRAME | av_error::LOSED_THIS_FRAME | av_error::TIMEOUT => {
            BridgeError::Transient { code, detail: "transport timeout/backpressure".into() }
        }
        iotc_error::DEVICE_OFFLINE => BridgeError::DeviceOffline { uri: String::new(), code },
        iotc_error::TIMEOUT | iotc_error::CAN_NOT_FIND_DEVICE | iotc_error::DEVICE_REJECT_BY_WRONG_AUTH_KEY => {
            BridgeError::StaleAuth { uri: String::new(), code, reason: "transport auth/timeout code".into() }
        }
        _ => BridgeError::Protocol(format!("transport error {code}")),
    }
}

fn cstr_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Mirrors the vendor SDK's `SInfoStructEx`, reproduced in the layout the
/// library writes into, with only the fields this crate reads.
#[repr(C)]
#[derive(Default)]
struct SInfoRaw {
    size: u32,
    mode: u8,
    c_or_d: i8,
    uid: [u8; 21],
    remote_ip: [u8; 47],
    remote_port: u16,
    tx_packet_count: u32,
    rx_packet_count: u32,
    iotc_version: u32,
    vendor_id: u16,
    product_id: u16,
    group_id: u16,
    is_secure: u8,
    local_nat_type: u8,
    remote_nat_type: u8,
    relay_type: u8,
    net_state: u32,
    remote_wan_ip: [u8; 47],
    remote_wan_port: u16,
    is_nebula: u8,
}

/// Mirrors the vendor SDK's `FrameInfoStruct`.
#[repr(C)]
#[derive(Default)]
struct FrameInfoRaw {
    codec_id: u16,
    is_keyframe: u8,
    cam_index: u8,
    online_num: u8,
    framerate: u8,
    frame_size: u8,
    bitrate: u8,
    timestamp_ms: u32,
    timestamp: u32,
    frame_len: u32,
    frame_no: u32,
    ac_mac_addr: [u8; 12],
    n_play_token: i32,
}

/// Resolve the configured search paths, falling back to [`DEFAULT_LIBRARY_PATHS`].
pub fn resolve_library_paths(configured: &[String]) -> Vec<PathBuf> {
    if configured.is_empty() {
        DEFAULT_LIBRARY_PATHS.iter().map(PathBuf::from).collect()
    } else {
        configured.iter().map(PathBuf::from).collect()
    }
}

/// A scriptable in-memory transport used by session/mux/frame-pump tests —
/// the crate has no way to exercise the real vendor SDK without hardware.
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct MockAvTransport {
        pub connect_result: Mutex<Option<Result<i32>>>,
        pub session_info: Mutex<Option<SessionInfo>>,
        pub ioctl_responses: Mutex<VecDeque<Result<(u16, Vec<u8>)>>>,
        pub sent_ioctls: Mutex<Vec<(u32, Vec<u8>)>>,
        pub frames: Mutex<VecDeque<Result<(Vec<u8>, FrameHeader)>>>,
    }

    impl AvTransport for MockAvTransport {
        fn connect(&self, _p2p_id: &str, _dtls: bool, _enr: &str, _mac: &str) -> Result<i32> {
            self.connect_result.lock().take().unwrap_or(Ok(1))
        }

        fn session_check(&self, _session_id: i32) -> Result<SessionInfo> {
            self.session_info.lock().clone().ok_or_else(|| BridgeError::Protocol("no mock session info".into()))
        }

        fn av_start(&self, _session_id: i32, _username: &str, _password: &str, _resend_flag: i32, _timeout_ms: u32) -> Result<i32> {
            Ok(1)
        }

        fn av_clean_buf(&self, _channel_id: i32) -> Result<()> {
            Ok(())
        }

        fn av_recv_frame(&self, _channel_id: i32) -> Result<(Vec<u8>, FrameHeader)> {
            self.frames.lock().pop_front().unwrap_or_else(|| Err(transport_error(av_error::DATA_NOREADY)))
        }

        fn av_send_ioctl(&self, _channel_id: i32, ctrl_type: u32, payload: &[u8]) -> Result<()> {
            self.sent_ioctls.lock().push((ctrl_type, payload.to_vec()));
            Ok(())
        }

        fn av_recv_ioctl(&self, _channel_id: i32, _timeout_ms: u32) -> Result<(u16, Vec<u8>)> {
            self.ioctl_responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(transport_error(av_error::TIMEOUT)))
        }

        fn stop_av(&self, _channel_id: i32) -> Result<()> {
            Ok(())
        }

        fn close_session(&self, _session_id: i32) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resend_flag_matches_battery_cams() {
        assert_eq!(resend_flag_for_model("WYZEDB3"), 0);
        assert_eq!(resend_flag_for_model("WVOD1"), 0);
        assert_eq!(resend_flag_for_model("WYZE_CAKP2JFUS"), 1);
    }

    #[test]
    fn default_paths_used_when_unconfigured() {
        let paths = resolve_library_paths(&[]);
        assert_eq!(paths.len(), DEFAULT_LIBRARY_PATHS.len());
    }
}


