// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Frame pump: a backpressured loop extracting compressed frames from the
//! session, validating them, and writing them synchronously to a sink.
//! Never buffers frames — if the sink stalls, `DATA_NOREADY` counts rise
//! until the pump raises, surfacing the slowdown to the supervisor.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::model::FrameHeader;
use crate::mux::IoctlMux;
use crate::session::Session;
use crate::transport::{av_error, AvTransport};
use crate::wire;

/// Tunable bounds, sourced from configuration (`MAX_NOREADY`/`MAX_BADRES`).
#[derive(Debug, Clone, Copy)]
pub struct FramePumpLimits {
    pub max_noready: u32,
    pub max_badres: u32,
}

impl Default for FramePumpLimits {
    fn default() -> Self {
        FramePumpLimits { max_noready: 100, max_badres: 100 }
    }
}

struct Keyframe {
    wall_ts: SystemTime,
    frame_no: u32,
}

/// Runs while the session is authenticated. Returns on a fatal counter
/// overflow or a broken sink pipe; never returns `Ok` while the camera is
/// still streaming — the caller treats any return as "pump has stopped".
pub async fn run<W: Write>(
    session: &Session,
    mux: &IoctlMux,
    preferred_frame_size: u8,
    bitrate: u16,
    framerate: u8,
    limits: FramePumpLimits,
    mut sink: W,
) -> Result<()> {
    let accepted = [preferred_frame_size, preferred_frame_size + 3];

    let mut last_frame_no: u32 = 0;
    let mut last_keyframe: Option<Keyframe> = None;
    let mut bad_noready: u32 = 0;
    let mut bad_res: u32 = 0;
    let mut first_frame = true;

    loop {
        let transport = session.transport.clone();
        let channel_id = session.channel_id;
        let recv = tokio::task::spawn_blocking(move || transport.av_recv_frame(channel_id))
            .await
            .map_err(|e| BridgeError::Protocol(e.to_string()))?;

        let (data, header) = match recv {
            Ok(pair) => pair,
            Err(e) => match e.transport_code() {
                Some(av_error::DATA_NOREADY) => {
                    if last_frame_no == 0 {
                        continue;
                    }
                    bad_noready += 1;
                    if bad_noready > limits.max_noready {
                        return Err(BridgeError::Transient {
                            code: av_error::DATA_NOREADY,
                            detail: format!("exceeded max_noready={}", limits.max_noready),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Some(av_error::INCOMPLETE_FRAME) | Some(av_error::LOSED_THIS_FRAME) => {
                    debug!("dropped partial frame from transport");
                    continue;
                }
                _ => return Err(e),
            },
        };

        if !accepted.contains(&header.frame_size) {
            if first_frame {
                debug!(frame_size = header.frame_size, "skip initial small frame");
                first_frame = false;
                continue;
            }
            bad_res += 1;
            if bad_res > limits.max_badres {
                return Err(BridgeError::Protocol(format!("exceeded max_badres={}", limits.max_badres)));
            }
            resend_resolving(mux, preferred_frame_size, bitrate, framerate).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }

        first_frame = false;
        bad_noready = 0;
        bad_res = 0;

        let now = SystemTime::now();
        if header.is_keyframe {
            last_keyframe = Some(Keyframe { wall_ts: now, frame_no: header.frame_no });
        }

        if should_drop(&header, &last_keyframe, now, framerate) {
            continue;
        }

        if let Err(e) = sink.write_all(&data) {
            info!(error = %e, "sink pipe closed, frame pump exiting cleanly");
            return Ok(());
        }
        last_frame_no = header.frame_no;
    }
}

fn should_drop(header: &FrameHeader, last_keyframe: &Option<Keyframe>, now: SystemTime, framerate: u8) -> bool {
    if let Some(kf) = last_keyframe {
        let lost_gop = header.frame_no.saturating_sub(kf.frame_no) > (framerate as u32) * 2
            && header.frame_no.saturating_sub(kf.frame_no) > 6;
        if lost_gop {
            return true;
        }
        if let Ok(age) = now.duration_since(kf.wall_ts) {
            if age > Duration::from_secs(5) {
                return true;
            }
        }
    }

    let frame_ts = UNIX_EPOCH + Duration::new(header.timestamp_secs as u64, header.timestamp_ms * 1_000_000);
    if let Ok(age) = now.duration_since(frame_ts) {
        if age > Duration::from_secs(20) {
            return true;
        }
    }

    false
}

async fn resend_resolving(mux: &IoctlMux, frame_size: u8, bitrate: u16, framerate: u8) -> Result<()> {
    let payload = [1 + frame_size, bitrate as u8, framerate];
    mux.send(wire::code::SET_RESOLVING, Some(0x01), &payload)
        .result(Duration::from_secs(5))
        .await?;
    Ok(())
}

/// Channel type used by a session's owner to receive decoded frames when the
/// sink is an in-process consumer rather than a child-process stdin pipe
/// (e.g. tests, or a future non-ffmpeg sink).
pub type FrameSender = mpsc::Sender<Vec<u8>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FrameHeader, FrameHeaderLayout};

    fn header(frame_no: u32, is_keyframe: bool, ts_secs: u32) -> FrameHeader {
        FrameHeader {
            codec_id: 78,
            is_keyframe,
            frame_size: 0,
            bitrate: 120,
            framerate: 20,
            frame_no,
            timestamp_secs: ts_secs,
            timestamp_ms: 0,
            frame_len: 0,
            layout: FrameHeaderLayout::Standard32,
        }
    }

    #[test]
    fn drops_stale_frame_past_20s() {
        let now = SystemTime::now();
        let kf = Some(Keyframe { wall_ts: now, frame_no: 1 });
        let old_ts = now.duration_since(UNIX_EPOCH).unwrap().as_secs() as u32 - 21;
        let h = header(2, false, old_ts);
        assert!(should_drop(&h, &kf, now, 20));
    }

    #[test]
    fn drops_frame_with_no_recent_keyframe() {
        let now = SystemTime::now();
        let kf = Some(Keyframe { wall_ts: now - Duration::from_secs(6), frame_no: 1 });
        let ts = now.duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;
        let h = header(2, false, ts);
        assert!(should_drop(&h, &kf, now, 20));
    }

    #[test]
    fn forwards_fresh_frame() {
        let now = SystemTime::now();
        let kf = Some(Keyframe { wall_ts: now, frame_no: 1 });
        let ts = now.duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;
        let h = header(2, false, ts);
        assert!(!should_drop(&h, &kf, now, 20));
    }

    #[test]
    fn drops_lost_gop() {
        let now = SystemTime::now();
        let kf = Some(Keyframe { wall_ts: now, frame_no: 1 });
        let ts = now.duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;
        let h = header(50, false, ts); // far beyond framerate*2 and +6
        assert!(should_drop(&h, &kf, now, 20));
    }
}


