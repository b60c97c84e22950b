// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Stream supervisor: the process-wide registry of streams. Owns each
//! stream's lifecycle, reacts to on-demand events from the media relay, and
//! runs the per-stream health check state machine described in component F.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cloud::CloudCollaborator;
use crate::control::{self, Command, CommandReply};
use crate::frame_pump::{self, FramePumpLimits};
use crate::model::{AtomicStreamState, Camera, Credential, SnapshotRecord, StreamOptions, StreamState};
use crate::relay::RelayEvent;
use crate::session::{close_native_session, NetModePolicy, Session};
use crate::transport::AvTransport;

/// Per-stream configuration the supervisor needs beyond [`StreamOptions`].
#[derive(Debug, Clone)]
pub struct StreamPolicy {
    pub net_mode: NetModePolicy,
    pub ignore_offline: bool,
    pub offline_cooldown: Duration,
    pub max_noready: u32,
    pub max_badres: u32,
    /// Port the media relay listens for RTSP on; the frame pump's ffmpeg
    /// sink pushes each stream to `rtsp://127.0.0.1:<rtsp_port>/<uri>`.
    pub rtsp_port: u16,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        StreamPolicy {
            net_mode: NetModePolicy::Any,
            ignore_offline: false,
            offline_cooldown: Duration::from_secs(10),
            max_noready: 100,
            max_badres: 100,
            rtsp_port: 8554,
        }
    }
}

type ReplyReceiver = Arc<AsyncMutex<mpsc::Receiver<(String, CommandReply)>>>;

/// `(session_id, channel_id)` of the worker's live native session, if one is
/// currently open. Populated by the worker right after [`Session::connect`]
/// succeeds and cleared once it disconnects, so `stop()` can close the
/// native session from outside the worker task without racing it.
type SessionHandle = Arc<parking_lot::Mutex<Option<(i32, i32)>>>;

struct StreamEntry {
    camera: Camera,
    options: StreamOptions,
    policy: StreamPolicy,
    state: Arc<AtomicStreamState>,
    worker: Option<JoinHandle<()>>,
    cmd_tx: Option<mpsc::Sender<Command>>,
    reply_rx: Option<ReplyReceiver>,
    session_handle: SessionHandle,
    /// Set on every phase transition; drives the OFFLINE cooldown and the
    /// CONNECTING timeout.
    phase_started_at: DateTime<Utc>,
    snapshot: SnapshotRecord,
    disabled_permanently: bool,
}

/// Owns `uri -> Stream`.
pub struct StreamSupervisor {
    streams: RwLock<HashMap<String, StreamEntry>>,
    transport: Arc<dyn AvTransport>,
    cloud: Arc<dyn CloudCollaborator>,
    cred: RwLock<Option<Credential>>,
}

impl StreamSupervisor {
    pub fn new(transport: Arc<dyn AvTransport>, cloud: Arc<dyn CloudCollaborator>, cred: Option<Credential>) -> Self {
        StreamSupervisor { streams: RwLock::new(HashMap::new()), transport, cloud, cred: RwLock::new(cred) }
    }

    pub fn add(&self, uri: String, camera: Camera, options: StreamOptions, policy: StreamPolicy) {
        let entry = StreamEntry {
            camera,
            options,
            policy,
            state: Arc::new(AtomicStreamState::new(StreamState::Stopped)),
            worker: None,
            cmd_tx: None,
            reply_rx: None,
            session_handle: Arc::new(parking_lot::Mutex::new(None)),
            phase_started_at: Utc::now(),
            snapshot: SnapshotRecord::default(),
            disabled_permanently: false,
        };
        self.streams.write().insert(uri, entry);
    }

    pub fn state_of(&self, uri: &str) -> Option<i32> {
        self.streams.read().get(uri).map(|e| e.state.load())
    }

    pub fn list_uris(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }

    /// Spawn a worker driving connect -> authenticate -> pump+dispatcher.
    pub fn start(&self, uri: &str) {
        let mut guard = self.streams.write();
        let Some(entry) = guard.get_mut(uri) else {
            warn!(uri, "start() for unknown stream");
            return;
        };
        if entry.worker.is_some() {
            return;
        }
        entry.state.store(StreamState::Connecting);
        entry.phase_started_at = Utc::now();

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (reply_tx, reply_rx) = mpsc::channel(16);
        entry.cmd_tx = Some(cmd_tx);
        entry.reply_rx = Some(Arc::new(AsyncMutex::new(reply_rx)));

        let transport = self.transport.clone();
        let camera = entry.camera.clone();
        let options = entry.options.clone();
        let policy = entry.policy.clone();
        let state = entry.state.clone();
        let session_handle = entry.session_handle.clone();
        let uri_owned = uri.to_string();

        entry.worker = Some(tokio::spawn(async move {
            run_stream_worker(transport, camera, options, policy, state, session_handle, cmd_rx, reply_tx, uri_owned).await;
        }));
    }

    /// Signal cancellation to the worker and wait (bounded) for it to exit.
    ///
    /// Closes the native session directly, per spec.md §5: the blocking SDK
    /// calls the worker is parked in only unblock (with a negative error)
    /// once the session id they're bound to is closed. `abort()` alone would
    /// drop the worker's `tokio::task` without ever unparking those threads,
    /// leaking the native session.
    pub async fn stop(&self, uri: &str) {
        let (handle, state, session_handle) = {
            let mut guard = self.streams.write();
            let Some(entry) = guard.get_mut(uri) else { return };
            entry.state.store(StreamState::Stopping);
            entry.cmd_tx = None;
            entry.reply_rx = None;
            (entry.worker.take(), entry.state.clone(), entry.session_handle.clone())
        };

        if let Some((session_id, channel_id)) = session_handle.lock().take() {
            close_native_session(self.transport.clone(), channel_id, session_id).await;
        }

        if let Some(handle) = handle {
            handle.abort();
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
        state.store(StreamState::Stopped);
    }

    pub fn enable(&self, uri: &str) {
        if let Some(entry) = self.streams.write().get_mut(uri) {
            entry.options.record = true;
            entry.disabled_permanently = false;
            if entry.state.load() == StreamState::Disabled.code() {
                entry.state.store(StreamState::Stopped);
            }
        }
    }

    pub fn disable(&self, uri: &str) {
        if let Some(entry) = self.streams.write().get_mut(uri) {
            entry.options.record = false;
            entry.disabled_permanently = true;
            entry.state.store(StreamState::Disabled);
        }
    }

    pub async fn stop_all(&self) {
        for uri in self.list_uris() {
            self.stop(&uri).await;
        }
    }

    /// One health-check pass over every stream, per the stream supervisor's
    /// state machine. Returns the URIs currently CONNECTED, eligible for the
    /// rate-limited snapshot pass.
    pub async fn health_check_all(&self) -> Vec<String> {
        let due: Vec<(String, Action)> = {
            let mut guard = self.streams.write();
            let now = Utc::now();
            guard
                .iter_mut()
                .filter_map(|(uri, entry)| evaluate(entry, now).map(|a| (uri.clone(), a)))
                .collect()
        };

        let mut eligible_for_snapshot = Vec::new();
        for (uri, action) in due {
            match action {
                Action::Start => self.start(&uri),
                Action::Stop => self.stop(&uri).await,
                Action::RefreshDescriptor => self.refresh_descriptor(&uri).await,
                Action::NoteEligible => eligible_for_snapshot.push(uri),
            }
        }
        eligible_for_snapshot
    }

    async fn refresh_descriptor(&self, uri: &str) {
        let camera = self.streams.read().get(uri).map(|e| e.camera.clone());
        let Some(camera) = camera else { return };
        let cred = self.cred.read().clone();
        let Some(cred) = cred else {
            warn!(uri, "cannot refresh camera descriptor without cloud credentials");
            return;
        };
        let cloud = self.cloud.clone();
        let result = tokio::task::spawn_blocking(move || cloud.list_cameras(&cred)).await;
        match result {
            Ok(Ok(cameras)) => {
                if let Some(fresh) = cameras.into_iter().find(|c| c.mac == camera.mac) {
                    if let Some(entry) = self.streams.write().get_mut(uri) {
                        entry.camera = fresh;
                        entry.state.store(StreamState::Stopped);
                        entry.phase_started_at = Utc::now();
                    }
                    info!(uri, "camera descriptor refreshed from cloud collaborator");
                } else {
                    warn!(uri, "cloud collaborator no longer lists this camera");
                }
            }
            Ok(Err(e)) => warn!(uri, error = %e, "failed to refresh camera descriptor"),
            Err(e) => warn!(uri, error = %e, "refresh task panicked"),
        }
    }

    /// Main loop: alternates reading one relay event (1s timeout) with a
    /// health check on all streams, and runs the rate-limited snapshot pass.
    pub async fn monitor(&self, mut events: mpsc::Receiver<RelayEvent>, snapshot_mode_rtsp: bool, snapshot_interval: Duration) {
        let mut last_snapshot_pass = DateTime::<Utc>::UNIX_EPOCH;
        loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) => {
                    info!("relay event channel closed, supervisor monitor exiting");
                    break;
                }
                Err(_) => {}
            }

            let eligible = self.health_check_all().await;
            if snapshot_mode_rtsp && !eligible.is_empty() {
                let now = Utc::now();
                if now.signed_duration_since(last_snapshot_pass).num_seconds() >= snapshot_interval.as_secs() as i64 {
                    self.snap_all(&eligible);
                    last_snapshot_pass = now;
                }
            }
        }
    }

    async fn handle_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Start { uri } => self.start(&uri),
            RelayEvent::NotReady { uri } => self.stop(&uri).await,
            RelayEvent::Ready { uri } | RelayEvent::Read { uri } | RelayEvent::Unread { uri } => {
                info!(uri, event = ?event, "informational relay event");
            }
        }
    }

    fn snap_all(&self, uris: &[String]) {
        for uri in uris {
            info!(uri, "scheduling RTSP snapshot (handled by the media relay; tracked here for rate limiting)");
            if let Some(entry) = self.streams.write().get_mut(uri) {
                entry.snapshot.last_rtsp_snapshot = Some(Utc::now());
            }
        }
    }

    /// Post a command to a live stream's dispatcher and await its reply.
    pub async fn send_command(&self, uri: &str, topic: &str, payload: Option<serde_json::Value>) -> CommandReply {
        let (tx, rx) = {
            let guard = self.streams.read();
            let Some(entry) = guard.get(uri) else {
                return CommandReply { status: "error", response: Some("unknown stream".into()), value: None };
            };
            match (&entry.cmd_tx, &entry.reply_rx) {
                (Some(tx), Some(rx)) => (tx.clone(), rx.clone()),
                _ => return CommandReply { status: "error", response: Some("stream not live".into()), value: None },
            }
        };

        if tx.send(Command { topic: topic.to_string(), payload }).await.is_err() {
            return CommandReply { status: "error", response: Some("dispatcher gone".into()), value: None };
        }

        let mut rx_guard = rx.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), rx_guard.recv()).await {
            Ok(Some((_, reply))) => reply,
            Ok(None) => CommandReply { status: "error", response: Some("dispatcher channel closed".into()), value: None },
            Err(_) => CommandReply { status: "error", response: Some("command timed out".into()), value: None },
        }
    }
}

enum Action {
    Start,
    Stop,
    RefreshDescriptor,
    NoteEligible,
}

fn evaluate(entry: &mut StreamEntry, now: DateTime<Utc>) -> Option<Action> {
    let code = entry.state.load();

    if code == StreamState::Offline.code() {
        if entry.policy.ignore_offline {
            entry.disabled_permanently = true;
            entry.state.store(StreamState::Disabled);
            return None;
        }
        let deadline = entry.phase_started_at + chrono::Duration::from_std(entry.policy.offline_cooldown).unwrap();
        if now >= deadline {
            entry.state.store(StreamState::Stopped);
            entry.phase_started_at = now;
        }
        return None;
    }

    if crate::model::TRANSIENT_RETRY_CODES.contains(&code) {
        return Some(Action::RefreshDescriptor);
    }

    if code < 0 && code != StreamState::Stopping.code() {
        entry.state.store(StreamState::Stopped);
        entry.phase_started_at = now;
        return None;
    }

    if code == StreamState::Stopped.code() && entry.options.record && !entry.disabled_permanently {
        return Some(Action::Start);
    }

    if code == StreamState::Connecting.code() {
        let age = now.signed_duration_since(entry.phase_started_at);
        if age.num_seconds() > 20 {
            return Some(Action::Stop);
        }
    }

    if code == StreamState::Connected.code() {
        return Some(Action::NoteEligible);
    }

    None
}

async fn run_stream_worker(
    transport: Arc<dyn AvTransport>,
    camera: Camera,
    options: StreamOptions,
    policy: StreamPolicy,
    state: Arc<AtomicStreamState>,
    session_handle: SessionHandle,
    cmd_rx: mpsc::Receiver<Command>,
    reply_tx: mpsc::Sender<(String, CommandReply)>,
    uri: String,
) {
    let mut session = match Session::connect(transport, camera.clone(), policy.net_mode).await {
        Ok(s) => s,
        Err(e) => {
            warn!(uri, error = %e, "connect failed");
            state.store_code(e.transport_code().unwrap_or_else(|| StreamState::Stopped.code()));
            return;
        }
    };
    *session_handle.lock() = Some((session.session_id, session.channel_id));

    if let Err(e) = session.authenticate(&options, Duration::from_secs(5)).await {
        warn!(uri, error = %e, "authentication failed");
        session_handle.lock().take();
        session.disconnect().await;
        state.store(StreamState::Stopped);
        return;
    }

    state.store(StreamState::Connected);
    info!(uri, "stream authenticated, pump + dispatcher running");

    let preferred_bitrate = std::sync::atomic::AtomicU16::new(options.bitrate);
    let param_ids: Vec<u8> = (1u8..=20).collect();

    let rtsp_url = format!("rtsp://127.0.0.1:{}/{}", policy.rtsp_port, uri);
    let sink = match frame_pump::FfmpegSink::spawn(session.session_info.codec_name(), &rtsp_url) {
        Ok(sink) => sink,
        Err(e) => {
            warn!(uri, error = %e, "failed to spawn ffmpeg sink");
            session_handle.lock().take();
            session.disconnect().await;
            state.store(StreamState::Stopped);
            return;
        }
    };
    let pump_fut = frame_pump::run(
        &session,
        &session.mux,
        options.frame_size.wire_value(),
        options.bitrate,
        20,
        FramePumpLimits { max_noready: policy.max_noready, max_badres: policy.max_badres },
        sink,
    );
    let control_fut = control::run(&session.mux, cmd_rx, reply_tx, &param_ids, &preferred_bitrate);

    tokio::select! {
        res = pump_fut => {
            if let Err(e) = res {
                warn!(uri, error = %e, "frame pump exited with error");
            }
        }
        _ = control_fut => {
            warn!(uri, "control dispatcher exited");
        }
    }

    session_handle.lock().take();
    session.disconnect().await;
    state.store(StreamState::Stopped);
}
