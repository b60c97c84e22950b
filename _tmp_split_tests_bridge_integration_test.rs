// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Cross-module integration tests: config -> policy/options -> supervisor
//! registration, cloud cache persistence across restarts, and the relay
//! config writer's on-disk shape.
//!
//! Run with: `cargo test`

use std::io::Write as _;
use std::sync::Arc;

use camera_bridge::cloud::{CloudCollaborator, FileCacheCloudCollaborator, StaticCloudCollaborator};
use camera_bridge::config::{self, BridgeConfig};
use camera_bridge::model::{Camera, FrameSize, StreamState};
use camera_bridge::relay::{write_relay_config, InternalUser, Permission, PathDefaults, PathEntry, RelayConfig};
use camera_bridge::supervisor::StreamSupervisor;
use camera_bridge::transport::mock::MockAvTransport;
use camera_bridge::transport::AvTransport;

fn test_camera(nickname: &str) -> Camera {
    Camera {
        p2p_id: "AAAAAAAAAAAAAAAAAAAA".into(),
        mac: "AABBCCDDEEFF".into(),
        product_model: "WYZE_CAKP2JFUS".into(),
        firmware_version: "4.36.0.0".into(),
        dtls: false,
        parent_mac: None,
        enr: "0123456789ABCDEF0123456789ABCDEF".into(),
        nickname: nickname.into(),
        last_ip: None,
    }
}

#[test]
fn config_pipeline_drives_supervisor_registration() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[defaults]
quality = "HD120"
record = true

[[cameras]]
id = "front-door"
quality = "SD30"
record = false
"#
    )
    .unwrap();
    let cfg = BridgeConfig::from_file(file.path()).unwrap();

    let camera = test_camera("front-door");
    let over = cfg.override_for(&camera.nickname, &camera.mac).cloned();
    let options = config::resolve_options(&cfg.defaults, over.as_ref());
    let policy = config::resolve_policy(&cfg.defaults, over.as_ref());

    assert_eq!(options.frame_size, FrameSize::Sd);
    assert_eq!(options.bitrate, 30);
    assert!(!options.record, "camera override disables recording");

    let transport: Arc<dyn AvTransport> = Arc::new(MockAvTransport::default());
    let cloud: Arc<dyn CloudCollaborator> = Arc::new(StaticCloudCollaborator { cameras: Vec::new() });
    let supervisor = StreamSupervisor::new(transport, cloud, None);

    let uri = camera.uri_name('-');
    supervisor.add(uri.clone(), camera, options, policy);

    assert_eq!(supervisor.list_uris(), vec![uri.clone()]);
    assert_eq!(supervisor.state_of(&uri), Some(StreamState::Stopped.code()));

    supervisor.disable(&uri);
    assert_eq!(supervisor.state_of(&uri), Some(StreamState::Disabled.code()));

    supervisor.enable(&uri);
    assert_eq!(supervisor.state_of(&uri), Some(StreamState::Stopped.code()));
}

#[test]
fn cloud_cache_persists_across_collaborator_restart() {
    let dir = tempfile::tempdir().unwrap();
    let camera = test_camera("garage");

    let first_run = FileCacheCloudCollaborator::new(
        StaticCloudCollaborator { cameras: vec![camera.clone()] },
        dir.path().to_path_buf(),
        false,
    );
    let cred = camera_bridge::model::Credential {
        access_token: "tok".into(),
        refresh_token: "ref".into(),
        user_id: "u1".into(),
        phone_id: "p1".into(),
        mfa: None,
    };
    let listed = first_run.list_cameras(&cred).unwrap();
    assert_eq!(listed.len(), 1);

    // Simulate a restart where the network-backed collaborator is unreachable
    // (empty list) but the on-disk cache from the prior run is still there.
    let second_run =
        FileCacheCloudCollaborator::new(StaticCloudCollaborator { cameras: Vec::new() }, dir.path().to_path_buf(), false);
    let cached = second_run.list_cameras(&cred).unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].nickname, "garage");
}

#[test]
fn relay_config_written_to_disk_contains_expected_shape() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("mediamtx.yml");

    let mut paths = std::collections::HashMap::new();
    paths.insert(
        "front-door".to_string(),
        PathEntry {
            source: "publisher".into(),
            source_on_demand: true,
            source_on_demand_start_timeout: "10s".into(),
            source_on_demand_close_after: "60s".into(),
        },
    );
    let config = RelayConfig {
        path_defaults: PathDefaults {
            run_on_ready: "sh -c \"echo $RTSP_PATH!ready >> /tmp/events\"".into(),
            run_on_not_ready: "sh -c \"echo $RTSP_PATH!notready >> /tmp/events\"".into(),
            run_on_read: "sh -c \"echo $RTSP_PATH!read >> /tmp/events\"".into(),
            run_on_unread: "sh -c \"echo $RTSP_PATH!unread >> /tmp/events\"".into(),
        },
        paths,
        auth_internal_users: vec![InternalUser {
            user: "any".into(),
            pass: "".into(),
            permissions: vec![Permission { action: "read".into() }],
        }],
    };

    write_relay_config(&out_path, &config).unwrap();

    let written = std::fs::read_to_string(&out_path).unwrap();
    assert!(written.contains("front-door"));
    assert!(written.contains("pathDefaults"));
    assert!(written.contains("authInternalUsers"));
    assert!(!dir.path().join("mediamtx.yml.tmp").exists(), "temp file should be renamed away");
}

