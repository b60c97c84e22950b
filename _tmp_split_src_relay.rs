// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Media relay boundary: writes the relay's path configuration and reads
//! its on-demand event pipe. The relay process itself is out of scope; this
//! module only owns the two files the bridge and the relay agree on.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// On-demand/status events the relay announces over its named pipe,
/// `!`-delimited (`path!event`), grounded in `original_source/app/mtx_event.py`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Start { uri: String },
    NotReady { uri: String },
    Ready { uri: String },
    Read { uri: String },
    Unread { uri: String },
}

impl RelayEvent {
    fn parse(line: &str) -> Option<RelayEvent> {
        let (uri, kind) = line.trim().rsplit_once('!')?;
        let uri = uri.to_string();
        match kind {
            "start" => Some(RelayEvent::Start { uri }),
            "notready" => Some(RelayEvent::NotReady { uri }),
            "ready" => Some(RelayEvent::Ready { uri }),
            "read" => Some(RelayEvent::Read { uri }),
            "unread" => Some(RelayEvent::Unread { uri }),
            _ => None,
        }
    }
}

/// Blocking-reads `pipe_path` line by line and forwards parsed events.
/// Intended to run on a `spawn_blocking` task, since named FIFOs block on
/// open/read with no async equivalent in the teacher's stack.
pub fn read_event_pipe(pipe_path: &Path, tx: mpsc::Sender<RelayEvent>) -> Result<()> {
    let file = std::fs::File::open(pipe_path).map_err(BridgeError::Io)?;
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let line = line.map_err(BridgeError::Io)?;
        if line.is_empty() {
            continue;
        }
        match RelayEvent::parse(&line) {
            Some(event) => {
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
            None => debug!(line, "unrecognized relay event line, ignoring"),
        }
    }
    Ok(())
}

/// `paths.<uri>` entry written into the relay's YAML config.
#[derive(Debug, Clone, Serialize)]
pub struct PathEntry {
    pub source: String,
    #[serde(rename = "sourceOnDemand")]
    pub source_on_demand: bool,
    #[serde(rename = "sourceOnDemandStartTimeout")]
    pub source_on_demand_start_timeout: String,
    #[serde(rename = "sourceOnDemandCloseAfter")]
    pub source_on_demand_close_after: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathDefaults {
    #[serde(rename = "runOnReady")]
    pub run_on_ready: String,
    #[serde(rename = "runOnNotReady")]
    pub run_on_not_ready: String,
    #[serde(rename = "runOnRead")]
    pub run_on_read: String,
    #[serde(rename = "runOnUnread")]
    pub run_on_unread: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayConfig {
    #[serde(rename = "pathDefaults")]
    pub path_defaults: PathDefaults,
    pub paths: HashMap<String, PathEntry>,
    #[serde(rename = "authInternalUsers")]
    pub auth_internal_users: Vec<InternalUser>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InternalUser {
    pub user: String,
    pub pass: String,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Permission {
    pub action: String,
}

/// Serialize `config` to YAML and write it to `path` atomically: write to a
/// sibling temp file in the same directory, then rename over the target.
pub fn write_relay_config(path: &Path, config: &RelayConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).map_err(|e| BridgeError::Config(format!("failed to render relay config: {e}")))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, yaml).map_err(BridgeError::Io)?;
    std::fs::rename(&tmp, path).map_err(BridgeError::Io)?;
    Ok(())
}

/// Build the event-pipe command string for `runOnReady`/`runOnNotReady`/etc,
/// the convention the relay substitutes `%path%` into before execution.
pub fn event_command(pipe_path: &Path, event: &str) -> String {
    format!("sh -c \"echo $RTSP_PATH!{event} >> {}\"", pipe_path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_event_kinds() {
        assert_eq!(RelayEvent::parse("front-door!ready"), Some(RelayEvent::Ready { uri: "front-door".into() }));
        assert_eq!(RelayEvent::parse("garage!notready"), Some(RelayEvent::NotReady { uri: "garage".into() }));
        assert_eq!(RelayEvent::parse("bogus-line"), None);
    }

    #[test]
    fn event_command_embeds_path() {
        let cmd = event_command(Path::new("/tmp/events"), "ready");
        assert!(cmd.contains("!ready"));
        assert!(cmd.contains("/tmp/events"));
    }
}


