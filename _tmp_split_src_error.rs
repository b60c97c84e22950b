// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

/// Crate-wide error type, grouped along the seven-category taxonomy.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("transient transport condition (code {code}): {detail}")]
    Transient { code: i32, detail: String },

    #[error("device '{uri}' offline (code {code})")]
    DeviceOffline { uri: String, code: i32 },

    #[error("stale credentials for '{uri}' (code {code}): {reason}")]
    StaleAuth { uri: String, code: i32, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("policy violation for '{uri}': {reason}")]
    Policy { uri: String, reason: String },

    #[error("command error: {0}")]
    Command(String),

    #[error("cloud collaborator error: {0}")]
    Collaborator(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("camera '{id}' not found")]
    CameraNotFound { id: String },
}

impl BridgeError {
    /// The numeric transport code carried by this error, when applicable.
    pub fn transport_code(&self) -> Option<i32> {
        match self {
            BridgeError::Transient { code, .. } => Some(*code),
            BridgeError::DeviceOffline { code, .. } => Some(*code),
            BridgeError::StaleAuth { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;


