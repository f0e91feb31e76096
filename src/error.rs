use std::time::Duration;

use thiserror::Error;

/// Tuya error code signalling that the access token is no longer valid.
pub const TOKEN_EXPIRED_CODE: i32 = 1010;

/// Failures while obtaining an access token.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Tuya rejected the token request: code={code}, msg={msg}")]
    Rejected { code: i32, msg: String },

    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token response could not be decoded: {0}")]
    Decode(String),
}

/// Failures while talking to the device, including the audit write that
/// completes a power command.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("access token expired (code 1010)")]
    TokenExpired,

    #[error("Tuya API error: code={code}, msg={msg}")]
    Api { code: i32, msg: String },

    #[error("Tuya request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected Tuya response: {0}")]
    Decode(String),

    /// The API answered successfully but did not accept the command.
    #[error("device rejected the command: {0}")]
    Rejected(String),

    #[error("call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("device switched but the audit record could not be written: {0}")]
    Audit(anyhow::Error),
}

impl DeviceError {
    pub fn is_token_expired(&self) -> bool {
        matches!(self, DeviceError::TokenExpired)
    }
}

/// Missing or malformed configuration: credentials at startup, or a
/// schedule record that cannot be enforced.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    Missing(String),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: String, reason: String },

    #[error("schedule time {0:?} is not HH:MM")]
    ScheduleTime(String),
}
