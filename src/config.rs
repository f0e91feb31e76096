use std::{path::Path, time::Duration};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub tuya_client_id: String,
    pub tuya_client_secret: String,
    pub tuya_base_url: String,
    /// The single plug this process controls.
    pub tuya_device_id: String,
    pub server_host: String,
    pub server_port: u16,
    /// Reconciliation cadence in seconds.
    pub poll_interval_secs: u64,
    /// Upper bound for every outbound call (vendor API and store).
    pub call_timeout_secs: u64,
}

impl Config {
    /// Reads configuration from the process environment.
    ///
    /// When `SECRETS_FILE` is set, that dotenv-format file is loaded first so
    /// credentials can live outside the environment. Variables already set in
    /// the environment win.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("SECRETS_FILE") {
            load_secrets_file(Path::new(&path))?;
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::Missing(key.to_owned()))
        };
        let optional = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());

        let config = Self {
            database_url: required("DATABASE_URL")?,
            tuya_client_id: required("TUYA_CLIENT_ID")?,
            tuya_client_secret: required("TUYA_CLIENT_SECRET")?,
            tuya_base_url: required("TUYA_BASE_URL")?.trim_end_matches('/').to_owned(),
            tuya_device_id: required("TUYA_DEVICE_ID")?,
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: parse("SERVER_PORT", &optional("SERVER_PORT", "8080"))?,
            poll_interval_secs: positive("POLL_INTERVAL_SECS", &optional("POLL_INTERVAL_SECS", "30"))?,
            call_timeout_secs: positive("CALL_TIMEOUT_SECS", &optional("CALL_TIMEOUT_SECS", "10"))?,
        };

        // A poll must be able to time out before the next one is due.
        if config.poll_interval_secs <= config.call_timeout_secs {
            return Err(ConfigError::Invalid {
                key: "POLL_INTERVAL_SECS".to_owned(),
                reason: format!("must exceed CALL_TIMEOUT_SECS ({})", config.call_timeout_secs),
            });
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn load_secrets_file(path: &Path) -> Result<(), ConfigError> {
    dotenvy::from_path(path).map_err(|e| ConfigError::Invalid {
        key: "SECRETS_FILE".to_owned(),
        reason: format!("cannot load {}: {e}", path.display()),
    })
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_owned(),
        reason: e.to_string(),
    })
}

fn positive(key: &str, raw: &str) -> Result<u64, ConfigError> {
    match parse::<u64>(key, raw)? {
        0 => Err(ConfigError::Invalid {
            key: key.to_owned(),
            reason: "must be greater than zero".to_owned(),
        }),
        v => Ok(v),
    }
}
