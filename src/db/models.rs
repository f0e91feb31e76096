use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ConfigError;

/// Power draw (W) at or above which a closed relay counts as driving a load.
pub const LOAD_THRESHOLD_W: f64 = 5.0;

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// One normalized sample from the plug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Telemetry {
    /// Volts.
    pub voltage: f64,
    /// Amps.
    pub current: f64,
    /// Watts.
    pub power: f64,
    /// Relay state as reported by the device (`switch_1`).
    pub device_reported_on: bool,
    pub observed_at: DateTime<Utc>,
}

impl Telemetry {
    /// Relay closed and something is actually drawing power.
    pub fn load_active(&self) -> bool {
        self.device_reported_on && self.power >= LOAD_THRESHOLD_W
    }
}

/// A persisted telemetry sample from the `readings` log.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Reading {
    pub id: Uuid,
    pub device_id: String,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub device_reported_on: bool,
    pub load_active: bool,
    pub observed_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(device_id: &str, t: &Telemetry) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_owned(),
            voltage: t.voltage,
            current: t.current,
            power: t.power,
            device_reported_on: t.device_reported_on,
            load_active: t.load_active(),
            observed_at: t.observed_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Current status
// ---------------------------------------------------------------------------

/// The single overwritten `status/current` record the mobile client watches.
///
/// Telemetry fields keep the last good sample while the device is offline;
/// `observed_at` tells how old it is.
#[derive(Debug, Clone, Default, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct CurrentStatus {
    pub device_online: bool,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub device_reported_on: Option<bool>,
    pub load_active: Option<bool>,
    pub observed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CurrentStatus {
    /// Online status built from a fresh sample; clears any previous error.
    pub fn online(t: &Telemetry) -> Self {
        Self {
            device_online: true,
            voltage: Some(t.voltage),
            current: Some(t.current),
            power: Some(t.power),
            device_reported_on: Some(t.device_reported_on),
            load_active: Some(t.load_active()),
            observed_at: Some(t.observed_at),
            last_error: None,
            error_at: None,
            updated_at: Some(Utc::now()),
        }
    }

    /// Marks the record offline, keeping the last good sample.
    pub fn mark_offline(&mut self, error: &str, at: DateTime<Utc>) {
        self.device_online = false;
        self.last_error = Some(error.to_owned());
        self.error_at = Some(at);
        self.updated_at = Some(at);
    }

    /// Records a failed operation that says nothing about reachability,
    /// such as a rejected power command.
    pub fn record_error(&mut self, error: &str, at: DateTime<Utc>) {
        self.last_error = Some(error.to_owned());
        self.error_at = Some(at);
        self.updated_at = Some(at);
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Recurring daily on-window, authored by the mobile client.
///
/// `active_days` is indexed Sunday = 0 … Saturday = 6. Times are local
/// wall-clock `HH:MM`; `start_time > end_time` wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub active_days: Vec<bool>,
    #[schema(example = "21:00")]
    pub start_time: String,
    #[schema(example = "06:00")]
    pub end_time: String,
}

impl ScheduleConfig {
    pub fn start_minutes(&self) -> Result<u32, ConfigError> {
        parse_minutes(&self.start_time)
    }

    pub fn end_minutes(&self) -> Result<u32, ConfigError> {
        parse_minutes(&self.end_time)
    }

    /// `day` follows `active_days` indexing; missing entries are inactive.
    pub fn is_active_on(&self, day: u32) -> bool {
        self.active_days.get(day as usize).copied().unwrap_or(false)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.active_days.len() != 7 {
            return Err(ConfigError::Invalid {
                key: "active_days".to_owned(),
                reason: format!("expected 7 entries, got {}", self.active_days.len()),
            });
        }
        self.start_minutes()?;
        self.end_minutes()?;
        Ok(())
    }
}

/// `"HH:MM"` → minutes since midnight.
fn parse_minutes(raw: &str) -> Result<u32, ConfigError> {
    let bad = || ConfigError::ScheduleTime(raw.to_owned());
    let (h, m) = raw.trim().split_once(':').ok_or_else(bad)?;
    let h: u32 = h.parse().map_err(|_| bad())?;
    let m: u32 = m.parse().map_err(|_| bad())?;
    if h > 23 || m > 59 {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// A one-shot on/off request from the mobile client.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct ManualCommand {
    pub desired_on: bool,
    pub issued_at: DateTime<Utc>,
}

/// What caused a power command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "power_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PowerSource {
    Manual,
    Schedule,
}

impl fmt::Display for PowerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerSource::Manual => "manual",
            PowerSource::Schedule => "schedule",
        };
        f.write_str(s)
    }
}

/// Audit entry for the most recent successful toggle (`control/lastAction`).
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct LastAction {
    pub desired_on: bool,
    pub source: PowerSource,
    pub at: DateTime<Utc>,
}
