use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{db::models::Telemetry, error::DeviceError, error::TOKEN_EXPIRED_CODE};

// ---------------------------------------------------------------------------
// Generic response envelope
//
// Every Tuya Cloud API wraps its payload in the same outer object:
//
// Success:
//   { "success": true, "t": 1545447665981, "result": <T>, "tid": "..." }
//
// Failure:
//   { "success": false, "t": 1561348644346, "code": 1010, "msg": "token invalid", "tid": "..." }
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TuyaResponse<T> {
    pub success: bool,

    /// 13-digit Unix timestamp in milliseconds returned by the server.
    #[serde(default)]
    pub t: i64,

    /// Server-side request trace ID.
    pub tid: Option<String>,

    /// Present on success.
    pub result: Option<T>,

    /// Tuya error code, present on failure.
    pub code: Option<i32>,

    /// Human-readable error message, present on failure.
    pub msg: Option<String>,
}

/// An API-level failure carried inside a 200 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFailure {
    pub code: i32,
    pub msg: String,
}

impl<T> TuyaResponse<T> {
    /// `Ok(payload)` on success; `Err(Some(failure))` for an API error and
    /// `Err(None)` when `success` is true but `result` is missing.
    pub fn into_result(self) -> Result<T, Option<ApiFailure>> {
        if self.success {
            self.result.ok_or(None)
        } else {
            Err(Some(ApiFailure {
                code: self.code.unwrap_or(-1),
                msg: self.msg.unwrap_or_else(|| "(no message)".to_owned()),
            }))
        }
    }

    /// Maps the envelope onto [`DeviceError`], recognising token expiry.
    pub fn into_device_result(self, what: &str) -> Result<T, DeviceError> {
        self.into_result().map_err(|failure| match failure {
            Some(f) if f.code == TOKEN_EXPIRED_CODE => DeviceError::TokenExpired,
            Some(f) => DeviceError::Api { code: f.code, msg: f.msg },
            None => DeviceError::Decode(format!("{what}: success=true but result field is missing")),
        })
    }
}

// ---------------------------------------------------------------------------
// DpValue
//
// DP values are polymorphic; Bool MUST come before Integer in the untagged
// enum so JSON booleans are not coerced.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DpValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl DpValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DpValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DpValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for DpValue {
    fn from(v: bool) -> Self {
        DpValue::Bool(v)
    }
}

// ---------------------------------------------------------------------------
// Token: GET /v1.0/token?grant_type=1
// ---------------------------------------------------------------------------

pub type TokenResponse = TuyaResponse<TokenResult>;

#[derive(Debug, Deserialize)]
pub struct TokenResult {
    pub access_token: String,

    /// Validity period in seconds. Some API regions omit it.
    pub expire_time: Option<i64>,

    pub refresh_token: Option<String>,

    pub uid: Option<String>,
}

// ---------------------------------------------------------------------------
// Device status: GET /v1.0/devices/{device_id}/status
// ---------------------------------------------------------------------------

pub type DeviceStatusResponse = TuyaResponse<Vec<DeviceProperty>>;

#[derive(Debug, Deserialize)]
pub struct DeviceProperty {
    /// DP code, e.g. `"switch_1"`, `"cur_power"`.
    pub code: String,
    pub value: DpValue,
}

// ---------------------------------------------------------------------------
// Send commands: POST /v1.0/devices/{device_id}/commands
// ---------------------------------------------------------------------------

pub type SendCommandResponse = TuyaResponse<bool>;

#[derive(Debug, Serialize)]
pub struct SendCommandRequest {
    pub commands: Vec<Command>,
}

#[derive(Debug, Serialize)]
pub struct Command {
    pub code: String,
    pub value: DpValue,
}

impl Command {
    pub fn switch(on: bool) -> Self {
        Self {
            code: SWITCH_DP.to_owned(),
            value: on.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Smart plug
//
// Observed DPs (device_status, v1 endpoint):
//   switch_1      bool    relay on/off
//   cur_voltage   i64     2345 = 234.5 V   (÷10)
//   cur_current   i64      120 = 0.120 A   (mA, ÷1000)
//   cur_power     i64      300 = 30.0 W    (÷10)
//   add_ele, countdown_1, relay_status ... (not mapped)
// ---------------------------------------------------------------------------

pub const SWITCH_DP: &str = "switch_1";

/// Raw plug reading, before unit conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlugStatus {
    pub switch: bool,
    /// Decivolts.
    pub cur_voltage: i64,
    /// Milliamps.
    pub cur_current: i64,
    /// Deciwatts.
    pub cur_power: i64,
}

impl PlugStatus {
    pub fn into_telemetry(self, observed_at: DateTime<Utc>) -> Telemetry {
        Telemetry {
            voltage: self.cur_voltage as f64 / 10.0,
            current: self.cur_current as f64 / 1000.0,
            power: self.cur_power as f64 / 10.0,
            device_reported_on: self.switch,
            observed_at,
        }
    }
}

impl TryFrom<&[DeviceProperty]> for PlugStatus {
    type Error = DeviceError;

    /// `switch_1` is required; electrical DPs read as 0 when the plug does
    /// not report them (e.g. models without metering).
    fn try_from(dps: &[DeviceProperty]) -> Result<Self, DeviceError> {
        let get = |code: &str| dps.iter().find(|dp| dp.code == code);
        let number = |code: &str| get(code).and_then(|dp| dp.value.as_i64()).unwrap_or(0);

        let switch = get(SWITCH_DP)
            .and_then(|dp| dp.value.as_bool())
            .ok_or_else(|| DeviceError::Decode(format!("plug: missing required DP '{SWITCH_DP}'")))?;

        Ok(Self {
            switch,
            cur_voltage: number("cur_voltage"),
            cur_current: number("cur_current"),
            cur_power: number("cur_power"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plug_dps() -> Vec<DeviceProperty> {
        serde_json::from_str(
            r#"[
            {"code":"switch_1","value":true},
            {"code":"countdown_1","value":0},
            {"code":"add_ele","value":12},
            {"code":"cur_current","value":120},
            {"code":"cur_power","value":300},
            {"code":"cur_voltage","value":2345},
            {"code":"relay_status","value":"last"}
        ]"#,
        )
        .unwrap()
    }

    #[test]
    fn dpvalue_variants_deserialize() {
        let b: DpValue = serde_json::from_str("true").unwrap();
        assert_eq!(b.as_bool(), Some(true));
        assert_eq!(b.as_i64(), None);

        let i: DpValue = serde_json::from_str("2345").unwrap();
        assert_eq!(i.as_i64(), Some(2345));
        assert_eq!(i.as_bool(), None);

        let s: DpValue = serde_json::from_str(r#""last""#).unwrap();
        assert_eq!(s, DpValue::Text("last".into()));
    }

    #[test]
    fn plug_dps_convert_to_telemetry() {
        let status = PlugStatus::try_from(plug_dps().as_slice()).unwrap();
        let t = status.into_telemetry(Utc::now());

        assert!((t.voltage - 234.5).abs() < 1e-9);
        assert!((t.current - 0.120).abs() < 1e-9);
        assert!((t.power - 30.0).abs() < 1e-9);
        assert!(t.device_reported_on);
        assert!(t.load_active());
    }

    #[test]
    fn missing_switch_is_a_decode_error() {
        let dps: Vec<DeviceProperty> =
            serde_json::from_str(r#"[{"code":"cur_power","value":300}]"#).unwrap();
        let err = PlugStatus::try_from(dps.as_slice()).unwrap_err();
        assert!(err.to_string().contains("switch_1"));
    }

    #[test]
    fn missing_metering_dps_read_as_zero() {
        let dps: Vec<DeviceProperty> =
            serde_json::from_str(r#"[{"code":"switch_1","value":false}]"#).unwrap();
        let status = PlugStatus::try_from(dps.as_slice()).unwrap();
        assert_eq!(status.cur_power, 0);
        assert!(!status.into_telemetry(Utc::now()).load_active());
    }

    #[test]
    fn envelope_maps_token_expiry() {
        let resp: DeviceStatusResponse = serde_json::from_str(
            r#"{"success":false,"t":1561348644346,"code":1010,"msg":"token invalid","tid":"x"}"#,
        )
        .unwrap();
        assert!(resp.into_device_result("status").unwrap_err().is_token_expired());
    }

    #[test]
    fn envelope_maps_other_api_errors() {
        let resp: SendCommandResponse = serde_json::from_str(
            r#"{"success":false,"t":1,"code":2008,"msg":"command or value not support"}"#,
        )
        .unwrap();
        let err = resp.into_device_result("commands").unwrap_err();
        assert!(matches!(err, DeviceError::Api { code: 2008, .. }));
    }

    #[test]
    fn envelope_success_without_result_is_decode_error() {
        let resp: SendCommandResponse = serde_json::from_str(r#"{"success":true,"t":1}"#).unwrap();
        assert!(matches!(resp.into_device_result("commands"), Err(DeviceError::Decode(_))));
    }

    #[test]
    fn token_result_tolerates_missing_expiry() {
        let resp: TokenResponse = serde_json::from_str(
            r#"{"success":true,"t":1,"result":{"access_token":"abc"}}"#,
        )
        .unwrap();
        let token = resp.into_result().unwrap();
        assert_eq!(token.access_token, "abc");
        assert_eq!(token.expire_time, None);
    }

    #[test]
    fn switch_command_serializes_as_expected() {
        let body = SendCommandRequest { commands: vec![Command::switch(true)] };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"commands":[{"code":"switch_1","value":true}]}"#
        );
    }
}
