use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Command identifiers are time-ordered UUIDs (v7).
pub type CommandId = Uuid;

/// Opaque per-action parameters; shape is validated by the device.
pub type Params = Map<String, Value>;

/// A physical unit registered to a user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Measurement kinds the ingestion pipeline knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementKind {
    Pm25,
    Co2,
    Co,
    Temperature,
    Humidity,
}

impl MeasurementKind {
    pub const ALL: [MeasurementKind; 5] = [
        MeasurementKind::Pm25,
        MeasurementKind::Co2,
        MeasurementKind::Co,
        MeasurementKind::Temperature,
        MeasurementKind::Humidity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementKind::Pm25 => "pm25",
            MeasurementKind::Co2 => "co2",
            MeasurementKind::Co => "co",
            MeasurementKind::Temperature => "temperature",
            MeasurementKind::Humidity => "humidity",
        }
    }
}

impl FromStr for MeasurementKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MeasurementKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub unit: String,
}

/// One validated telemetry snapshot. Append-only: never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: Uuid,
    pub device_id: String,
    /// Capture time as reported by the device.
    pub timestamp: DateTime<Utc>,
    pub sensors: BTreeMap<MeasurementKind, Measurement>,
}

/// Telemetry as published by a device, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTelemetry {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "deviceID", default)]
    pub device_id: Option<String>,
    /// Kept untyped so an unfamiliar kind cannot fail the whole message.
    #[serde(default)]
    pub sensors: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMeasurement {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Success,
    Error,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Success => "success",
            CommandStatus::Error => "error",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons recorded on commands that end in `error` without a device verdict.
pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_DEVICE_ERROR: &str = "device reported error";

/// Terminal result of a command. Only terminal states can be expressed,
/// so a transition back to `pending` cannot be requested.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { result: Option<Value> },
    Failed { reason: String, result: Option<Value> },
}

impl Outcome {
    pub fn timeout() -> Self {
        Outcome::Failed {
            reason: REASON_TIMEOUT.to_string(),
            result: None,
        }
    }

    pub fn status(&self) -> CommandStatus {
        match self {
            Outcome::Success { .. } => CommandStatus::Success,
            Outcome::Failed { .. } => CommandStatus::Error,
        }
    }

    /// Label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Failed { reason, .. } if reason == REASON_TIMEOUT => "timeout",
            Outcome::Failed { .. } => "error",
        }
    }
}

/// A unit of remote-control work addressed to one device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(rename = "commandID")]
    pub command_id: CommandId,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub action: String,
    pub params: Params,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub expires_at: DateTime<Utc>,
}

/// Backend-to-device command payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    #[serde(rename = "commandID")]
    pub command_id: CommandId,
    pub action: String,
    pub params: Params,
}

impl From<&Command> for CommandMessage {
    fn from(command: &Command) -> Self {
        Self {
            command_id: command.command_id,
            action: command.action.clone(),
            params: command.params.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Device-to-backend command response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(rename = "commandID", default)]
    pub command_id: Option<String>,
    pub status: ResponseStatus,
    #[serde(default)]
    pub result: Option<Value>,
}

/// Body of a submit-command request.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitCommand {
    pub action: String,
    #[serde(default)]
    pub params: Params,
}

/// Reply to a submit-command request.
#[derive(Debug, Clone, Serialize)]
pub struct CommandAccepted {
    #[serde(rename = "commandID")]
    pub command_id: CommandId,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&Command> for CommandAccepted {
    fn from(command: &Command) -> Self {
        Self {
            command_id: command.command_id,
            status: command.status,
            reason: command.reason.clone(),
        }
    }
}

/// Filter for reading history queries.
#[derive(Debug, Clone, Default)]
pub struct ReadingFilter {
    /// Only readings from devices owned by this user are visible.
    pub user_id: String,
    pub device_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub data: Vec<SensorReading>,
    /// Matching readings across all pages.
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_kind_names() {
        for kind in MeasurementKind::ALL {
            assert_eq!(kind.as_str().parse::<MeasurementKind>(), Ok(kind));
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                Value::String(kind.to_string())
            );
        }
        assert!("radon".parse::<MeasurementKind>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(CommandStatus::Success.is_terminal());
        assert!(CommandStatus::Error.is_terminal());
    }

    #[test]
    fn test_command_serializes_wire_names_and_hides_deadline() {
        let now = Utc::now();
        let command = Command {
            command_id: Uuid::now_v7(),
            device_id: "d1".to_string(),
            action: "calibrate".to_string(),
            params: Params::new(),
            status: CommandStatus::Pending,
            result: None,
            reason: None,
            created_at: now,
            updated_at: now,
            expires_at: now,
        };

        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["commandID"], command.command_id.to_string());
        assert_eq!(json["deviceID"], "d1");
        assert_eq!(json["status"], "pending");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("expiresAt").is_none());
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_response_message_parses() {
        let msg: ResponseMessage = serde_json::from_str(
            r#"{"commandID":"abc","status":"error","result":{"code":3}}"#,
        )
        .unwrap();
        assert_eq!(msg.command_id.as_deref(), Some("abc"));
        assert_eq!(msg.status, ResponseStatus::Error);
        assert_eq!(msg.result.unwrap()["code"], 3);

        assert!(serde_json::from_str::<ResponseMessage>(r#"{"status":"maybe"}"#).is_err());
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(Outcome::timeout().label(), "timeout");
        assert_eq!(Outcome::timeout().status(), CommandStatus::Error);
        assert_eq!(Outcome::Success { result: None }.label(), "success");
    }
}
