use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorValue {
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub sensors: BTreeMap<String, SensorValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandMessage {
    #[serde(rename = "commandID")]
    pub command_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    #[serde(rename = "commandID")]
    pub command_id: String,
    pub status: &'static str,
    pub result: Value,
}

fn sensor(value: f64, unit: &str) -> SensorValue {
    SensorValue {
        value,
        unit: unit.to_string(),
    }
}

pub fn generate_telemetry(rng: &mut impl Rng, device_id: String) -> Telemetry {
    let mut sensors = BTreeMap::new();

    let pm25 = if rng.gen_bool(0.05) {
        rng.gen_range(150.0..1200.0) // 5% smoke events, some past the sanity limit
    } else {
        rng.gen_range(5.0..60.0)
    };
    sensors.insert("pm25".to_string(), sensor(pm25, "μg/m³"));
    sensors.insert("co2".to_string(), sensor(rng.gen_range(400.0..1800.0), "ppm"));
    sensors.insert("co".to_string(), sensor(rng.gen_range(0.0..9.0), "ppm"));
    sensors.insert(
        "temperature".to_string(),
        sensor(rng.gen_range(15.0..35.0), "°C"),
    );

    let humidity = if rng.gen_bool(0.02) {
        rng.gen_range(100.0..120.0) // 2% faulty hygrometer
    } else {
        rng.gen_range(30.0..80.0)
    };
    sensors.insert("humidity".to_string(), sensor(humidity, "%"));

    if rng.gen_bool(0.01) {
        // newer firmware field the bridge does not know yet
        sensors.insert("voc".to_string(), sensor(rng.gen_range(0.0..500.0), "ppb"));
    }

    Telemetry {
        timestamp: Utc::now(),
        device_id,
        sensors,
    }
}

/// Builds the reply a device would send for `command`.
pub fn respond(command: &CommandMessage) -> CommandResponse {
    let (status, result) = match command.action.as_str() {
        "calibrate" => (
            "success",
            serde_json::json!({
                "calibrated": command.params.get("targetSensor").cloned().unwrap_or(Value::Null)
            }),
        ),
        "reboot" | "ping" => ("success", serde_json::json!({"uptime": 0})),
        "set_interval" => (
            "success",
            serde_json::json!({
                "interval": command.params.get("seconds").cloned().unwrap_or(Value::Null)
            }),
        ),
        other => ("error", serde_json::json!({"message": format!("unsupported action {}", other)})),
    };

    CommandResponse {
        command_id: command.command_id.clone(),
        status,
        result,
    }
}
