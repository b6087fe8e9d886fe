use crate::errors::{Error, Result};
use crate::metrics::UNKNOWN_MEASUREMENTS_TOTAL;
use crate::model::{Measurement, MeasurementKind, RawMeasurement, RawTelemetry, SensorReading};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

/// Sanity range and accepted unit labels for one measurement kind.
#[derive(Debug, Clone, Copy)]
pub struct SensorLimits {
    pub min: f64,
    pub max: f64,
    pub units: &'static [&'static str],
}

const PM25: SensorLimits = SensorLimits {
    min: 0.0,
    max: 1000.0,
    units: &["μg/m³", "µg/m³", "ug/m3"],
};
const CO2: SensorLimits = SensorLimits {
    min: 0.0,
    max: 10000.0,
    units: &["ppm"],
};
const CO: SensorLimits = SensorLimits {
    min: 0.0,
    max: 1000.0,
    units: &["ppm"],
};
const TEMPERATURE: SensorLimits = SensorLimits {
    min: -50.0,
    max: 100.0,
    units: &["°C", "C"],
};
const HUMIDITY: SensorLimits = SensorLimits {
    min: 0.0,
    max: 100.0,
    units: &["%", "%RH"],
};

pub fn limits(kind: MeasurementKind) -> SensorLimits {
    match kind {
        MeasurementKind::Pm25 => PM25,
        MeasurementKind::Co2 => CO2,
        MeasurementKind::Co => CO,
        MeasurementKind::Temperature => TEMPERATURE,
        MeasurementKind::Humidity => HUMIDITY,
    }
}

/// Validates raw telemetry and normalizes it into a reading.
///
/// Unknown measurement kinds are dropped with a warning so newer firmware
/// does not get rejected wholesale. Values and units are kept verbatim.
pub fn validate(raw: RawTelemetry) -> Result<SensorReading> {
    let device_id = match raw.device_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => return Err(Error::Validation("Device ID cannot be empty".to_string())),
    };

    let timestamp = parse_timestamp(raw.timestamp.as_deref())?;

    let mut sensors = BTreeMap::new();
    for (name, entry) in raw.sensors {
        let Ok(kind) = name.parse::<MeasurementKind>() else {
            warn!(device_id = %device_id, kind = %name, "Dropping unknown measurement kind");
            UNKNOWN_MEASUREMENTS_TOTAL.inc();
            continue;
        };

        let measurement: RawMeasurement = serde_json::from_value(entry)
            .map_err(|e| Error::Validation(format!("{} is malformed: {}", kind, e)))?;
        let value = measurement
            .value
            .ok_or_else(|| Error::Validation(format!("{} has no value", kind)))?;
        let unit = measurement
            .unit
            .ok_or_else(|| Error::Validation(format!("{} has no unit", kind)))?;

        check_measurement(kind, value, &unit)?;
        sensors.insert(kind, Measurement { value, unit });
    }

    if sensors.is_empty() {
        return Err(Error::Validation(
            "Reading contains no known measurements".to_string(),
        ));
    }

    Ok(SensorReading {
        id: Uuid::new_v4(),
        device_id,
        timestamp,
        sensors,
    })
}

fn parse_timestamp(raw: Option<&str>) -> Result<DateTime<Utc>> {
    let raw = raw.ok_or_else(|| Error::Validation("Timestamp is missing".to_string()))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("Timestamp {:?} is not RFC 3339: {}", raw, e)))
}

fn check_measurement(kind: MeasurementKind, value: f64, unit: &str) -> Result<()> {
    let limits = limits(kind);

    if !value.is_finite() {
        return Err(Error::Validation(format!("{} value is not finite", kind)));
    }

    if value < limits.min || value > limits.max {
        return Err(Error::Validation(format!(
            "{} {} out of range [{}, {}]",
            kind, value, limits.min, limits.max
        )));
    }

    if !limits.units.contains(&unit) {
        return Err(Error::Validation(format!(
            "{} unit {:?} not one of {:?}",
            kind, unit, limits.units
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(device_id: &str, sensors: &[(&str, f64, &str)]) -> RawTelemetry {
        RawTelemetry {
            timestamp: Some("2025-10-30T08:00:00Z".to_string()),
            device_id: Some(device_id.to_string()),
            sensors: sensors
                .iter()
                .map(|(kind, value, unit)| (kind.to_string(), json!({"value": value, "unit": unit})))
                .collect(),
        }
    }

    #[test]
    fn test_valid_reading_keeps_values_and_units() {
        let reading = validate(raw(
            "d1",
            &[("pm25", 25.5, "μg/m³"), ("co2", 450.0, "ppm")],
        ))
        .unwrap();

        assert_eq!(reading.device_id, "d1");
        assert_eq!(reading.sensors.len(), 2);
        let pm25 = &reading.sensors[&MeasurementKind::Pm25];
        assert_eq!(pm25.value, 25.5);
        assert_eq!(pm25.unit, "μg/m³");
        let co2 = &reading.sensors[&MeasurementKind::Co2];
        assert_eq!(co2.value, 450.0);
        assert_eq!(co2.unit, "ppm");
        assert_eq!(reading.timestamp.to_rfc3339(), "2025-10-30T08:00:00+00:00");
    }

    #[test]
    fn test_humidity_out_of_range() {
        assert!(matches!(
            validate(raw("d1", &[("humidity", 250.0, "%")])),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_non_finite_values() {
        assert!(check_measurement(MeasurementKind::Temperature, f64::NAN, "°C").is_err());
        assert!(check_measurement(MeasurementKind::Co, f64::INFINITY, "ppm").is_err());
        assert!(check_measurement(MeasurementKind::Co, 3.0, "ppm").is_ok());
    }

    #[test]
    fn test_empty_device_id() {
        assert!(validate(raw("", &[("co2", 400.0, "ppm")])).is_err());
        assert!(validate(raw("   ", &[("co2", 400.0, "ppm")])).is_err());

        let mut missing = raw("d1", &[("co2", 400.0, "ppm")]);
        missing.device_id = None;
        assert!(validate(missing).is_err());
    }

    #[test]
    fn test_bad_timestamps() {
        let mut missing = raw("d1", &[("co2", 400.0, "ppm")]);
        missing.timestamp = None;
        assert!(validate(missing).is_err());

        let mut garbled = raw("d1", &[("co2", 400.0, "ppm")]);
        garbled.timestamp = Some("yesterday-ish".to_string());
        assert!(validate(garbled).is_err());
    }

    #[test]
    fn test_timestamp_offset_is_normalized_to_utc() {
        let mut reading = raw("d1", &[("co2", 400.0, "ppm")]);
        reading.timestamp = Some("2025-10-30T15:00:00+07:00".to_string());
        let reading = validate(reading).unwrap();
        assert_eq!(reading.timestamp.to_rfc3339(), "2025-10-30T08:00:00+00:00");
    }

    #[test]
    fn test_unknown_kind_is_dropped() {
        let reading = validate(raw(
            "d1",
            &[("co2", 410.0, "ppm"), ("radon", 12.0, "Bq/m³")],
        ))
        .unwrap();

        assert_eq!(reading.sensors.len(), 1);
        assert!(reading.sensors.contains_key(&MeasurementKind::Co2));
    }

    #[test]
    fn test_only_unknown_kinds_is_rejected() {
        assert!(validate(raw("d1", &[("radon", 12.0, "Bq/m³")])).is_err());
    }

    #[test]
    fn test_unexpected_unit() {
        assert!(validate(raw("d1", &[("temperature", 70.0, "°F")])).is_err());
    }

    #[test]
    fn test_missing_value_or_unit() {
        let mut reading = raw("d1", &[]);
        reading
            .sensors
            .insert("co2".to_string(), json!({"unit": "ppm"}));
        assert!(validate(reading).is_err());

        let mut reading = raw("d1", &[]);
        reading.sensors.insert("co2".to_string(), json!({"value": 400}));
        assert!(validate(reading).is_err());
    }

    #[test]
    fn test_malformed_unknown_kinds_do_not_sink_the_reading() {
        let raw: RawTelemetry = serde_json::from_value(json!({
            "timestamp": "2025-10-30T08:00:00Z",
            "deviceID": "d1",
            "sensors": {
                "co2": {"value": 450, "unit": "ppm"},
                "voc": {"value": "n/a", "unit": "ppb"},
                "aqi": {"value": 42, "unit": 7},
                "fw": "2.1"
            }
        }))
        .unwrap();

        let reading = validate(raw).unwrap();
        assert_eq!(reading.sensors.len(), 1);
        assert_eq!(reading.sensors[&MeasurementKind::Co2].value, 450.0);
    }

    #[test]
    fn test_malformed_known_kind_is_rejected() {
        let entries = [
            json!({"value": "n/a", "unit": "ppm"}),
            json!("450"),
            json!({"value": 450, "unit": 7}),
        ];
        for entry in entries {
            let mut reading = raw("d1", &[("pm25", 12.0, "μg/m³")]);
            reading.sensors.insert("co2".to_string(), entry);
            assert!(matches!(validate(reading), Err(Error::Validation(_))));
        }
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        assert!(validate(raw("d1", &[("humidity", 0.0, "%"), ("co", 1000.0, "ppm")])).is_ok());
    }
}
