use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of field sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Humidity,
    SoilMoisture,
    LightIntensity,
}

impl SensorType {
    pub const ALL: [SensorType; 4] = [
        SensorType::Temperature,
        SensorType::Humidity,
        SensorType::SoilMoisture,
        SensorType::LightIntensity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::SoilMoisture => "soil_moisture",
            SensorType::LightIntensity => "light_intensity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Inclusive physical range accepted for a reading of this type.
    pub fn value_range(&self) -> (f64, f64) {
        match self {
            SensorType::Temperature => (-50.0, 100.0),
            SensorType::Humidity => (0.0, 100.0),
            SensorType::SoilMoisture => (0.0, 100.0),
            SensorType::LightIntensity => (0.0, 200_000.0),
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Active,
    Inactive,
    Maintenance,
}

impl SensorStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SensorStatus::Active),
            "inactive" => Some(SensorStatus::Inactive),
            "maintenance" => Some(SensorStatus::Maintenance),
            _ => None,
        }
    }
}

/// Where a sensor is installed.
///
/// `Coordinates` is the canonical form. `Named` is the legacy flat string
/// form, still accepted and echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Location {
    Coordinates { latitude: f64, longitude: f64 },
    Named(String),
}

/// Reading as submitted by a device, before the pipeline stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub sensor_id: String,
    pub sensor_type: SensorType,
    pub location: Option<Location>,
    pub value: f64,
    pub unit: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: SensorStatus,
    pub battery_level: f64,
}

/// Stored, immutable sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    #[serde(rename = "type")]
    pub sensor_type: SensorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub status: SensorStatus,
    pub battery_level: f64,
    pub received_at: DateTime<Utc>,
}

/// Registration request for a sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSensor {
    pub id: String,
    pub sensor_type: SensorType,
    pub location: Location,
    pub status: SensorStatus,
    pub owner: Option<String>,
    pub calibration_offset: f64,
}

/// Sensor as exposed by the API: registry record merged with the latest
/// ingested snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: String,
    #[serde(rename = "type")]
    pub sensor_type: SensorType,
    pub location: Location,
    pub status: SensorStatus,
    pub battery_level: Option<f64>,
    pub last_reading: Option<DateTime<Utc>>,
    pub last_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub calibration_offset: f64,
    pub registered_at: DateTime<Utc>,
}

/// What the device registry knows about a sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub sensor_id: String,
    pub sensor_type: SensorType,
    pub owner: Option<String>,
    pub calibration_offset: f64,
}

/// Ingest acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReceipt {
    pub accepted: bool,
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub stored_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneState {
    Inactive,
    Active,
    Paused,
}

/// Recurring watering plan for a zone, evaluated in UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub days_of_week: Vec<Weekday>,
    pub enabled: bool,
    pub water_flow_rate: f64,
}

/// Snapshot of one irrigation zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationZone {
    pub zone_id: String,
    pub state: ZoneState,
    pub current_flow_rate: f64,
    pub total_water_used: f64,
    pub last_activated: Option<DateTime<Utc>>,
    pub auto_stop_at: Option<DateTime<Utc>>,
    pub schedule: Option<Schedule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Manual,
    AutoStop,
}

/// A closed activation interval of a zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivationRecord {
    pub zone_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub active_seconds: f64,
    pub flow_rate: f64,
    pub water_used: f64,
    pub trigger: Trigger,
    pub end_reason: EndReason,
}

/// REST API page wrapper
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total_count: usize,
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_time_of_day(&raw).ok_or_else(|| serde::de::Error::custom("expected HH:MM"))
    }
}

/// Parses `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_accepts_both_forms() {
        let nested: Location =
            serde_json::from_str(r#"{"latitude": 52.1, "longitude": 5.2}"#).unwrap();
        assert_eq!(
            nested,
            Location::Coordinates {
                latitude: 52.1,
                longitude: 5.2
            }
        );

        let legacy: Location = serde_json::from_str(r#""north-field""#).unwrap();
        assert_eq!(legacy, Location::Named("north-field".to_string()));
    }

    #[test]
    fn test_schedule_time_format() {
        let schedule: Schedule = serde_json::from_str(
            r#"{"start_time":"06:30","duration_minutes":20,"days_of_week":["Mon","Thu"],"enabled":true,"water_flow_rate":1.5}"#,
        )
        .unwrap();
        assert_eq!(schedule.start_time, NaiveTime::from_hms_opt(6, 30, 0).unwrap());
        assert_eq!(schedule.days_of_week, vec![Weekday::Mon, Weekday::Thu]);

        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["start_time"], "06:30");
    }

    #[test]
    fn test_sensor_type_names() {
        for t in SensorType::ALL {
            assert_eq!(SensorType::parse(t.as_str()), Some(t));
        }
        assert_eq!(SensorType::parse("pressure"), None);
    }
}
