use crate::errors::{Error, FieldError, Result};
use crate::model::{
    parse_time_of_day, Location, NewReading, NewSensor, Schedule, SensorStatus, SensorType,
};
use chrono::{DateTime, Utc, Weekday};
use serde_json::{Map, Value};

const BATTERY_MIN: f64 = 0.0;
const BATTERY_MAX: f64 = 100.0;
const LATITUDE_MAX: f64 = 90.0;
const LONGITUDE_MAX: f64 = 180.0;
const MAX_DURATION_MINUTES: u64 = 24 * 60;

/// Collects every offending field of a JSON object instead of stopping at
/// the first one.
struct FieldReader<'a> {
    obj: &'a Map<String, Value>,
    errors: Vec<FieldError>,
}

impl<'a> FieldReader<'a> {
    fn new(value: &'a Value) -> Result<Self> {
        match value.as_object() {
            Some(obj) => Ok(Self {
                obj,
                errors: Vec::new(),
            }),
            None => Err(Error::validation("body must be a JSON object")),
        }
    }

    fn fail(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError::new(field, message));
    }

    fn present(&mut self, field: &str, required: bool) -> Option<&'a Value> {
        match self.obj.get(field) {
            Some(Value::Null) | None => {
                if required {
                    self.fail(field, "is required");
                }
                None
            }
            Some(v) => Some(v),
        }
    }

    fn string(&mut self, field: &str, required: bool) -> Option<String> {
        match self.present(field, required)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::String(_) => {
                self.fail(field, "must not be empty");
                None
            }
            _ => {
                self.fail(field, "must be a string");
                None
            }
        }
    }

    fn number(&mut self, field: &str, required: bool) -> Option<f64> {
        match self.present(field, required)?.as_f64() {
            Some(n) if n.is_finite() => Some(n),
            _ => {
                self.fail(field, "must be a finite number");
                None
            }
        }
    }

    fn unsigned(&mut self, field: &str, required: bool) -> Option<u64> {
        let value = self.present(field, required)?;
        match value.as_u64() {
            Some(n) => Some(n),
            None => {
                self.fail(field, "must be a non-negative integer");
                None
            }
        }
    }

    fn boolean(&mut self, field: &str) -> Option<bool> {
        match self.present(field, false)? {
            Value::Bool(b) => Some(*b),
            _ => {
                self.fail(field, "must be a boolean");
                None
            }
        }
    }

    fn timestamp(&mut self, field: &str) -> Option<DateTime<Utc>> {
        let raw = self.string(field, false)?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(_) => {
                self.fail(field, "must be an RFC 3339 timestamp");
                None
            }
        }
    }

    fn sensor_type(&mut self, field: &str) -> Option<SensorType> {
        let raw = self.string(field, true)?;
        let parsed = SensorType::parse(&raw);
        if parsed.is_none() {
            self.fail(
                field,
                "must be one of temperature, humidity, soil_moisture, light_intensity",
            );
        }
        parsed
    }

    fn status(&mut self, field: &str, required: bool) -> Option<SensorStatus> {
        let raw = self.string(field, required)?;
        let parsed = SensorStatus::parse(&raw);
        if parsed.is_none() {
            self.fail(field, "must be one of active, inactive, maintenance");
        }
        parsed
    }

    fn location(&mut self, field: &str, required: bool) -> Option<Location> {
        let value = self.present(field, required)?;
        match serde_json::from_value::<Location>(value.clone()) {
            Ok(Location::Coordinates {
                latitude,
                longitude,
            }) if latitude.abs() > LATITUDE_MAX || longitude.abs() > LONGITUDE_MAX => {
                self.fail(field, "coordinates out of range");
                None
            }
            Ok(Location::Named(name)) if name.trim().is_empty() => {
                self.fail(field, "must not be empty");
                None
            }
            Ok(location) => Some(location),
            Err(_) => {
                self.fail(field, "must be {latitude, longitude} or a location name");
                None
            }
        }
    }

    fn finish(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_fields(self.errors))
        }
    }
}

/// Parses a reading payload, reporting every missing or mistyped field.
pub fn parse_reading(value: &Value) -> Result<NewReading> {
    let mut r = FieldReader::new(value)?;
    let sensor_id = r.string("sensor_id", true);
    let sensor_type = r.sensor_type("type");
    let location = r.location("location", false);
    let reading_value = r.number("value", true);
    let unit = r.string("unit", true);
    let timestamp = r.timestamp("timestamp");
    let status = r.status("status", false);
    let battery_level = r.number("battery_level", true);

    if let (Some(sensor_type), Some(value)) = (sensor_type, reading_value) {
        check_value(&mut r.errors, sensor_type, value);
    }
    if let Some(battery_level) = battery_level {
        check_battery(&mut r.errors, battery_level);
    }

    match (sensor_id, sensor_type, reading_value, unit, battery_level) {
        (Some(sensor_id), Some(sensor_type), Some(value), Some(unit), Some(battery_level))
            if r.errors.is_empty() =>
        {
            Ok(NewReading {
                sensor_id,
                sensor_type,
                location,
                value,
                unit,
                timestamp,
                status: status.unwrap_or(SensorStatus::Active),
                battery_level,
            })
        }
        _ => Err(r.finish().err().unwrap_or_else(|| Error::validation("invalid reading"))),
    }
}

fn check_value(errors: &mut Vec<FieldError>, sensor_type: SensorType, value: f64) {
    let (min, max) = sensor_type.value_range();
    if !value.is_finite() || value < min || value > max {
        errors.push(FieldError::new(
            "value",
            format!("{} {} out of range [{}, {}]", sensor_type, value, min, max),
        ));
    }
}

fn check_battery(errors: &mut Vec<FieldError>, battery_level: f64) {
    if !(BATTERY_MIN..=BATTERY_MAX).contains(&battery_level) {
        errors.push(FieldError::new(
            "battery_level",
            format!(
                "Battery {} out of range [{}, {}]",
                battery_level, BATTERY_MIN, BATTERY_MAX
            ),
        ));
    }
}

/// Range checks on a typed reading.
pub fn validate_reading(reading: &NewReading) -> Result<()> {
    let mut errors = Vec::new();

    if reading.sensor_id.trim().is_empty() {
        errors.push(FieldError::new("sensor_id", "must not be empty"));
    }
    check_value(&mut errors, reading.sensor_type, reading.value);
    check_battery(&mut errors, reading.battery_level);
    if reading.unit.trim().is_empty() {
        errors.push(FieldError::new("unit", "must not be empty"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::invalid_fields(errors))
    }
}

/// Parses a sensor registration payload.
pub fn parse_new_sensor(value: &Value) -> Result<NewSensor> {
    let mut r = FieldReader::new(value)?;
    let id = r.string("id", true);
    let sensor_type = r.sensor_type("type");
    let location = r.location("location", true);
    let status = r.status("status", false);
    let owner = r.string("owner", false);
    let calibration_offset = r.number("calibration_offset", false);

    match (id, sensor_type, location) {
        (Some(id), Some(sensor_type), Some(location)) if r.errors.is_empty() => Ok(NewSensor {
            id,
            sensor_type,
            location,
            status: status.unwrap_or(SensorStatus::Active),
            owner,
            calibration_offset: calibration_offset.unwrap_or(0.0),
        }),
        _ => Err(r.finish().err().unwrap_or_else(|| Error::validation("invalid sensor"))),
    }
}

/// Fills a reading's `sensor_id` from the addressed sensor (topic or URL
/// path) and rejects a payload that names a different one.
pub fn bind_sensor_id(value: &mut Value, sensor_id: &str) -> Result<()> {
    let Some(obj) = value.as_object_mut() else {
        return Err(Error::validation("body must be a JSON object"));
    };
    match obj.get("sensor_id") {
        None | Some(Value::Null) => {
            obj.insert("sensor_id".to_string(), Value::String(sensor_id.to_string()));
            Ok(())
        }
        Some(Value::String(s)) if s == sensor_id => Ok(()),
        Some(_) => Err(Error::invalid_fields(vec![FieldError::new(
            "sensor_id",
            format!("must match addressed sensor {}", sensor_id),
        )])),
    }
}

/// Body of `POST /v1/irrigation/start`.
#[derive(Debug, Clone, PartialEq)]
pub struct StartCommand {
    pub zone: String,
    pub duration_minutes: u32,
    pub water_flow_rate: f64,
}

pub fn parse_start(value: &Value) -> Result<StartCommand> {
    let mut r = FieldReader::new(value)?;
    let zone = r.string("zone", true);
    let duration = r.unsigned("duration_minutes", true);
    let flow = r.number("water_flow_rate", true);

    if let Some(d) = duration {
        if d == 0 || d > MAX_DURATION_MINUTES {
            r.fail(
                "duration_minutes",
                format!("must be between 1 and {}", MAX_DURATION_MINUTES),
            );
        }
    }
    if let Some(f) = flow {
        if f <= 0.0 {
            r.fail("water_flow_rate", "must be greater than 0");
        }
    }

    match (zone, duration, flow) {
        (Some(zone), Some(duration), Some(flow)) if r.errors.is_empty() => Ok(StartCommand {
            zone,
            duration_minutes: duration as u32,
            water_flow_rate: flow,
        }),
        _ => Err(r.finish().err().unwrap_or_else(|| Error::validation("invalid command"))),
    }
}

/// Bodies of stop/pause/resume: just the zone id.
pub fn parse_zone(value: &Value) -> Result<String> {
    let mut r = FieldReader::new(value)?;
    let zone = r.string("zone", true);
    r.finish()?;
    zone.ok_or_else(|| Error::validation("zone is required"))
}

pub fn parse_schedule(value: &Value) -> Result<Schedule> {
    let mut r = FieldReader::new(value)?;

    let start_time = r.string("start_time", true).and_then(|raw| {
        let parsed = parse_time_of_day(&raw);
        if parsed.is_none() {
            r.fail("start_time", "must be HH:MM");
        }
        parsed
    });
    let duration = r.unsigned("duration_minutes", true);
    if let Some(d) = duration {
        if d == 0 || d > MAX_DURATION_MINUTES {
            r.fail(
                "duration_minutes",
                format!("must be between 1 and {}", MAX_DURATION_MINUTES),
            );
        }
    }
    let days = match r.present("days_of_week", true) {
        Some(Value::Array(items)) if !items.is_empty() => {
            let parsed: Option<Vec<Weekday>> = items
                .iter()
                .map(|d| d.as_str().and_then(|s| s.parse::<Weekday>().ok()))
                .collect();
            if parsed.is_none() {
                r.fail("days_of_week", "entries must be weekday names");
            }
            parsed
        }
        Some(_) => {
            r.fail("days_of_week", "must be a non-empty array");
            None
        }
        None => None,
    };
    let enabled = r.boolean("enabled");
    let flow = r.number("water_flow_rate", true);
    if let Some(f) = flow {
        if f <= 0.0 {
            r.fail("water_flow_rate", "must be greater than 0");
        }
    }

    match (start_time, duration, days, flow) {
        (Some(start_time), Some(duration), Some(mut days), Some(flow)) if r.errors.is_empty() => {
            days.sort_by_key(|d| d.num_days_from_monday());
            days.dedup();
            Ok(Schedule {
                start_time,
                duration_minutes: duration as u32,
                days_of_week: days,
                enabled: enabled.unwrap_or(true),
                water_flow_rate: flow,
            })
        }
        _ => Err(r.finish().err().unwrap_or_else(|| Error::validation("invalid schedule"))),
    }
}
