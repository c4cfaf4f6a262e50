use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Humidity,
    SoilMoisture,
    LightIntensity,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Temperature,
        SensorKind::Humidity,
        SensorKind::SoilMoisture,
        SensorKind::LightIntensity,
    ];

    /// Sensor types rotate across the simulated fleet.
    pub fn for_device(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "C",
            SensorKind::Humidity | SensorKind::SoilMoisture => "%",
            SensorKind::LightIntensity => "lux",
        }
    }

    fn normal_range(&self) -> (f64, f64) {
        match self {
            SensorKind::Temperature => (12.0, 34.0),
            SensorKind::Humidity => (30.0, 85.0),
            SensorKind::SoilMoisture => (15.0, 55.0),
            SensorKind::LightIntensity => (500.0, 90_000.0),
        }
    }

    fn valid_range(&self) -> (f64, f64) {
        match self {
            SensorKind::Temperature => (-50.0, 100.0),
            SensorKind::Humidity | SensorKind::SoilMoisture => (0.0, 100.0),
            SensorKind::LightIntensity => (0.0, 200_000.0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub sensor_id: String,
    #[serde(rename = "type")]
    pub kind: SensorKind,
    pub value: f64,
    pub unit: &'static str,
    pub timestamp: DateTime<Utc>,
    pub status: &'static str,
    pub battery_level: f64,
}

pub fn generate_reading(
    rng: &mut impl Rng,
    sensor_id: String,
    kind: SensorKind,
    timestamp: DateTime<Utc>,
) -> Reading {
    let (lo, hi) = if rng.gen_bool(0.05) {
        kind.valid_range() // 5% outliers
    } else {
        kind.normal_range()
    };

    let battery_level = if rng.gen_bool(0.02) {
        rng.gen_range(0.0..20.0) // 2% low battery
    } else {
        rng.gen_range(20.0..100.0)
    };

    Reading {
        sensor_id,
        kind,
        value: rng.gen_range(lo..hi),
        unit: kind.unit(),
        timestamp,
        status: if battery_level < 5.0 { "maintenance" } else { "active" },
        battery_level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readings_stay_in_valid_range() {
        let mut rng = rand::thread_rng();
        for i in 0..1000 {
            let kind = SensorKind::for_device(i);
            let r = generate_reading(&mut rng, format!("sim-{}", i), kind, Utc::now());
            let (lo, hi) = kind.valid_range();
            assert!(r.value >= lo && r.value <= hi);
            assert!((0.0..=100.0).contains(&r.battery_level));
        }
    }

    #[test]
    fn test_wire_shape() {
        let mut rng = rand::thread_rng();
        let r = generate_reading(&mut rng, "sim-2".into(), SensorKind::SoilMoisture, Utc::now());
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["type"], "soil_moisture");
        assert_eq!(v["unit"], "%");
    }
}
