use crate::errors::{Error, Result};
use crate::external::DeviceRegistry;
use crate::model::{DeviceInfo, Location, NewSensor, SensorStatus, SensorType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Registry record of a sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    pub id: String,
    pub sensor_type: SensorType,
    pub location: Location,
    pub status: SensorStatus,
    pub owner: Option<String>,
    pub calibration_offset: f64,
    pub registered_at: DateTime<Utc>,
}

impl SensorRecord {
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            sensor_id: self.id.clone(),
            sensor_type: self.sensor_type,
            owner: self.owner.clone(),
            calibration_offset: self.calibration_offset,
        }
    }
}

/// In-process sensor catalog. Ordered by id so listings page stably.
#[derive(Default)]
pub struct SensorCatalog {
    sensors: RwLock<BTreeMap<String, SensorRecord>>,
}

impl SensorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sensor: NewSensor) -> Result<SensorRecord> {
        let mut sensors = self.sensors.write();
        if sensors.contains_key(&sensor.id) {
            return Err(Error::Conflict(format!(
                "sensor {} is already registered",
                sensor.id
            )));
        }
        let record = SensorRecord {
            id: sensor.id,
            sensor_type: sensor.sensor_type,
            location: sensor.location,
            status: sensor.status,
            owner: sensor.owner,
            calibration_offset: sensor.calibration_offset,
            registered_at: Utc::now(),
        };
        sensors.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<SensorRecord> {
        self.sensors.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sensors.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sensors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.read().is_empty()
    }

    /// All records in id order.
    pub fn list(&self) -> Vec<SensorRecord> {
        self.sensors.read().values().cloned().collect()
    }
}

#[async_trait]
impl DeviceRegistry for SensorCatalog {
    async fn resolve(&self, sensor_id: &str) -> Result<Option<DeviceInfo>> {
        Ok(self.get(sensor_id).map(|r| r.device_info()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_sensor(id: &str) -> NewSensor {
        NewSensor {
            id: id.to_string(),
            sensor_type: SensorType::SoilMoisture,
            location: Location::Named("north".into()),
            status: SensorStatus::Active,
            owner: Some("farm-1".into()),
            calibration_offset: -0.5,
        }
    }

    #[test]
    fn test_register_and_list_in_id_order() {
        let catalog = SensorCatalog::new();
        catalog.register(new_sensor("b")).unwrap();
        catalog.register(new_sensor("a")).unwrap();

        let ids: Vec<String> = catalog.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let catalog = SensorCatalog::new();
        catalog.register(new_sensor("a")).unwrap();
        assert!(matches!(
            catalog.register(new_sensor("a")),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_resolve() {
        tokio_test::block_on(async {
            let catalog = SensorCatalog::new();
            catalog.register(new_sensor("a")).unwrap();

            let info = catalog.resolve("a").await.unwrap().unwrap();
            assert_eq!(info.calibration_offset, -0.5);
            assert_eq!(info.owner.as_deref(), Some("farm-1"));
            assert!(catalog.resolve("missing").await.unwrap().is_none());
        });
    }
}
