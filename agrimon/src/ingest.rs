//! Sensor ingest pipeline.
//!
//! Every reading goes through the same three gates in order: payload
//! validation, device registry lookup, and per-sensor timestamp ordering.
//! Accepted readings are appended to the sensor's ordered log, which is the
//! authoritative store for queries, and optionally forwarded to the archive.

use crate::errors::{Error, OrderingKind, Result};
use crate::external::{call_with_retry, CallPolicy, DeviceRegistry};
use crate::metrics::{
    CHANNEL_FULL_TOTAL, READINGS_ACCEPTED_TOTAL, READINGS_RECEIVED_TOTAL, READINGS_REJECTED_TOTAL,
};
use crate::model::{IngestReceipt, NewReading, NewSensor, Page, Sensor, SensorReading, SensorStatus};
use crate::query::{paginate, PageRequest, TimeRange};
use crate::registry::{SensorCatalog, SensorRecord};
use crate::validate;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Latest device-reported state of a sensor.
#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    status: SensorStatus,
    battery_level: f64,
    timestamp: DateTime<Utc>,
    value: f64,
}

/// Ordered readings of one sensor. Timestamps are strictly increasing.
#[derive(Debug, Default)]
struct SensorLog {
    readings: Vec<SensorReading>,
    snapshot: Option<Snapshot>,
}

impl SensorLog {
    fn append(&mut self, reading: SensorReading) -> Result<usize> {
        if let Some(last) = self.readings.last() {
            if reading.timestamp <= last.timestamp {
                let duplicate = self
                    .readings
                    .binary_search_by(|r| r.timestamp.cmp(&reading.timestamp))
                    .is_ok();
                return Err(Error::Ordering {
                    kind: if duplicate {
                        OrderingKind::Duplicate
                    } else {
                        OrderingKind::OutOfOrder
                    },
                    sensor_id: reading.sensor_id,
                    timestamp: reading.timestamp,
                    last_timestamp: last.timestamp,
                });
            }
        }

        self.snapshot = Some(Snapshot {
            status: reading.status,
            battery_level: reading.battery_level,
            timestamp: reading.timestamp,
            value: reading.value,
        });
        self.readings.push(reading);
        Ok(self.readings.len())
    }
}

pub struct SensorPipeline {
    catalog: Arc<SensorCatalog>,
    registry: Arc<dyn DeviceRegistry>,
    registry_policy: CallPolicy,
    logs: RwLock<HashMap<String, Arc<Mutex<SensorLog>>>>,
    archive: Option<mpsc::Sender<SensorReading>>,
}

impl SensorPipeline {
    /// Pipeline whose device registry is the local catalog.
    pub fn new(catalog: Arc<SensorCatalog>) -> Self {
        let registry: Arc<dyn DeviceRegistry> = catalog.clone();
        Self {
            catalog,
            registry,
            registry_policy: CallPolicy::default(),
            logs: RwLock::new(HashMap::new()),
            archive: None,
        }
    }

    /// Resolve sensors through another registry.
    pub fn with_registry(mut self, registry: Arc<dyn DeviceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Timeout and retry policy for registry lookups.
    pub fn with_registry_policy(mut self, policy: CallPolicy) -> Self {
        self.registry_policy = policy;
        self
    }

    /// Forward accepted readings to an archival channel.
    pub fn with_archive(mut self, archive: mpsc::Sender<SensorReading>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn catalog(&self) -> &SensorCatalog {
        &self.catalog
    }

    pub fn register(&self, sensor: NewSensor) -> Result<Sensor> {
        let record = self.catalog.register(sensor)?;
        Ok(self.view(record))
    }

    /// Parse a raw JSON payload and ingest it.
    pub async fn ingest_json(&self, payload: &Value) -> Result<IngestReceipt> {
        READINGS_RECEIVED_TOTAL.inc();
        let reading = validate::parse_reading(payload).map_err(rejected)?;
        self.admit(reading).await
    }

    pub async fn ingest(&self, reading: NewReading) -> Result<IngestReceipt> {
        READINGS_RECEIVED_TOTAL.inc();
        validate::validate_reading(&reading).map_err(rejected)?;
        self.admit(reading).await
    }

    async fn admit(&self, reading: NewReading) -> Result<IngestReceipt> {
        let registry = &self.registry;
        let sensor_id = reading.sensor_id.as_str();
        let device = call_with_retry("device_registry", self.registry_policy, || {
            registry.resolve(sensor_id)
        })
        .await
        .map_err(rejected)?
        .ok_or_else(|| rejected(Error::NotFound(format!("sensor {}", reading.sensor_id))))?;

        if device.sensor_type != reading.sensor_type {
            return Err(rejected(Error::invalid_fields(vec![
                crate::errors::FieldError::new(
                    "type",
                    format!(
                        "sensor {} is registered as {}",
                        device.sensor_id, device.sensor_type
                    ),
                ),
            ])));
        }

        let log = self.log_for(&reading.sensor_id);
        let (stored, stored_count) = {
            let mut log = log.lock();
            // Receive time is taken under the sensor lock so server stamps
            // follow append order.
            let received_at = Utc::now();
            let stored = SensorReading {
                sensor_id: reading.sensor_id,
                sensor_type: reading.sensor_type,
                location: reading.location,
                value: reading.value + device.calibration_offset,
                unit: reading.unit,
                timestamp: reading.timestamp.unwrap_or(received_at),
                status: reading.status,
                battery_level: reading.battery_level,
                received_at,
            };
            let count = log.append(stored.clone()).map_err(rejected)?;
            (stored, count)
        };

        READINGS_ACCEPTED_TOTAL.inc();
        debug!(
            sensor_id = %stored.sensor_id,
            timestamp = %stored.timestamp,
            stored_count,
            "Reading accepted"
        );

        let receipt = IngestReceipt {
            accepted: true,
            sensor_id: stored.sensor_id.clone(),
            timestamp: stored.timestamp,
            stored_count,
        };
        self.forward(stored).await;
        Ok(receipt)
    }

    async fn forward(&self, reading: SensorReading) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.try_send(reading) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(reading)) => {
                CHANNEL_FULL_TOTAL.inc();
                debug!("Archive channel full, waiting");
                if archive.send(reading).await.is_err() {
                    error!("Archive channel closed, reading not archived");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Archive channel closed, reading not archived");
            }
        }
    }

    fn log_for(&self, sensor_id: &str) -> Arc<Mutex<SensorLog>> {
        if let Some(log) = self.logs.read().get(sensor_id) {
            return log.clone();
        }
        self.logs
            .write()
            .entry(sensor_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_log(&self, sensor_id: &str) -> Option<Arc<Mutex<SensorLog>>> {
        self.logs.read().get(sensor_id).cloned()
    }

    fn view(&self, record: SensorRecord) -> Sensor {
        let snapshot = self
            .existing_log(&record.id)
            .and_then(|log| log.lock().snapshot.clone());
        Sensor {
            id: record.id,
            sensor_type: record.sensor_type,
            location: record.location,
            status: snapshot.as_ref().map_or(record.status, |s| s.status),
            battery_level: snapshot.as_ref().map(|s| s.battery_level),
            last_reading: snapshot.as_ref().map(|s| s.timestamp),
            last_value: snapshot.as_ref().map(|s| s.value),
            owner: record.owner,
            calibration_offset: record.calibration_offset,
            registered_at: record.registered_at,
        }
    }

    pub fn sensor(&self, sensor_id: &str) -> Result<Sensor> {
        self.catalog
            .get(sensor_id)
            .map(|r| self.view(r))
            .ok_or_else(|| Error::NotFound(format!("sensor {}", sensor_id)))
    }

    pub fn sensors(&self, request: PageRequest) -> Page<Sensor> {
        let records = self.catalog.list();
        let page = paginate(&records, request);
        Page {
            data: page.data.into_iter().map(|r| self.view(r)).collect(),
            page: page.page,
            per_page: page.per_page,
            total_count: page.total_count,
        }
    }

    /// Stored readings of one sensor in timestamp order.
    pub fn readings(
        &self,
        sensor_id: &str,
        range: TimeRange,
        request: PageRequest,
    ) -> Result<Page<SensorReading>> {
        if !self.catalog.contains(sensor_id) {
            return Err(Error::NotFound(format!("sensor {}", sensor_id)));
        }
        let Some(log) = self.existing_log(sensor_id) else {
            return Ok(paginate::<SensorReading>(&[], request));
        };
        let log = log.lock();
        Ok(paginate(range.slice(&log.readings, |r| r.timestamp), request))
    }

    /// Most recent stored reading of a sensor.
    pub fn latest(&self, sensor_id: &str) -> Option<SensorReading> {
        self.existing_log(sensor_id)
            .and_then(|log| log.lock().readings.last().cloned())
    }
}

fn rejected(err: Error) -> Error {
    let reason = match &err {
        Error::Validation { .. } => "validation",
        Error::NotFound(_) => "unknown_sensor",
        Error::Ordering {
            kind: OrderingKind::Duplicate,
            ..
        } => "duplicate",
        Error::Ordering { .. } => "out_of_order",
        _ => "registry",
    };
    READINGS_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    err
}
