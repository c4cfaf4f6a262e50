use crate::errors::{Error, Result};
use crate::ingest::SensorPipeline;
use crate::metrics::MQTT_MESSAGES_TOTAL;
use crate::validate;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const READINGS_TOPIC: &str = "sensors/+/readings";

pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    pipeline: Arc<SensorPipeline>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client
        .subscribe(READINGS_TOPIC, QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 1", READINGS_TOPIC);

    loop {
        match eventloop.poll().await {
            Ok(notification) => {
                if let Event::Incoming(Packet::Publish(publish)) = notification {
                    MQTT_MESSAGES_TOTAL.inc();

                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    // Ingest writes are never retried here: a redelivered
                    // reading is rejected as a duplicate by the pipeline.
                    if let Err(e) = process_message(&publish.topic, &publish.payload, &pipeline).await {
                        warn!(topic = %publish.topic, "Reading rejected: {}", e);
                    }
                }
            }
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc automatically reconnects, so we just log and continue
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Sensor id segment of `sensors/<id>/readings`.
fn topic_sensor_id(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("sensors"), Some(id), Some("readings"), None) if !id.is_empty() => Some(id),
        _ => None,
    }
}

async fn process_message(topic: &str, payload: &[u8], pipeline: &SensorPipeline) -> Result<()> {
    let mut value: Value = serde_json::from_slice(payload)
        .map_err(|e| Error::validation(format!("JSON parse error: {}", e)))?;

    if let Some(id) = topic_sensor_id(topic) {
        validate::bind_sensor_id(&mut value, id)?;
    }

    pipeline.ingest_json(&value).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Location, NewSensor, SensorStatus, SensorType};
    use crate::registry::SensorCatalog;
    use serde_json::json;

    fn pipeline() -> SensorPipeline {
        let catalog = Arc::new(SensorCatalog::new());
        catalog
            .register(NewSensor {
                id: "test-dev".into(),
                sensor_type: SensorType::Temperature,
                location: Location::Named("greenhouse".into()),
                status: SensorStatus::Active,
                owner: None,
                calibration_offset: 0.0,
            })
            .unwrap();
        SensorPipeline::new(catalog)
    }

    fn payload(temperature: f64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "type": "temperature",
            "value": temperature,
            "unit": "C",
            "timestamp": "2026-05-01T06:00:00Z",
            "battery_level": 80.0,
        }))
        .unwrap()
    }

    #[test]
    fn test_topic_sensor_id() {
        assert_eq!(topic_sensor_id("sensors/soil-1/readings"), Some("soil-1"));
        assert_eq!(topic_sensor_id("sensors//readings"), None);
        assert_eq!(topic_sensor_id("telemetry/soil-1"), None);
    }

    #[test]
    fn test_process_message_valid() {
        tokio_test::block_on(async {
            let p = pipeline();
            process_message("sensors/test-dev/readings", &payload(25.0), &p)
                .await
                .unwrap();
            assert_eq!(p.latest("test-dev").unwrap().value, 25.0);
        });
    }

    #[test]
    fn test_process_message_redelivery_rejected() {
        tokio_test::block_on(async {
            let p = pipeline();
            let topic = "sensors/test-dev/readings";
            process_message(topic, &payload(25.0), &p).await.unwrap();
            let err = process_message(topic, &payload(25.0), &p).await.unwrap_err();
            assert!(matches!(err, Error::Ordering { .. }));
        });
    }

    #[test]
    fn test_process_message_invalid_json() {
        tokio_test::block_on(async {
            let p = pipeline();
            assert!(process_message("sensors/test-dev/readings", b"invalid json", &p)
                .await
                .is_err());
        });
    }

    #[test]
    fn test_process_message_invalid_temperature() {
        tokio_test::block_on(async {
            let p = pipeline();
            let err = process_message("sensors/test-dev/readings", &payload(999.0), &p)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation { .. }));
        });
    }

    #[test]
    fn test_topic_and_payload_must_agree() {
        tokio_test::block_on(async {
            let p = pipeline();
            let body = serde_json::to_vec(&json!({
                "sensor_id": "other",
                "type": "temperature",
                "value": 20.0,
                "unit": "C",
                "battery_level": 80.0,
            }))
            .unwrap();
            assert!(process_message("sensors/test-dev/readings", &body, &p)
                .await
                .is_err());
        });
    }
}
