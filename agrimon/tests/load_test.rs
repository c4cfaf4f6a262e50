//! Publishes readings against a live broker. Run with a local agrimon
//! instance whose catalog holds `load-dev-0..N`:
//! `cargo test --test load_test -- --ignored`

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::time::sleep;

fn random_reading(offset_ms: i64) -> Value {
    let mut rng = rand::thread_rng();
    json!({
        "type": "soil_moisture",
        "value": rng.gen_range(10.0..60.0),
        "unit": "%",
        // Strictly increasing per device so nothing is rejected as a duplicate.
        "timestamp": Utc::now() + ChronoDuration::milliseconds(offset_ms),
        "battery_level": rng.gen_range(20.0..100.0),
    })
}

async fn publish_load(client_id: &str, devices: usize, target_rate: usize, duration_secs: usize) -> (usize, usize, Duration) {
    let total_messages = duration_secs * target_rate;

    let mut mqtt_options = MqttOptions::new(client_id, "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;

    let start = Instant::now();
    let mut sent_count = 0;
    let mut error_count = 0;

    let burst_size = 100;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000 / target_rate) as u64);

    for batch_start in (0..total_messages).step_by(burst_size) {
        for i in batch_start..std::cmp::min(batch_start + burst_size, total_messages) {
            let topic = format!("sensors/load-dev-{}/readings", i % devices);
            let payload = random_reading(i as i64).to_string();

            match client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => sent_count += 1,
                Err(e) => {
                    error_count += 1;
                    if error_count < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }

        sleep(delay_per_burst).await;

        if (batch_start + burst_size) % 5000 == 0 {
            let rate = (batch_start + burst_size) as f64 / start.elapsed().as_secs_f64();
            println!("{} msgs ({:.0} msg/s)", batch_start + burst_size, rate);
        }
    }

    (sent_count, error_count, start.elapsed())
}

#[tokio::test]
#[ignore]
async fn test_1000_readings_per_second() {
    let (sent, errors, duration) = publish_load("agrimon-load-test", 10, 1000, 10).await;
    let rate = sent as f64 / duration.as_secs_f64();

    println!("Sent {} readings in {:.2}s ({:.2} msg/s), {} errors", sent, duration.as_secs_f64(), rate, errors);

    assert!(rate >= 900.0, "Throughput too low: {:.2} msg/s (expected >= 900)", rate);
    assert_eq!(errors, 0, "Too many errors: {}", errors);
}

#[tokio::test]
#[ignore]
async fn test_sustained_load_60_seconds() {
    let (sent, errors, duration) = publish_load("agrimon-load-test-sustained", 50, 1000, 60).await;
    let rate = sent as f64 / duration.as_secs_f64();

    println!("Sustained: {} readings, {:.2} msg/s, {} errors", sent, rate, errors);

    assert!(rate >= 900.0);
}
