mod reading;

use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use reading::{generate_reading, SensorKind};
use reqwest::StatusCode;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Simulated field sensors: registers a fleet over the REST API, then
/// streams readings over MQTT.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    /// Base URL of the agrimon REST API
    #[arg(long, env = "API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    /// API key with write scope
    #[arg(long, env = "API_KEY")]
    api_key: String,

    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    /// Number of simulated sensors
    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    /// Readings per second across the fleet
    #[arg(long, env = "RATE", default_value_t = 100)]
    rate: u64,
}

const BURST_SIZE: usize = 50;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("simulator=info")),
        )
        .init();

    let args = Args::parse();
    if args.devices == 0 || args.rate == 0 {
        error!("--devices and --rate must be at least 1");
        std::process::exit(2);
    }

    info!("Starting agrimon simulator");
    info!(
        "API: {}, Broker: {}:{}, Rate: {} readings/s, Devices: {}",
        args.api_url, args.mqtt_broker, args.mqtt_port, args.rate, args.devices
    );

    let http = reqwest::Client::new();
    let mut registered = 0;
    for i in 0..args.devices {
        match register_sensor(&http, &args, i).await {
            Ok(()) => registered += 1,
            Err(e) => warn!("Failed to register sim-{}: {}", i, e),
        }
    }
    info!("{} sensors ready", registered);

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(client_id, &args.mqtt_broker, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Connected to MQTT broker, starting to publish readings");

    let mut rng = rand::thread_rng();
    let mut counter = 0u64;
    let burst_interval = Duration::from_millis((BURST_SIZE as u64 * 1000) / args.rate);
    info!("Publishing in bursts of {} readings every {:?}", BURST_SIZE, burst_interval);

    loop {
        let burst_start = std::time::Instant::now();
        // One timestamp per burst, nudged per reading, keeps each sensor's
        // stream strictly increasing.
        let now = Utc::now();

        for n in 0..BURST_SIZE {
            let index = (counter % args.devices as u64) as usize;
            let sensor_id = format!("sim-{}", index);
            let timestamp = now + ChronoDuration::microseconds(n as i64);
            let reading = generate_reading(&mut rng, sensor_id, SensorKind::for_device(index), timestamp);

            let topic = format!("sensors/{}/readings", reading.sensor_id);
            let payload = match serde_json::to_string(&reading) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize reading: {}", e);
                    continue;
                }
            };

            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => counter += 1,
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        if counter % 10_000 < BURST_SIZE as u64 {
            info!("Published {} readings", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!("Burst took {:?}, target was {:?} - system may be overloaded", elapsed, burst_interval);
        }
    }
}

/// Registers `sim-<index>`; an already registered sensor counts as ready.
/// Throttled attempts wait out `Retry-After`.
async fn register_sensor(http: &reqwest::Client, args: &Args, index: usize) -> Result<(), reqwest::Error> {
    let kind = SensorKind::for_device(index);
    let body = json!({
        "id": format!("sim-{}", index),
        "type": kind,
        "location": {
            "latitude": 45.0 + index as f64 * 0.001,
            "longitude": 7.6 + index as f64 * 0.001,
        },
    });
    let url = format!("{}/v1/sensors", args.api_url.trim_end_matches('/'));

    let mut attempts = 0;
    loop {
        attempts += 1;
        let response = http
            .post(&url)
            .bearer_auth(&args.api_key)
            .timeout(Duration::from_secs(5))
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT => return Ok(()),
            StatusCode::TOO_MANY_REQUESTS if attempts < 5 => {
                let wait = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1);
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }
            _ => return response.error_for_status().map(|_| ()),
        }
    }
}
