use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{info, warn};

use heater_common::{TelemetryReading, TOPIC_SENSOR_STATUS, TOPIC_TELEMETRY};

const FINAL_GRAVITY: f32 = 1010.0;
const ORIGINAL_GRAVITY: f32 = 1050.0;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let interval_secs = std::env::var("SENSOR_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(30);

    let mut mqtt_options = MqttOptions::new("heater-sensor-rust", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    mqtt.publish(TOPIC_SENSOR_STATUS, QoS::AtLeastOnce, true, "online")
        .await
        .context("failed to publish sensor online status")?;

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("sensor mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    info!("hydrometer simulator started ({interval_secs}s interval)");

    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);

        // Hardware integration point: a real hydrometer publishes the same payload.
        let reading = simulated_reading(tick);
        let payload =
            serde_json::to_vec(&reading).context("failed to encode telemetry reading")?;

        mqtt.publish(TOPIC_TELEMETRY, QoS::AtLeastOnce, false, payload)
            .await
            .context("failed to publish telemetry")?;
    }
}

/// Fermentation curve: gravity falls from 1050 towards 1010 while the temperature
/// wanders around the default threshold and the battery drains slowly.
fn simulated_reading(tick: u64) -> TelemetryReading {
    let progress = (tick.min(500) as f32) / 500.0;
    let gravity = ORIGINAL_GRAVITY - (ORIGINAL_GRAVITY - FINAL_GRAVITY) * progress;
    let temp = 16.5 + ((tick % 8) as f32 * 0.4);
    let battery = (100.0 - (tick / 20) as f32).max(0.0);

    TelemetryReading {
        temp,
        gravity,
        battery,
    }
}
