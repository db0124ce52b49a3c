use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{config::Capabilities, state::Snapshot};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("telemetry field `{0}` is not a finite number")]
    NonFinite(&'static str),
}

/// Reading pushed by the hydrometer. `gravity` is in milli-units (1050 => 1.050).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub temp: f32,
    pub gravity: f32,
    pub battery: f32,
}

impl TelemetryReading {
    /// Decodes a payload. Numbers that overflow `f32` are rejected so they never reach
    /// the state as infinities.
    pub fn from_json(payload: &[u8]) -> Result<Self, TelemetryError> {
        let reading: Self = serde_json::from_slice(payload)?;
        for (field, value) in [
            ("temp", reading.temp),
            ("gravity", reading.gravity),
            ("battery", reading.battery),
        ] {
            if !value.is_finite() {
                return Err(TelemetryError::NonFinite(field));
            }
        }
        Ok(reading)
    }
}

/// Body of the `/data` endpoint. Optional fields are left out when the deployment
/// does not track them.
#[derive(Debug, Clone, Serialize)]
pub struct StatusBody {
    #[serde(rename = "currentTemp")]
    pub current_temp: f32,
    #[serde(rename = "currentGravity")]
    pub current_gravity: f32,
    #[serde(rename = "heaterStatus")]
    pub heater_status: bool,
    #[serde(rename = "heaterThreshold")]
    pub heater_threshold: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<i32>,
}

impl StatusBody {
    pub fn new(snapshot: &Snapshot, capabilities: Capabilities) -> Self {
        Self {
            current_temp: snapshot.current_temp,
            current_gravity: snapshot.current_gravity,
            heater_status: snapshot.heater_status,
            heater_threshold: snapshot.heater_threshold,
            battery: capabilities.battery.then_some(snapshot.battery),
            memory: capabilities.memory.then_some(snapshot.memory),
        }
    }
}
