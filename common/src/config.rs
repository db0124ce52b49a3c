use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::DEFAULT_HEATER_THRESHOLD;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid runtime config json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fields a deployment reports on `/data` beyond the always-present four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub battery: bool,
    pub memory: bool,
}

impl Capabilities {
    pub const FULL: Self = Self {
        battery: true,
        memory: true,
    };
    pub const BASIC: Self = Self {
        battery: false,
        memory: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Full,
    Basic,
}

impl Variant {
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Full => Capabilities::FULL,
            Self::Basic => Capabilities::BASIC,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub default_threshold: f32,
    pub variant: Variant,
    /// Appended to the threshold confirmation, e.g. `" C"`.
    pub threshold_unit: String,
    pub memory_sample_interval_ms: u64,
    pub state_publish_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_threshold: DEFAULT_HEATER_THRESHOLD,
            variant: Variant::Full,
            threshold_unit: String::new(),
            memory_sample_interval_ms: 10_000,
            state_publish_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
    pub read_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 80,
            read_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut runtime: Self = serde_json::from_slice(raw)?;
        runtime.sanitize();
        Ok(runtime)
    }

    pub fn sanitize(&mut self) {
        self.controller.sanitize();
        self.network.sanitize();
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        if !self.default_threshold.is_finite() {
            self.default_threshold = DEFAULT_HEATER_THRESHOLD;
        }
        self.memory_sample_interval_ms = self.memory_sample_interval_ms.clamp(1_000, 600_000);
        self.state_publish_interval_ms = self.state_publish_interval_ms.clamp(1_000, 600_000);
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
        if self.http_port == 0 {
            self.http_port = 80;
        }
        self.read_timeout_ms = self.read_timeout_ms.clamp(100, 60_000);
    }
}
