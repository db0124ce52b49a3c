pub const TOPIC_TELEMETRY: &str = "heater/telemetry";
pub const TOPIC_SENSOR_STATUS: &str = "heater/sensor/status";

pub const TOPIC_CONTROLLER_STATE: &str = "heater/controller/state";

pub const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
