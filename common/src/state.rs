use log::debug;

/// Value stored in every numeric field until the first reading arrives.
pub const SENTINEL: f32 = -1.0;
pub const MEMORY_SENTINEL: i32 = -1;
pub const DEFAULT_HEATER_THRESHOLD: f32 = 18.0;

/// Hydrometers report gravity in milli-units (1050 => 1.050).
pub const GRAVITY_DIVISOR: f32 = 1000.0;

/// Source of the free-memory metric sampled into the state.
pub trait MemoryProbe {
    fn free_bytes(&self) -> i32;
}

impl<F> MemoryProbe for F
where
    F: Fn() -> i32,
{
    fn free_bytes(&self) -> i32 {
        self()
    }
}

/// Point-in-time copy of [`ControllerState`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub current_temp: f32,
    pub current_gravity: f32,
    pub heater_status: bool,
    pub heater_threshold: f32,
    pub battery: f32,
    pub memory: i32,
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "temp={:.2} threshold={:.2} gravity={:.3} heater={} battery={:.2} memory={}",
            self.current_temp,
            self.heater_threshold,
            self.current_gravity,
            if self.heater_status { "ON" } else { "OFF" },
            self.battery,
            self.memory,
        )
    }
}

/// Live readings plus the derived heater decision.
///
/// `heater_status` has no setter; it is recomputed every time the temperature or the
/// threshold changes.
#[derive(Debug, Clone)]
pub struct ControllerState {
    current_temp: f32,
    current_gravity: f32,
    heater_threshold: f32,
    heater_status: bool,
    battery: f32,
    memory: i32,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerState {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_HEATER_THRESHOLD)
    }

    pub fn with_threshold(heater_threshold: f32) -> Self {
        Self {
            current_temp: SENTINEL,
            current_gravity: SENTINEL,
            heater_threshold,
            heater_status: false,
            battery: SENTINEL,
            memory: MEMORY_SENTINEL,
        }
    }

    /// Resets every field to its power-on value, keeping nothing from earlier readings.
    pub fn initialize(&mut self) {
        *self = Self::new();
    }

    pub fn current_temp(&self) -> f32 {
        self.current_temp
    }

    pub fn heater_threshold(&self) -> f32 {
        self.heater_threshold
    }

    pub fn heater_status(&self) -> bool {
        self.heater_status
    }

    /// Stores a telemetry reading. `gravity` arrives in milli-units and is divided by
    /// [`GRAVITY_DIVISOR`]. Values are stored without range checks.
    pub fn apply_reading(&mut self, temp: f32, gravity: f32, battery: f32) {
        debug!("before apply_reading: {}", self.snapshot());

        self.current_temp = temp;
        self.current_gravity = gravity / GRAVITY_DIVISOR;
        self.battery = battery;
        self.recompute_heater_status();

        debug!("after apply_reading: {}", self.snapshot());
    }

    pub fn set_threshold(&mut self, heater_threshold: f32) {
        debug!("before set_threshold: {}", self.snapshot());

        self.heater_threshold = heater_threshold;
        self.recompute_heater_status();

        debug!("after set_threshold: {}", self.snapshot());
    }

    pub fn sample_memory<P: MemoryProbe + ?Sized>(&mut self, probe: &P) {
        self.memory = probe.free_bytes();
        debug!("memory sampled: {}", self.snapshot());
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            current_temp: self.current_temp,
            current_gravity: self.current_gravity,
            heater_status: self.heater_status,
            heater_threshold: self.heater_threshold,
            battery: self.battery,
            memory: self.memory,
        }
    }

    // Strict comparison: a reading equal to the threshold leaves the heater off.
    fn recompute_heater_status(&mut self) {
        self.heater_status = self.current_temp < self.heater_threshold;
    }
}
