use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Sentinel used by the settings store for "no external sensor configured"
pub const DISABLED_SENSOR: &str = "Disabled";

/// Kind of fitness equipment a profile describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Exercise bike
    Bike,
    /// Treadmill
    Treadmill,
    /// Chest strap or other standalone heart-rate monitor
    HeartRateMonitor,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bike => write!(f, "Bike"),
            Self::Treadmill => write!(f, "Treadmill"),
            Self::HeartRateMonitor => write!(f, "Heart Rate Monitor"),
        }
    }
}

/// Lifecycle state of a device session
///
/// The normal progression is
/// `Disconnected → Discovering → Connecting → ServicesDiscovering →
/// CharacteristicsReady → Initializing → Ready`. Any state may fall back to
/// `Disconnected` on a transport error or an unexpected drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionState {
    /// No link to the device
    Disconnected,
    /// Scanning for a device matching the name filter
    Discovering,
    /// Link establishment in progress
    Connecting,
    /// Resolving the profile's service and characteristics
    ServicesDiscovering,
    /// Characteristics resolved and notifications enabled
    CharacteristicsReady,
    /// Running the profile's one-time handshake sequence
    Initializing,
    /// Telemetry flowing and commands accepted
    Ready,
}

impl SessionState {
    /// Whether telemetry from the device should be aggregated in this state
    #[must_use]
    pub fn accepts_telemetry(self) -> bool {
        self >= Self::CharacteristicsReady
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServicesDiscovering => write!(f, "Services Discovering"),
            Self::CharacteristicsReady => write!(f, "Characteristics Ready"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Canonical metric set of a session
///
/// Only the metrics aggregator mutates it; everybody else sees snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    /// Speed in km/h
    pub speed_kmh: f64,
    /// Cadence in rpm
    pub cadence_rpm: f64,
    /// Resistance level on the device's own scale
    pub resistance: i32,
    /// Incline in percent
    pub incline_pct: f64,
    /// Instantaneous power in watts
    pub power_w: f64,
    /// Accumulated distance in km
    pub distance_km: f64,
    /// Heart rate in bpm
    pub heart_rate_bpm: u8,
    /// Accumulated energy in kcal
    pub calories_kcal: f64,
    /// Time spent in the `Ready` state
    pub elapsed: Duration,
    /// Fan level last confirmed by the device
    pub fan_speed: u8,
}

impl MetricSet {
    /// Pace in minutes per km, zero while standing still
    #[must_use]
    pub fn pace_min_per_km(&self) -> f64 {
        if self.speed_kmh > 0.0 {
            60.0 / self.speed_kmh
        } else {
            0.0
        }
    }
}

/// A device found while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCandidate {
    /// Advertised local name
    pub name: String,
    /// Device address as reported by the platform
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

impl DeviceCandidate {
    /// Create a new candidate
    #[must_use]
    pub const fn new(name: String, address: String, rssi: i16) -> Self {
        Self {
            name,
            address,
            rssi,
        }
    }

    /// Check the advertised name against a prefix filter, ignoring case
    #[must_use]
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        !prefix.is_empty()
            && self
                .name
                .to_uppercase()
                .starts_with(&prefix.to_uppercase())
    }
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
    /// Scan window in milliseconds
    pub scan_timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
        }
    }
}

/// Which standardized peripheral the emulation layer should expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmulationKind {
    /// Republish as a treadmill
    Treadmill,
    /// Republish as an indoor bike
    Bike,
}

/// Operator settings consumed by the bridge
///
/// The composition root owns the single copy; the session loop reads one snapshot
/// per tick and passes it down explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Operator body weight in kg
    pub weight_kg: f64,
    /// Name prefix of the external heart-rate belt, `"Disabled"` when none
    pub heart_rate_belt_name: String,
    /// Name prefix of the external cadence sensor, `"Disabled"` when none
    pub cadence_sensor_name: String,
    /// Derive displayed speed from power instead of the wire speed
    pub speed_power_based: bool,
    /// Create the virtual peripheral for third-party apps
    pub virtual_device_enabled: bool,
    /// Expose a treadmill as a bike to third-party apps
    pub virtual_device_force_bike: bool,
    /// Ignore heart rate reported by the equipment itself
    pub heart_ignore_builtin: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            weight_kg: 75.0,
            heart_rate_belt_name: DISABLED_SENSOR.to_string(),
            cadence_sensor_name: DISABLED_SENSOR.to_string(),
            speed_power_based: false,
            virtual_device_enabled: true,
            virtual_device_force_bike: false,
            heart_ignore_builtin: false,
        }
    }
}

impl BridgeSettings {
    /// Whether an external heart-rate belt is configured
    #[must_use]
    pub fn heart_rate_belt_configured(&self) -> bool {
        !self.heart_rate_belt_name.starts_with(DISABLED_SENSOR)
    }

    /// Whether an external cadence sensor is configured
    #[must_use]
    pub fn cadence_sensor_configured(&self) -> bool {
        !self.cadence_sensor_name.starts_with(DISABLED_SENSOR)
    }

    /// Peripheral kind to emulate for the given equipment, if any
    #[must_use]
    pub fn emulation_kind(&self, class: DeviceClass) -> Option<EmulationKind> {
        if !self.virtual_device_enabled {
            return None;
        }
        match class {
            DeviceClass::Treadmill if !self.virtual_device_force_bike => {
                Some(EmulationKind::Treadmill)
            }
            DeviceClass::Treadmill | DeviceClass::Bike => Some(EmulationKind::Bike),
            DeviceClass::HeartRateMonitor => None,
        }
    }
}

/// Operator request for a controllable quantity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OperatorCommand {
    /// Target speed in km/h
    TargetSpeed(f64),
    /// Target incline in percent
    TargetIncline(f64),
    /// Target resistance level
    TargetResistance(i32),
    /// One fan step up
    FanUp,
    /// One fan step down
    FanDown,
}

/// Origin of a heart-rate sample delivered from outside the device frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartRateSource {
    /// Configured external belt
    Belt,
    /// Platform sensor (watch, ANT+ stick) used when nothing better is present
    Platform,
}

/// Heart-rate reading from an auxiliary source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Where the reading came from
    pub source: HeartRateSource,
    /// Beats per minute
    pub bpm: u8,
}

/// One row of workout history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLine {
    /// Speed in km/h
    pub speed_kmh: f64,
    /// Incline in percent
    pub incline_pct: f64,
    /// Accumulated distance in km
    pub distance_km: f64,
    /// Power in watts
    pub power_w: f64,
    /// Resistance level
    pub resistance: i32,
    /// Heart rate in bpm
    pub heart_rate_bpm: u8,
    /// Pace in minutes per km
    pub pace_min_per_km: f64,
    /// Elapsed session time
    pub elapsed: Duration,
}

impl From<&MetricSet> for SessionLine {
    fn from(metrics: &MetricSet) -> Self {
        Self {
            speed_kmh: metrics.speed_kmh,
            incline_pct: metrics.incline_pct,
            distance_km: metrics.distance_km,
            power_w: metrics.power_w,
            resistance: metrics.resistance,
            heart_rate_bpm: metrics.heart_rate_bpm,
            pace_min_per_km: metrics.pace_min_per_km(),
            elapsed: metrics.elapsed,
        }
    }
}

/// What a session leaves behind after teardown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Final metric values
    pub metrics: MetricSet,
    /// History recorded once per second while `Ready`
    pub lines: Vec<SessionLine>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pace() {
        let mut metrics = MetricSet::default();
        assert!(metrics.pace_min_per_km().abs() < f64::EPSILON);
        metrics.speed_kmh = 12.0;
        assert!((metrics.pace_min_per_km() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_state_ordering() {
        assert!(SessionState::Ready.accepts_telemetry());
        assert!(SessionState::CharacteristicsReady.accepts_telemetry());
        assert!(!SessionState::ServicesDiscovering.accepts_telemetry());
        assert!(!SessionState::Disconnected.accepts_telemetry());
    }

    #[test]
    fn test_candidate_prefix_match() {
        let candidate = DeviceCandidate::new("MyRun 1234".to_string(), "AA:BB".to_string(), -60);
        assert!(candidate.matches_prefix("MYRUN"));
        assert!(!candidate.matches_prefix("Kettler"));
        assert!(!candidate.matches_prefix(""));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = BridgeSettings::default();
        assert!((settings.weight_kg - 75.0).abs() < f64::EPSILON);
        assert!(!settings.heart_rate_belt_configured());
        assert!(!settings.cadence_sensor_configured());
        assert!(settings.virtual_device_enabled);
    }

    #[test]
    fn test_emulation_kind() {
        let mut settings = BridgeSettings::default();
        assert_eq!(
            settings.emulation_kind(DeviceClass::Treadmill),
            Some(EmulationKind::Treadmill)
        );
        assert_eq!(settings.emulation_kind(DeviceClass::Bike), Some(EmulationKind::Bike));

        settings.virtual_device_force_bike = true;
        assert_eq!(
            settings.emulation_kind(DeviceClass::Treadmill),
            Some(EmulationKind::Bike)
        );

        settings.virtual_device_enabled = false;
        assert_eq!(settings.emulation_kind(DeviceClass::Bike), None);
    }

    #[test]
    fn test_connection_params_default() {
        let params = ConnectionParams::default();
        assert_eq!(params.timeout_ms, 30_000);
        assert_eq!(params.scan_timeout_ms, 10_000);
    }
}
