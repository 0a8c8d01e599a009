//! Data-only device profiles.
//!
//! A [`ProtocolProfile`] carries every per-device-class constant the session engine
//! needs: GATT identifiers, frame layout, command templates, clamp ranges and timing.
//! Supporting a new vendor means adding a profile value, not a new session type.

use std::time::Duration;
use uuid::Uuid;

use crate::types::DeviceClass;

/// Expand a 16-bit Bluetooth SIG identifier onto the base UUID
#[must_use]
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Client Characteristic Configuration payload enabling notifications
pub const CCC_ENABLE_NOTIFY: [u8; 2] = [0x01, 0x00];

/// Client Characteristic Configuration payload enabling indications
pub const CCC_ENABLE_INDICATE: [u8; 2] = [0x02, 0x00];

/// How outbound frames are written to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write request, the device confirms each write
    WithResponse,
    /// Write command, fire and forget
    WithoutResponse,
}

/// Event that acknowledges an outbound write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckSource {
    /// Writes are not acknowledged
    None,
    /// Any notification or indication on this characteristic
    Notification(Uuid),
    /// The transport's write confirmation
    WriteConfirmation,
}

/// Trailing checksum of outbound frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// No checksum
    None,
    /// Last byte is the sum of all preceding bytes modulo 256
    Sum8,
}

impl Checksum {
    /// Write the checksum into the last byte of `frame`
    pub fn apply(self, frame: &mut [u8]) {
        if let (Self::Sum8, Some((last, body))) = (self, frame.split_last_mut()) {
            *last = sum8(body);
        }
    }

    /// Verify the checksum carried in the last byte of `frame`
    #[must_use]
    pub fn verify(self, frame: &[u8]) -> bool {
        match (self, frame.split_last()) {
            (Self::None, _) => true,
            (Self::Sum8, Some((last, body))) => *last == sum8(body),
            (Self::Sum8, None) => false,
        }
    }
}

fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Byte offsets of a fixed-length telemetry frame
///
/// 16-bit fields are big-endian and start at the given offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedLayout {
    /// Exact frame length; anything else is dropped
    pub frame_len: usize,
    /// Elapsed minutes (u8)
    pub elapsed_minutes: usize,
    /// Elapsed seconds (u8)
    pub elapsed_seconds: usize,
    /// Accumulated kcal (u16 BE)
    pub calories: usize,
    /// Power in watts (u16 BE)
    pub power: usize,
    /// Heart rate (u8)
    pub heart_rate: usize,
    /// Speed (u16 BE), divided by `speed_divisor`
    pub speed: usize,
    /// Divisor turning the raw speed into km/h
    pub speed_divisor: f64,
    /// Resistance level (u8)
    pub resistance: usize,
    /// Cadence in rpm (u8)
    pub cadence: usize,
}

/// Telemetry encoding used by a profile
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameFormat {
    /// Fixed-length vendor frame
    Fixed(FixedLayout),
    /// Standard treadmill data: 16-bit flag word followed by optional fields
    FlagVariable,
    /// Standard heart-rate measurement
    HeartRateMeasurement,
}

/// Periodic frame carrying the current resistance level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveTemplate {
    /// Frame with the level byte zeroed, checksum included
    pub frame: &'static [u8],
    /// Offset of the level byte
    pub level_offset: usize,
}

/// Opcodes of a standard fitness-machine control point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlOpcodes {
    /// Request control of the machine
    pub request_control: u8,
    /// Start or resume the workout
    pub start_resume: u8,
    /// Set target speed, u16 LE in 0.01 km/h
    pub set_target_speed: Option<u8>,
    /// Set target incline, i16 LE in 0.1 %
    pub set_target_incline: Option<u8>,
    /// Set target resistance, i16 LE in 0.1 levels
    pub set_target_resistance: Option<u8>,
}

/// Standard control point opcodes
pub const FTMS_OPCODES: ControlOpcodes = ControlOpcodes {
    request_control: 0x00,
    start_resume: 0x07,
    set_target_speed: Some(0x02),
    set_target_incline: Some(0x03),
    set_target_resistance: Some(0x04),
};

/// Command encodings a profile supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSet {
    /// Read-only device
    None,
    /// Vendor frame retransmitted every tick with the resistance level
    KeepAlive(KeepAliveTemplate),
    /// Opcode frames sent to a control point
    ControlPoint(ControlOpcodes),
}

/// Legal range of a controllable quantity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampRange {
    /// Lowest accepted value
    pub min: f64,
    /// Highest accepted value
    pub max: f64,
}

impl ClampRange {
    /// Build a range
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Constrain a value into the range
    #[must_use]
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    /// Constrain an integer level into the range
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn clamp_level(&self, value: i32) -> i32 {
        value.clamp(self.min.ceil() as i32, self.max.floor() as i32)
    }
}

/// Clamp ranges of every controllable quantity; `None` means not controllable
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampRanges {
    /// Resistance level
    pub resistance: Option<ClampRange>,
    /// Speed in km/h
    pub speed: Option<ClampRange>,
    /// Incline in percent
    pub incline: Option<ClampRange>,
}

/// Everything the session engine knows about a device class
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolProfile {
    /// Human readable profile name
    pub name: &'static str,
    /// Equipment kind
    pub class: DeviceClass,
    /// Default advertised-name prefixes accepted while scanning
    pub name_prefixes: &'static [&'static str],
    /// Primary service
    pub service: Uuid,
    /// Characteristic carrying telemetry frames
    pub telemetry: Uuid,
    /// Characteristics to subscribe to, telemetry first
    pub subscriptions: &'static [Uuid],
    /// Characteristic commands are written to
    pub write: Option<Uuid>,
    /// Telemetry encoding
    pub frame: FrameFormat,
    /// Outbound frame checksum
    pub checksum: Checksum,
    /// Command encodings
    pub commands: CommandSet,
    /// Frames written once, in order, after characteristics are ready
    pub init_sequence: &'static [&'static [u8]],
    /// Legal ranges of controllable quantities
    pub clamp: ClampRanges,
    /// Write mode for outbound frames
    pub write_mode: WriteMode,
    /// What acknowledges an outbound frame
    pub ack: AckSource,
    /// Session tick period
    pub tick_interval: Duration,
    /// How long to wait for an acknowledgement before moving on
    pub ack_timeout: Duration,
}

impl ProtocolProfile {
    /// Whether the device accepts any command at all
    #[must_use]
    pub const fn is_controllable(&self) -> bool {
        !matches!(self.commands, CommandSet::None)
    }
}

const SPORTSTECH_SERVICE: Uuid = bluetooth_uuid(0xFFF0);
const SPORTSTECH_NOTIFY: Uuid = bluetooth_uuid(0xFFF1);
const SPORTSTECH_WRITE: Uuid = bluetooth_uuid(0xFFF2);

/// Fitness machine service
pub const FTMS_SERVICE_UUID: Uuid = bluetooth_uuid(0x1826);
/// Treadmill data characteristic
pub const TREADMILL_DATA_UUID: Uuid = bluetooth_uuid(0x2ACD);
/// Fitness machine control point characteristic
pub const FTMS_CONTROL_POINT_UUID: Uuid = bluetooth_uuid(0x2AD9);
/// Heart rate service
pub const HEART_RATE_SERVICE_UUID: Uuid = bluetooth_uuid(0x180D);
/// Heart rate measurement characteristic
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = bluetooth_uuid(0x2A37);

/// Sportstech exercise bike: proprietary 20-byte frames on a vendor service
pub static SPORTSTECH_BIKE: ProtocolProfile = ProtocolProfile {
    name: "Sportstech bike",
    class: DeviceClass::Bike,
    name_prefixes: &["EW-BK"],
    service: SPORTSTECH_SERVICE,
    telemetry: SPORTSTECH_NOTIFY,
    subscriptions: &[SPORTSTECH_NOTIFY],
    write: Some(SPORTSTECH_WRITE),
    frame: FrameFormat::Fixed(FixedLayout {
        frame_len: 20,
        elapsed_minutes: 3,
        elapsed_seconds: 4,
        calories: 7,
        power: 9,
        heart_rate: 11,
        speed: 12,
        speed_divisor: 10.0,
        resistance: 15,
        cadence: 17,
    }),
    checksum: Checksum::Sum8,
    commands: CommandSet::KeepAlive(KeepAliveTemplate {
        frame: &[0xF2, 0xC3, 0x07, 0x04, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xBE],
        level_offset: 4,
    }),
    init_sequence: &[
        &[0xF2, 0xC0, 0x00, 0xB2],
        &[0xF2, 0xC1, 0x05, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xB5],
        &[
            0xF2, 0xC4, 0x0D, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF,
            0xFF, 0xFF, 0xC0,
        ],
        &[0xF2, 0xC3, 0x07, 0x01, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xBB],
    ],
    clamp: ClampRanges {
        resistance: Some(ClampRange::new(0.0, 23.0)),
        speed: None,
        incline: None,
    },
    write_mode: WriteMode::WithResponse,
    ack: AckSource::Notification(SPORTSTECH_NOTIFY),
    tick_interval: Duration::from_millis(200),
    ack_timeout: Duration::from_millis(300),
};

/// Technogym MyRun treadmill: standard treadmill data and control point
pub static TECHNOGYM_MYRUN: ProtocolProfile = ProtocolProfile {
    name: "Technogym MyRun",
    class: DeviceClass::Treadmill,
    name_prefixes: &["MYRUN "],
    service: FTMS_SERVICE_UUID,
    telemetry: TREADMILL_DATA_UUID,
    subscriptions: &[TREADMILL_DATA_UUID, FTMS_CONTROL_POINT_UUID],
    write: Some(FTMS_CONTROL_POINT_UUID),
    frame: FrameFormat::FlagVariable,
    checksum: Checksum::None,
    commands: CommandSet::ControlPoint(ControlOpcodes {
        set_target_resistance: None,
        ..FTMS_OPCODES
    }),
    init_sequence: &[],
    clamp: ClampRanges {
        resistance: None,
        speed: Some(ClampRange::new(0.0, 22.0)),
        incline: Some(ClampRange::new(0.0, 15.0)),
    },
    write_mode: WriteMode::WithResponse,
    ack: AckSource::Notification(FTMS_CONTROL_POINT_UUID),
    tick_interval: Duration::from_millis(200),
    ack_timeout: Duration::from_millis(3000),
};

/// Standard chest-strap heart-rate monitor
pub static HEART_RATE_BELT: ProtocolProfile = ProtocolProfile {
    name: "Heart rate belt",
    class: DeviceClass::HeartRateMonitor,
    name_prefixes: &[],
    service: HEART_RATE_SERVICE_UUID,
    telemetry: HEART_RATE_MEASUREMENT_UUID,
    subscriptions: &[HEART_RATE_MEASUREMENT_UUID],
    write: None,
    frame: FrameFormat::HeartRateMeasurement,
    checksum: Checksum::None,
    commands: CommandSet::None,
    init_sequence: &[],
    clamp: ClampRanges {
        resistance: None,
        speed: None,
        incline: None,
    },
    write_mode: WriteMode::WithoutResponse,
    ack: AckSource::None,
    tick_interval: Duration::from_millis(200),
    ack_timeout: Duration::from_millis(300),
};
