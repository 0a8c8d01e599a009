use crate::{
    error::{BridgeError, Result},
    profile::{Checksum, CommandSet, ControlOpcodes, FixedLayout, FrameFormat, ProtocolProfile},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Flag bits of the standard treadmill data frame, in field order
pub mod flags {
    /// Set when instantaneous speed is NOT present in this frame
    pub const MORE_DATA: u16 = 1 << 0;
    /// Average speed, u16
    pub const AVERAGE_SPEED: u16 = 1 << 1;
    /// Total distance, u24
    pub const TOTAL_DISTANCE: u16 = 1 << 2;
    /// Inclination i16 plus ramp angle i16
    pub const INCLINATION: u16 = 1 << 3;
    /// Positive and negative elevation gain, u16 each
    pub const ELEVATION: u16 = 1 << 4;
    /// Instantaneous pace, u8
    pub const INSTANT_PACE: u16 = 1 << 5;
    /// Average pace, u8
    pub const AVERAGE_PACE: u16 = 1 << 6;
    /// Total energy u16, energy per hour u16, energy per minute u8
    pub const EXPENDED_ENERGY: u16 = 1 << 7;
    /// Heart rate, u8
    pub const HEART_RATE: u16 = 1 << 8;
    /// Metabolic equivalent, u8
    pub const METABOLIC: u16 = 1 << 9;
    /// Elapsed time in seconds, u16
    pub const ELAPSED_TIME: u16 = 1 << 10;
    /// Remaining time in seconds, u16
    pub const REMAINING_TIME: u16 = 1 << 11;
    /// Force on belt i16 plus power output i16
    pub const FORCE_BELT: u16 = 1 << 12;
}

/// Raw notification payload plus its arrival time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryFrame {
    /// Characteristic the frame arrived on
    pub characteristic: Uuid,
    /// Frame bytes
    pub data: Bytes,
    /// Arrival timestamp
    pub received_at: Instant,
}

/// Partial metric update decoded from one frame
///
/// `None` means "not carried by this frame".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricDelta {
    /// Speed in km/h
    pub speed_kmh: Option<f64>,
    /// Cadence in rpm
    pub cadence_rpm: Option<f64>,
    /// Resistance level
    pub resistance: Option<i32>,
    /// Incline in percent
    pub incline_pct: Option<f64>,
    /// Power in watts
    pub power_w: Option<f64>,
    /// Device-side accumulated distance in km
    pub total_distance_km: Option<f64>,
    /// Device-side accumulated energy in kcal
    pub calories_kcal: Option<f64>,
    /// Heart rate measured by the device
    pub heart_rate_bpm: Option<u8>,
    /// Workout time reported by the device
    pub elapsed: Option<Duration>,
    /// Remaining workout time reported by the device
    pub remaining: Option<Duration>,
    /// Name of the first flagged field that did not fit in the frame
    pub omitted: Option<&'static str>,
}

/// Outbound command in engineering units
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Resistance level
    SetResistance(i32),
    /// Speed in km/h
    SetSpeed(f64),
    /// Incline in percent
    SetIncline(f64),
    /// Fan level
    SetFan(u8),
    /// Periodic frame carrying the current resistance level
    KeepAlive {
        /// Resistance level to hold
        level: i32,
    },
}

/// Per-device-class packet codec
pub trait Codec: Send + Sync {
    /// Decode one telemetry frame
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ParseError`] when the frame cannot be interpreted at all.
    fn decode(&self, frame: &[u8]) -> Result<MetricDelta>;

    /// Encode a command into the ordered frames that must be written
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Unsupported`] when the device has no encoding for it.
    fn encode(&self, command: &Command) -> Result<Vec<Bytes>>;
}

/// Build the codec matching a profile's frame format
#[must_use]
pub fn codec_for(profile: &ProtocolProfile) -> Box<dyn Codec> {
    match profile.frame {
        FrameFormat::Fixed(layout) => Box::new(FixedFrameCodec {
            layout,
            commands: profile.commands,
            checksum: profile.checksum,
        }),
        FrameFormat::FlagVariable => Box::new(FlagFrameCodec {
            opcodes: match profile.commands {
                CommandSet::ControlPoint(opcodes) => Some(opcodes),
                _ => None,
            },
        }),
        FrameFormat::HeartRateMeasurement => Box::new(HeartRateCodec),
    }
}

/// Codec for fixed-length vendor frames with big-endian fields
#[derive(Debug, Clone, Copy)]
pub struct FixedFrameCodec {
    layout: FixedLayout,
    commands: CommandSet,
    checksum: Checksum,
}

impl FixedFrameCodec {
    fn read_u8(frame: &[u8], offset: usize) -> Result<u8> {
        frame
            .get(offset)
            .copied()
            .ok_or_else(|| BridgeError::ParseError(format!("offset {offset} outside frame")))
    }

    fn read_be_u16(frame: &[u8], offset: usize) -> Result<u16> {
        let mut field = frame
            .get(offset..offset + 2)
            .ok_or_else(|| BridgeError::ParseError(format!("offset {offset} outside frame")))?;
        Ok(field.get_u16())
    }
}

impl Codec for FixedFrameCodec {
    fn decode(&self, frame: &[u8]) -> Result<MetricDelta> {
        let layout = &self.layout;
        if frame.len() != layout.frame_len {
            return Err(BridgeError::ParseError(format!(
                "Unexpected frame length: {} bytes, expected {}",
                frame.len(),
                layout.frame_len
            )));
        }

        let minutes = Self::read_u8(frame, layout.elapsed_minutes)?;
        let seconds = Self::read_u8(frame, layout.elapsed_seconds)?;

        Ok(MetricDelta {
            speed_kmh: Some(
                f64::from(Self::read_be_u16(frame, layout.speed)?) / layout.speed_divisor,
            ),
            cadence_rpm: Some(f64::from(Self::read_u8(frame, layout.cadence)?)),
            resistance: Some(i32::from(Self::read_u8(frame, layout.resistance)?)),
            power_w: Some(f64::from(Self::read_be_u16(frame, layout.power)?)),
            calories_kcal: Some(f64::from(Self::read_be_u16(frame, layout.calories)?)),
            heart_rate_bpm: Some(Self::read_u8(frame, layout.heart_rate)?),
            elapsed: Some(Duration::from_secs(
                u64::from(minutes) * 60 + u64::from(seconds),
            )),
            ..MetricDelta::default()
        })
    }

    fn encode(&self, command: &Command) -> Result<Vec<Bytes>> {
        let CommandSet::KeepAlive(template) = self.commands else {
            return Err(BridgeError::Unsupported(
                "profile has no fixed command frame".to_string(),
            ));
        };

        match command {
            Command::SetResistance(level) | Command::KeepAlive { level } => {
                let level = u8::try_from(*level).map_err(|_| {
                    BridgeError::InvalidParameters(format!("level {level} does not fit a byte"))
                })?;
                let mut frame = BytesMut::from(template.frame);
                frame[template.level_offset] = level;
                self.checksum.apply(&mut frame);
                Ok(vec![frame.freeze()])
            }
            other => Err(BridgeError::Unsupported(format!(
                "{other:?} on a fixed-frame device"
            ))),
        }
    }
}

/// Codec for the standard flag-prefixed treadmill data frame
#[derive(Debug, Clone, Copy)]
pub struct FlagFrameCodec {
    opcodes: Option<ControlOpcodes>,
}

/// Walks optional fields, stopping at the first one that does not fit
struct FieldCursor<'a> {
    buf: &'a [u8],
    omitted: Option<&'static str>,
}

impl<'a> FieldCursor<'a> {
    fn take(&mut self, name: &'static str, width: usize) -> Option<&'a [u8]> {
        if self.omitted.is_some() {
            return None;
        }
        if self.buf.remaining() < width {
            self.omitted = Some(name);
            return None;
        }
        let (field, rest) = self.buf.split_at(width);
        self.buf = rest;
        Some(field)
    }
}

impl FlagFrameCodec {
    fn control_frames(opcodes: ControlOpcodes, opcode: u8, payload: [u8; 2]) -> Vec<Bytes> {
        let mut target = BytesMut::with_capacity(3);
        target.put_u8(opcode);
        target.put_slice(&payload);

        vec![
            Bytes::copy_from_slice(&[opcodes.request_control]),
            Bytes::copy_from_slice(&[opcodes.start_resume]),
            target.freeze(),
        ]
    }
}

impl Codec for FlagFrameCodec {
    fn decode(&self, frame: &[u8]) -> Result<MetricDelta> {
        if frame.len() < 2 {
            return Err(BridgeError::ParseError(format!(
                "Frame too short for flag word: {} bytes",
                frame.len()
            )));
        }

        let mut buf = frame;
        let word = buf.get_u16_le();
        let has = |bit: u16| word & bit != 0;
        let mut cursor = FieldCursor { buf, omitted: None };
        let mut delta = MetricDelta::default();

        if !has(flags::MORE_DATA) {
            if let Some(mut f) = cursor.take("instantaneous speed", 2) {
                delta.speed_kmh = Some(f64::from(f.get_u16_le()) / 100.0);
            }
        }
        if has(flags::AVERAGE_SPEED) {
            cursor.take("average speed", 2);
        }
        if has(flags::TOTAL_DISTANCE) {
            // lifetime odometer, not the workout distance
            cursor.take("total distance", 3);
        }
        if has(flags::INCLINATION) {
            if let Some(mut f) = cursor.take("inclination", 4) {
                delta.incline_pct = Some(f64::from(f.get_i16_le()) / 10.0);
            }
        }
        if has(flags::ELEVATION) {
            cursor.take("elevation gain", 4);
        }
        if has(flags::INSTANT_PACE) {
            cursor.take("instantaneous pace", 1);
        }
        if has(flags::AVERAGE_PACE) {
            cursor.take("average pace", 1);
        }
        if has(flags::EXPENDED_ENERGY) {
            if let Some(mut f) = cursor.take("expended energy", 5) {
                delta.calories_kcal = Some(f64::from(f.get_u16_le()));
            }
        }
        if has(flags::HEART_RATE) {
            if let Some(f) = cursor.take("heart rate", 1) {
                delta.heart_rate_bpm = Some(f[0]);
            }
        }
        if has(flags::METABOLIC) {
            cursor.take("metabolic equivalent", 1);
        }
        if has(flags::ELAPSED_TIME) {
            if let Some(mut f) = cursor.take("elapsed time", 2) {
                delta.elapsed = Some(Duration::from_secs(u64::from(f.get_u16_le())));
            }
        }
        if has(flags::REMAINING_TIME) {
            if let Some(mut f) = cursor.take("remaining time", 2) {
                delta.remaining = Some(Duration::from_secs(u64::from(f.get_u16_le())));
            }
        }
        if has(flags::FORCE_BELT) {
            if let Some(mut f) = cursor.take("force on belt", 4) {
                let _force = f.get_i16_le();
                delta.power_w = Some(f64::from(f.get_i16_le()));
            }
        }

        if let Some(name) = cursor.omitted {
            warn!(
                "Flagged field '{}' exceeds {}-byte frame (flags {:04X}), parse stopped",
                name,
                frame.len(),
                word
            );
            delta.omitted = Some(name);
        }

        Ok(delta)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn encode(&self, command: &Command) -> Result<Vec<Bytes>> {
        let Some(opcodes) = self.opcodes else {
            return Err(BridgeError::Unsupported(
                "profile has no control point".to_string(),
            ));
        };
        let unsupported = || BridgeError::Unsupported(format!("{command:?} on this control point"));

        match *command {
            Command::SetSpeed(kmh) => {
                let opcode = opcodes.set_target_speed.ok_or_else(unsupported)?;
                let raw = (kmh * 100.0).round() as u16;
                Ok(Self::control_frames(opcodes, opcode, raw.to_le_bytes()))
            }
            Command::SetIncline(pct) => {
                let opcode = opcodes.set_target_incline.ok_or_else(unsupported)?;
                let raw = (pct * 10.0).round() as i16;
                Ok(Self::control_frames(opcodes, opcode, raw.to_le_bytes()))
            }
            Command::SetResistance(level) => {
                let opcode = opcodes.set_target_resistance.ok_or_else(unsupported)?;
                let raw = i16::try_from(level.saturating_mul(10)).map_err(|_| {
                    BridgeError::InvalidParameters(format!("resistance {level} out of range"))
                })?;
                Ok(Self::control_frames(opcodes, opcode, raw.to_le_bytes()))
            }
            Command::SetFan(_) | Command::KeepAlive { .. } => Err(unsupported()),
        }
    }
}

/// Codec for the standard heart-rate measurement
#[derive(Debug, Clone, Copy)]
pub struct HeartRateCodec;

impl Codec for HeartRateCodec {
    fn decode(&self, frame: &[u8]) -> Result<MetricDelta> {
        let mut buf = frame;
        if buf.remaining() < 2 {
            return Err(BridgeError::ParseError(format!(
                "Heart rate frame too short: {} bytes",
                frame.len()
            )));
        }

        let format_u16 = buf.get_u8() & 0x01 != 0;
        let bpm = if format_u16 {
            if buf.remaining() < 2 {
                return Err(BridgeError::ParseError(
                    "16-bit heart rate truncated".to_string(),
                ));
            }
            u8::try_from(buf.get_u16_le()).unwrap_or(u8::MAX)
        } else {
            buf.get_u8()
        };
        debug!("Heart rate measurement: {} bpm", bpm);

        Ok(MetricDelta {
            heart_rate_bpm: Some(bpm),
            ..MetricDelta::default()
        })
    }

    fn encode(&self, command: &Command) -> Result<Vec<Bytes>> {
        Err(BridgeError::Unsupported(format!(
            "{command:?} on a heart-rate monitor"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{HEART_RATE_BELT, SPORTSTECH_BIKE, TECHNOGYM_MYRUN};

    fn sportstech_frame() -> [u8; 20] {
        let mut frame = [0u8; 20];
        frame[0] = 0xF2;
        frame[3] = 0x02; // minutes
        frame[4] = 0x1E; // seconds
        frame[7..9].copy_from_slice(&[0x00, 0x2A]); // 42 kcal
        frame[9..11].copy_from_slice(&[0x00, 0x96]); // 150 W
        frame[11] = 0x7D; // 125 bpm
        frame[12..14].copy_from_slice(&[0x00, 0xC8]); // 20.0 km/h
        frame[15] = 0x08;
        frame[17] = 0x55; // 85 rpm
        frame
    }

    #[test]
    fn test_fixed_frame_decode() {
        let codec = codec_for(&SPORTSTECH_BIKE);
        let delta = codec.decode(&sportstech_frame()).unwrap();

        assert_eq!(delta.power_w, Some(150.0));
        assert_eq!(delta.speed_kmh, Some(20.0));
        assert_eq!(delta.calories_kcal, Some(42.0));
        assert_eq!(delta.heart_rate_bpm, Some(125));
        assert_eq!(delta.resistance, Some(8));
        assert_eq!(delta.cadence_rpm, Some(85.0));
        assert_eq!(delta.elapsed, Some(Duration::from_secs(150)));
        assert!(delta.incline_pct.is_none());
    }

    #[test]
    fn test_fixed_frame_rejects_wrong_length() {
        let codec = codec_for(&SPORTSTECH_BIKE);
        let result = codec.decode(&sportstech_frame()[..19]);
        assert!(matches!(result, Err(BridgeError::ParseError(_))));
    }

    #[test]
    fn test_keep_alive_encoding() {
        let codec = codec_for(&SPORTSTECH_BIKE);

        let idle = codec.encode(&Command::KeepAlive { level: 0 }).unwrap();
        assert_eq!(
            &idle[0][..],
            &[0xF2, 0xC3, 0x07, 0x04, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xBE]
        );

        let level_ten = codec.encode(&Command::SetResistance(10)).unwrap();
        assert_eq!(level_ten.len(), 1);
        assert_eq!(level_ten[0][4], 10);
        assert_eq!(level_ten[0][10], 0xBE + 10);
    }

    #[test]
    fn test_fixed_codec_rejects_speed() {
        let codec = codec_for(&SPORTSTECH_BIKE);
        assert!(matches!(
            codec.encode(&Command::SetSpeed(5.0)),
            Err(BridgeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_flag_frame_speed_only() {
        let codec = codec_for(&TECHNOGYM_MYRUN);
        let delta = codec.decode(&[0x00, 0x00, 0x64, 0x00]).unwrap();
        assert_eq!(delta.speed_kmh, Some(1.0));
        assert!(delta.omitted.is_none());
    }

    #[test]
    fn test_flag_frame_average_speed_does_not_shift_fields() {
        let codec = codec_for(&TECHNOGYM_MYRUN);
        let word = flags::AVERAGE_SPEED | flags::HEART_RATE;
        let [lo, hi] = word.to_le_bytes();
        let frame = [lo, hi, 0x64, 0x00, 0x10, 0x27, 0x8C];

        let delta = codec.decode(&frame).unwrap();
        assert_eq!(delta.speed_kmh, Some(1.0));
        assert_eq!(delta.heart_rate_bpm, Some(140));
    }

    #[test]
    fn test_flag_frame_skips_odometer() {
        let codec = codec_for(&TECHNOGYM_MYRUN);
        let word = flags::TOTAL_DISTANCE
            | flags::INCLINATION
            | flags::EXPENDED_ENERGY
            | flags::ELAPSED_TIME;
        let [lo, hi] = word.to_le_bytes();
        let frame = [
            lo, hi,
            0xE8, 0x03, // 10.00 km/h
            0x10, 0x27, 0x00, // lifetime distance
            0x19, 0x00, 0x00, 0x00, // 2.5 %, ramp angle
            0x2C, 0x01, 0xFF, 0xFF, 0xFF, // 300 kcal
            0x3C, 0x00, // 60 s
        ];

        let delta = codec.decode(&frame).unwrap();
        assert_eq!(delta.speed_kmh, Some(10.0));
        assert_eq!(delta.incline_pct, Some(2.5));
        assert_eq!(delta.calories_kcal, Some(300.0));
        assert_eq!(delta.elapsed, Some(Duration::from_secs(60)));
        assert!(delta.total_distance_km.is_none());
        assert!(delta.omitted.is_none());
    }

    #[test]
    fn test_flag_frame_truncated_field_is_omitted() {
        let codec = codec_for(&TECHNOGYM_MYRUN);
        let word = flags::INCLINATION | flags::HEART_RATE;
        let [lo, hi] = word.to_le_bytes();
        let frame = [lo, hi, 0x64, 0x00, 0x19];

        let delta = codec.decode(&frame).unwrap();
        assert_eq!(delta.speed_kmh, Some(1.0));
        assert_eq!(delta.omitted, Some("inclination"));
        assert!(delta.incline_pct.is_none());
        assert!(delta.heart_rate_bpm.is_none());
    }

    #[test]
    fn test_flag_frame_negative_incline_and_power() {
        let codec = codec_for(&TECHNOGYM_MYRUN);
        let word = flags::MORE_DATA | flags::INCLINATION | flags::FORCE_BELT;
        let [lo, hi] = word.to_le_bytes();
        let mut frame = vec![lo, hi];
        frame.extend_from_slice(&(-15i16).to_le_bytes());
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&180i16.to_le_bytes());

        let delta = codec.decode(&frame).unwrap();
        assert!(delta.speed_kmh.is_none());
        assert_eq!(delta.incline_pct, Some(-1.5));
        assert_eq!(delta.power_w, Some(180.0));
    }

    #[test]
    fn test_flag_frame_too_short() {
        let codec = codec_for(&TECHNOGYM_MYRUN);
        assert!(codec.decode(&[0x00]).is_err());
    }

    #[test]
    fn test_control_point_speed_sequence() {
        let codec = codec_for(&TECHNOGYM_MYRUN);
        let frames = codec.encode(&Command::SetSpeed(8.5)).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], &[0x00]);
        assert_eq!(&frames[1][..], &[0x07]);
        assert_eq!(&frames[2][..], &[0x02, 0x52, 0x03]);
    }

    #[test]
    fn test_control_point_incline_sequence() {
        let codec = codec_for(&TECHNOGYM_MYRUN);
        let frames = codec.encode(&Command::SetIncline(4.5)).unwrap();
        assert_eq!(&frames[2][..], &[0x03, 0x2D, 0x00]);
    }

    #[test]
    fn test_control_point_without_resistance_opcode() {
        let codec = codec_for(&TECHNOGYM_MYRUN);
        assert!(matches!(
            codec.encode(&Command::SetResistance(3)),
            Err(BridgeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_heart_rate_decode() {
        let codec = codec_for(&HEART_RATE_BELT);
        let delta = codec.decode(&[0x00, 0x91]).unwrap();
        assert_eq!(delta.heart_rate_bpm, Some(145));

        let wide = codec.decode(&[0x01, 0x91, 0x00]).unwrap();
        assert_eq!(wide.heart_rate_bpm, Some(145));

        assert!(codec.decode(&[0x00]).is_err());
    }
}
