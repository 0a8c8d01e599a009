//! Outbound command scheduling.
//!
//! The dispatcher is advanced once per session tick and hands back at most one frame to
//! write. While a written frame awaits its acknowledgement nothing else is sent; the wait
//! ends either on the acknowledging event or when the profile's ack window elapses.

use bytes::Bytes;
use std::{collections::VecDeque, sync::Arc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    profile::{AckSource, CommandSet, ProtocolProfile},
    protocol::{Codec, Command},
    types::{MetricSet, OperatorCommand},
};

/// At most one pending operator value per controllable quantity
///
/// A newer request for the same quantity replaces an undispatched older one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingCommandQueue {
    resistance: Option<i32>,
    speed: Option<f64>,
    incline: Option<f64>,
    fan: Option<OperatorCommand>,
}

impl PendingCommandQueue {
    /// Store a request, replacing any pending one for the same quantity
    pub fn push(&mut self, command: OperatorCommand) {
        match command {
            OperatorCommand::TargetResistance(level) => self.resistance = Some(level),
            OperatorCommand::TargetSpeed(kmh) => self.speed = Some(kmh),
            OperatorCommand::TargetIncline(pct) => self.incline = Some(pct),
            OperatorCommand::FanUp | OperatorCommand::FanDown => self.fan = Some(command),
        }
    }

    /// Remove and return the next request, resistance first, fan last
    pub fn take_next(&mut self) -> Option<OperatorCommand> {
        self.resistance
            .take()
            .map(OperatorCommand::TargetResistance)
            .or_else(|| self.speed.take().map(OperatorCommand::TargetSpeed))
            .or_else(|| self.incline.take().map(OperatorCommand::TargetIncline))
            .or_else(|| self.fan.take())
    }

    /// Whether nothing is pending
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.resistance.is_none()
            && self.speed.is_none()
            && self.incline.is_none()
            && self.fan.is_none()
    }

    /// Drop everything pending
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Where the dispatcher is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    /// Characteristics not ready yet, or the link was reset
    Uninitialized,
    /// Writing the profile's one-time handshake
    Initializing,
    /// Handshake done, serving operator requests
    Running,
}

#[derive(Debug)]
struct InFlight {
    frame: Bytes,
    deadline: Instant,
}

/// Owner of the pending queue and the single in-flight write
pub struct CommandDispatcher {
    profile: &'static ProtocolProfile,
    codec: Arc<dyn Codec>,
    queue: PendingCommandQueue,
    phase: DispatchPhase,
    outbox: VecDeque<Bytes>,
    in_flight: Option<InFlight>,
    keep_alive_level: i32,
}

impl CommandDispatcher {
    /// Create a dispatcher for one profile
    #[must_use]
    pub fn new(profile: &'static ProtocolProfile, codec: Arc<dyn Codec>) -> Self {
        Self {
            profile,
            codec,
            queue: PendingCommandQueue::default(),
            phase: DispatchPhase::Uninitialized,
            outbox: VecDeque::new(),
            in_flight: None,
            keep_alive_level: 0,
        }
    }

    /// Current lifecycle phase
    #[must_use]
    pub const fn phase(&self) -> DispatchPhase {
        self.phase
    }

    /// Whether the handshake has completed
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.phase == DispatchPhase::Running
    }

    /// Whether a written frame still awaits its acknowledgement
    #[must_use]
    pub const fn awaiting_ack(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Queue an operator request
    pub fn request(&mut self, command: OperatorCommand) {
        debug!("Queued operator request {:?}", command);
        self.queue.push(command);
    }

    /// Pending operator requests
    #[must_use]
    pub const fn pending(&self) -> &PendingCommandQueue {
        &self.queue
    }

    /// Forget link-scoped progress after a disconnect
    ///
    /// The handshake runs again on the next link; the keep-alive level survives.
    pub fn reset(&mut self) {
        self.phase = DispatchPhase::Uninitialized;
        self.outbox.clear();
        self.in_flight = None;
    }

    /// Notification arrived on `characteristic`
    pub fn on_notification(&mut self, characteristic: Uuid) {
        if self.profile.ack == AckSource::Notification(characteristic) {
            self.acknowledge();
        }
    }

    /// The transport confirmed a write
    pub fn on_write_confirmed(&mut self) {
        if self.profile.ack == AckSource::WriteConfirmation {
            self.acknowledge();
        }
    }

    fn acknowledge(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            debug!("Acknowledged {:02X?}", &in_flight.frame[..]);
        }
    }

    /// Advance one tick; returns the frame to write now, if any
    pub fn tick(&mut self, now: Instant, metrics: &MetricSet) -> Option<Bytes> {
        if let Some(in_flight) = &self.in_flight {
            if now < in_flight.deadline {
                return None;
            }
            warn!(
                "No acknowledgement for {:02X?} within {}ms, proceeding",
                &in_flight.frame[..],
                self.profile.ack_timeout.as_millis()
            );
            self.in_flight = None;
        }

        if self.phase == DispatchPhase::Uninitialized {
            self.outbox.clear();
            self.outbox
                .extend(self.profile.init_sequence.iter().copied().map(Bytes::from_static));
            self.phase = DispatchPhase::Initializing;
            info!(
                "Starting {} initialization ({} frames)",
                self.profile.name,
                self.outbox.len()
            );
        }

        if let Some(frame) = self.outbox.pop_front() {
            return Some(self.send(frame, now));
        }

        if self.phase == DispatchPhase::Initializing {
            self.phase = DispatchPhase::Running;
            info!("{} initialization complete", self.profile.name);
        }

        while let Some(request) = self.queue.take_next() {
            let mut frames = self.frames_for(request, metrics).into_iter();
            if let Some(first) = frames.next() {
                self.outbox.extend(frames);
                return Some(self.send(first, now));
            }
        }

        self.keep_alive().map(|frame| self.send(frame, now))
    }

    fn send(&mut self, frame: Bytes, now: Instant) -> Bytes {
        if self.profile.ack != AckSource::None {
            self.in_flight = Some(InFlight {
                frame: frame.clone(),
                deadline: now + self.profile.ack_timeout,
            });
        }
        frame
    }

    fn keep_alive(&self) -> Option<Bytes> {
        if !matches!(self.profile.commands, CommandSet::KeepAlive(_)) {
            return None;
        }
        let level = self
            .profile
            .clamp
            .resistance
            .map_or(self.keep_alive_level, |range| range.clamp_level(self.keep_alive_level));
        self.encode(Command::KeepAlive { level })
            .and_then(|frames| frames.into_iter().next())
    }

    fn encode(&self, command: Command) -> Option<Vec<Bytes>> {
        match self.codec.encode(&command) {
            Ok(frames) => Some(frames),
            Err(e) => {
                warn!("Dropping {:?}: {}", command, e);
                None
            }
        }
    }

    // Empty when the request needs no write.
    fn frames_for(&mut self, request: OperatorCommand, metrics: &MetricSet) -> Vec<Bytes> {
        let clamp = self.profile.clamp;
        let command = match request {
            OperatorCommand::TargetResistance(level) => {
                let Some(range) = clamp.resistance else {
                    debug!("{} has no resistance control", self.profile.name);
                    return Vec::new();
                };
                let level = range.clamp_level(level);
                if matches!(self.profile.commands, CommandSet::KeepAlive(_)) {
                    // carried by the next keep-alive frame
                    self.keep_alive_level = level;
                    return Vec::new();
                }
                if level == metrics.resistance {
                    return Vec::new();
                }
                Command::SetResistance(level)
            }
            OperatorCommand::TargetSpeed(kmh) => {
                let Some(range) = clamp.speed else {
                    debug!("{} has no speed control", self.profile.name);
                    return Vec::new();
                };
                if !kmh.is_finite() {
                    warn!("Ignoring non-finite target speed {}", kmh);
                    return Vec::new();
                }
                let kmh = range.clamp(kmh);
                if (kmh - metrics.speed_kmh).abs() < 0.005 {
                    return Vec::new();
                }
                Command::SetSpeed(kmh)
            }
            OperatorCommand::TargetIncline(pct) => {
                let Some(range) = clamp.incline else {
                    debug!("{} has no incline control", self.profile.name);
                    return Vec::new();
                };
                if !pct.is_finite() {
                    warn!("Ignoring non-finite target incline {}", pct);
                    return Vec::new();
                }
                let pct = range.clamp(pct);
                if (pct - metrics.incline_pct).abs() < 0.05 {
                    return Vec::new();
                }
                Command::SetIncline(pct)
            }
            OperatorCommand::FanUp => Command::SetFan(metrics.fan_speed.saturating_add(1)),
            OperatorCommand::FanDown => Command::SetFan(metrics.fan_speed.saturating_sub(1)),
        };

        info!("Writing {:?}", command);
        self.encode(command).unwrap_or_default()
    }
}
