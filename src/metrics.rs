use crate::{
    protocol::MetricDelta,
    types::{
        BridgeSettings, DeviceClass, HeartRateSample, HeartRateSource, MetricSet, SessionLine,
        SessionSummary,
    },
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const GRAVITY: f64 = 9.8067;
const AIR_DENSITY: f64 = 1.2234;
const DRAG_AREA: f64 = 0.324;
const ROLLING_RESISTANCE: f64 = 0.005;
const BIKE_WEIGHT_KG: f64 = 9.0;
const LINE_INTERVAL: Duration = Duration::from_secs(1);

/// Owner of the canonical [`MetricSet`] of one session
///
/// Applies decoded frames, integrates distance and energy over time and resolves
/// which heart-rate source wins.
#[derive(Debug)]
pub struct MetricsAggregator {
    class: DeviceClass,
    metrics: MetricSet,
    last_frame: Option<Instant>,
    last_clock: Option<Instant>,
    last_line: Option<Instant>,
    embedded_bpm: Option<u8>,
    belt_bpm: Option<u8>,
    platform_bpm: Option<u8>,
    lines: Vec<SessionLine>,
}

impl MetricsAggregator {
    /// Create an aggregator for one kind of equipment
    #[must_use]
    pub fn new(class: DeviceClass) -> Self {
        Self {
            class,
            metrics: MetricSet::default(),
            last_frame: None,
            last_clock: None,
            last_line: None,
            embedded_bpm: None,
            belt_bpm: None,
            platform_bpm: None,
            lines: Vec::new(),
        }
    }

    /// Current metric values
    #[must_use]
    pub const fn metrics(&self) -> &MetricSet {
        &self.metrics
    }

    /// Owned copy for readers outside the tick loop
    #[must_use]
    pub fn snapshot(&self) -> MetricSet {
        self.metrics.clone()
    }

    /// Recorded history rows
    #[must_use]
    pub fn lines(&self) -> &[SessionLine] {
        &self.lines
    }

    /// Consume the aggregator into what the session leaves behind
    #[must_use]
    pub fn into_summary(self) -> SessionSummary {
        SessionSummary {
            metrics: self.metrics,
            lines: self.lines,
        }
    }

    /// Fold one decoded frame into the metric set
    pub fn apply(&mut self, delta: &MetricDelta, received_at: Instant, settings: &BridgeSettings) {
        let elapsed_ms = self
            .last_frame
            .map(|last| received_at.saturating_duration_since(last).as_secs_f64() * 1000.0);
        self.last_frame = Some(received_at);

        if let Some(speed) = delta.speed_kmh {
            self.metrics.speed_kmh = speed;
        }
        if let Some(cadence) = delta.cadence_rpm {
            if !settings.cadence_sensor_configured() {
                self.metrics.cadence_rpm = cadence;
            }
        }
        if let Some(resistance) = delta.resistance {
            self.metrics.resistance = resistance;
        }
        if let Some(incline) = delta.incline_pct {
            self.metrics.incline_pct = incline;
        }

        self.metrics.power_w = match (self.class, delta.power_w) {
            (DeviceClass::Bike, Some(_)) if self.metrics.cadence_rpm == 0.0 => 0.0,
            (_, Some(watts)) => watts,
            (DeviceClass::Treadmill, None) => estimate_running_power(
                self.metrics.speed_kmh,
                self.metrics.incline_pct,
                settings.weight_kg,
            ),
            (_, None) => self.metrics.power_w,
        };

        if settings.speed_power_based && self.class == DeviceClass::Bike {
            self.metrics.speed_kmh = speed_from_power(self.metrics.power_w, settings.weight_kg);
        }

        match (delta.total_distance_km, elapsed_ms) {
            (Some(total), _) => {
                self.metrics.distance_km = self.metrics.distance_km.max(total);
            }
            (None, Some(ms)) if self.metrics.speed_kmh > 0.0 => {
                self.metrics.distance_km += self.metrics.speed_kmh * ms / 3_600_000.0;
            }
            _ => {}
        }

        match (delta.calories_kcal, elapsed_ms) {
            (Some(kcal), _) => self.metrics.calories_kcal = kcal,
            (None, Some(ms)) if self.metrics.power_w > 0.0 && ms > 0.0 => {
                self.metrics.calories_kcal += ((0.048 * self.metrics.power_w + 1.19)
                    * settings.weight_kg
                    * 3.5
                    / 200.0)
                    / (60_000.0 / ms);
            }
            _ => {}
        }

        if self.class == DeviceClass::HeartRateMonitor {
            if let Some(bpm) = delta.heart_rate_bpm {
                self.metrics.heart_rate_bpm = bpm;
            }
        } else {
            self.embedded_bpm = delta.heart_rate_bpm.filter(|bpm| *bpm > 0);
            self.resolve_heart_rate(settings);
        }

        debug!(
            "Metrics: {:.2} km/h, {:.0} rpm, {:.0} W, {:.3} km, {:.1} kcal, {} bpm",
            self.metrics.speed_kmh,
            self.metrics.cadence_rpm,
            self.metrics.power_w,
            self.metrics.distance_km,
            self.metrics.calories_kcal,
            self.metrics.heart_rate_bpm
        );
    }

    /// Record a heart-rate reading from outside the device frame
    pub fn apply_heart_sample(&mut self, sample: HeartRateSample, settings: &BridgeSettings) {
        match sample.source {
            HeartRateSource::Belt => self.belt_bpm = Some(sample.bpm).filter(|bpm| *bpm > 0),
            HeartRateSource::Platform => {
                self.platform_bpm = Some(sample.bpm).filter(|bpm| *bpm > 0);
            }
        }
        self.resolve_heart_rate(settings);
    }

    // belt (when configured) > embedded > platform > previous
    fn resolve_heart_rate(&mut self, settings: &BridgeSettings) {
        let winner = if settings.heart_rate_belt_configured() {
            self.belt_bpm
        } else {
            self.embedded_bpm
                .filter(|_| !settings.heart_ignore_builtin)
                .or(self.platform_bpm)
        };
        if let Some(bpm) = winner {
            self.metrics.heart_rate_bpm = bpm;
        }
    }

    /// Add wall time spent `Ready` and record a history row once per second
    pub fn advance_clock(&mut self, now: Instant) {
        if let Some(last) = self.last_clock {
            self.metrics.elapsed += now.saturating_duration_since(last);
        }
        self.last_clock = Some(now);

        let due = self
            .last_line
            .is_none_or(|last| now.saturating_duration_since(last) >= LINE_INTERVAL);
        if due {
            self.lines.push(SessionLine::from(&self.metrics));
            self.last_line = Some(now);
        }
    }

    /// Stop integrating across a gap in telemetry, e.g. a dropped link
    pub fn pause(&mut self) {
        self.last_frame = None;
        self.last_clock = None;
        self.metrics.speed_kmh = 0.0;
        self.metrics.cadence_rpm = 0.0;
        self.metrics.power_w = 0.0;
    }
}

/// Speed in km/h a rider would hold on the flat at `watts`
///
/// Solves the rolling plus aerodynamic resistance model for velocity by bisection.
#[must_use]
pub fn speed_from_power(watts: f64, rider_weight_kg: f64) -> f64 {
    if watts <= 0.0 {
        return 0.0;
    }
    let mass = rider_weight_kg + BIKE_WEIGHT_KG;
    let required = |v: f64| {
        ROLLING_RESISTANCE * mass * GRAVITY * v + 0.5 * AIR_DENSITY * DRAG_AREA * v.powi(3)
    };

    let (mut low, mut high) = (0.0_f64, 30.0_f64);
    for _ in 0..60 {
        let mid = f64::midpoint(low, high);
        if required(mid) < watts {
            low = mid;
        } else {
            high = mid;
        }
    }
    f64::midpoint(low, high) * 3.6
}

/// Running power estimate from treadmill speed, incline and body weight
///
/// Horizontal term from oxygen uptake at the given pace plus the vertical lift term.
#[must_use]
pub fn estimate_running_power(speed_kmh: f64, incline_pct: f64, weight_kg: f64) -> f64 {
    if speed_kmh <= 0.0 {
        return 0.0;
    }
    let pace = 60.0 / speed_kmh;
    let vo2_relative = 210.0 / pace;
    let vo2_absolute = vo2_relative * weight_kg / 1000.0;
    let horizontal = 75.0 * vo2_absolute;
    let vertical = GRAVITY * weight_kg * (speed_kmh / 3.6) * incline_pct / 100.0;
    (horizontal + vertical).max(0.0)
}
