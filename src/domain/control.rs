//! Control Loop
//!
//! Every tick turns the operator's trim / throttle / heading settings and
//! the latest phone tilt into one config frame for the robot.

use crate::domain::models::{AccelSample, TranslateDirection};
use crate::domain::settings::{keys, PreferenceStore, Settings};
use crate::infrastructure::bluetooth::protocol::{
    ConfigFrame, HEADING_RANGE, HEARTBEAT_FIRST, HEARTBEAT_LAST, THROTTLE_MAX,
};
use crate::infrastructure::sensor::SampleSlot;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// m/s^2 per G used to convert accelerometer readings
pub const STANDARD_GRAVITY: f32 = 9.8;

/// Lean the phone back this many G to reverse
pub const BACK_TILT_THRESHOLD_G: f32 = 0.3;

/// Lean the phone forward past this many G to drive forward
pub const FORWARD_TILT_THRESHOLD_G: f32 = -0.1;

/// How strongly a sideways tilt bends the radius
pub const TILT_STEER_GAIN: f32 = 0.08;

/// Full scale of the trim sliders
pub const SLIDER_MAX: u16 = 1000;

/// Fine trim covers +/- half of this span
pub const FINE_TRIM_SPAN: f32 = 0.3;

/// Anything that accepts config frames: the link in production, a recorder in tests.
pub trait FrameSink: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Submit a frame. The sink may drop it; the next tick supersedes it.
    fn send(&self, frame: ConfigFrame);
}

/// Accelerometer trace radius bounds on the robot, in cm
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusLimits {
    pub min: f32,
    pub max: f32,
}

impl Default for RadiusLimits {
    fn default() -> Self {
        Self { min: 0.1, max: 20.0 }
    }
}

impl From<&Settings> for RadiusLimits {
    fn from(s: &Settings) -> Self {
        Self {
            min: s.min_radius_cm,
            max: s.max_radius_cm,
        }
    }
}

/// Operator adjustable control state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlSettings {
    trim_fraction: f32,
    fine_trim_fraction: f32,
    throttle: u8,
    heading_offset: u8,
    tilt_steer_enabled: bool,
    heartbeat_enabled: bool,
    foreground: bool,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            trim_fraction: 0.5,
            fine_trim_fraction: 0.0,
            throttle: 0,
            heading_offset: 0,
            tilt_steer_enabled: false,
            heartbeat_enabled: true,
            foreground: true,
        }
    }
}

impl ControlSettings {
    /// Restore heading and radius saved by a previous session.
    pub fn load(store: &dyn PreferenceStore, limits: RadiusLimits) -> Self {
        let mut settings = Self::default();

        let heading = store.get_int(keys::HEADING_OFFSET).unwrap_or(0);
        settings.heading_offset = heading.rem_euclid(HEADING_RANGE as i64) as u8;

        let radius = store
            .get_float(keys::RADIUS)
            .unwrap_or((limits.max + limits.min) / 2.0);
        if limits.max > 0.0 {
            settings.set_trim_slider(((radius / limits.max) * SLIDER_MAX as f32) as u16);
        }

        settings
    }

    pub fn trim_fraction(&self) -> f32 {
        self.trim_fraction
    }

    pub fn fine_trim_fraction(&self) -> f32 {
        self.fine_trim_fraction
    }

    pub fn throttle(&self) -> u8 {
        self.throttle
    }

    pub fn heading_offset(&self) -> u8 {
        self.heading_offset
    }

    pub fn tilt_steer_enabled(&self) -> bool {
        self.tilt_steer_enabled
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_enabled
    }

    pub fn foreground(&self) -> bool {
        self.foreground
    }

    /// Trim slider position, 0..=1000
    pub fn set_trim_slider(&mut self, position: u16) {
        self.trim_fraction = position.min(SLIDER_MAX) as f32 / SLIDER_MAX as f32;
    }

    /// Fine trim slider position, 0..=1000 mapped onto -0.15..=0.15
    pub fn set_fine_trim_slider(&mut self, position: u16) {
        let x = position.min(SLIDER_MAX) as f32 / SLIDER_MAX as f32;
        self.fine_trim_fraction = (x - 0.5) * FINE_TRIM_SPAN;
    }

    pub fn set_throttle(&mut self, throttle: u8) {
        self.throttle = throttle.min(THROTTLE_MAX);
    }

    pub fn set_heading_offset(&mut self, heading: u8) {
        self.heading_offset = heading % HEADING_RANGE;
    }

    pub fn increment_heading(&mut self) {
        self.heading_offset = (self.heading_offset + 1) % HEADING_RANGE;
    }

    pub fn decrement_heading(&mut self) {
        self.heading_offset = self
            .heading_offset
            .checked_sub(1)
            .unwrap_or(HEADING_RANGE - 1);
    }

    pub fn set_tilt_steer(&mut self, enabled: bool) {
        self.tilt_steer_enabled = enabled;
    }

    pub fn set_heartbeat_enabled(&mut self, enabled: bool) {
        self.heartbeat_enabled = enabled;
    }

    pub fn set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
    }
}

/// Radius from the trim sliders alone: `max * trim * (1 + fine)`
pub fn trim_radius(max_radius: f32, trim_fraction: f32, fine_trim_fraction: f32) -> f32 {
    let radius = max_radius * trim_fraction;
    radius + radius * fine_trim_fraction
}

/// Forward / back tilt decides the translate direction. Forward is
/// evaluated last so it wins if both thresholds were ever satisfied.
pub fn translate_direction(sample: Option<&AccelSample>) -> TranslateDirection {
    let Some(sample) = sample else {
        return TranslateDirection::Idle;
    };

    let tilt_g = sample.x / STANDARD_GRAVITY;
    let mut direction = TranslateDirection::Idle;
    if tilt_g > BACK_TILT_THRESHOLD_G {
        direction = TranslateDirection::Reverse;
    }
    if tilt_g < FORWARD_TILT_THRESHOLD_G {
        direction = TranslateDirection::Forward;
    }
    direction
}

/// Sideways tilt scaled by a signed square root
pub fn steer_factor(steer_g: f32) -> f32 {
    if steer_g > 0.0 {
        steer_g.sqrt()
    } else {
        -(-steer_g).sqrt()
    }
}

pub fn apply_tilt_steer(radius: f32, sample: &AccelSample) -> f32 {
    let steer = steer_factor(sample.y / STANDARD_GRAVITY);
    radius + radius * steer * TILT_STEER_GAIN
}

/// Rotating "alive" marker embedded in every frame.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    value: u8,
    last_advance: Option<Instant>,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            value: HEARTBEAT_FIRST,
            last_advance: None,
            interval,
        }
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    /// Advance at most once per interval, and only while `active`.
    pub fn tick(&mut self, now: Instant, active: bool) -> u8 {
        if !active {
            return self.value;
        }

        let due = self
            .last_advance
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.value = if self.value >= HEARTBEAT_LAST {
                HEARTBEAT_FIRST
            } else {
                self.value + 1
            };
            self.last_advance = Some(now);
        }
        self.value
    }
}

/// What one tick computed, for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlOutput {
    pub radius: f32,
    pub direction: TranslateDirection,
    pub heading_offset: u8,
    pub throttle: u8,
    pub heartbeat: u8,
    pub frame: ConfigFrame,
    pub connected: bool,
}

pub struct ControlLoop<S: FrameSink> {
    settings: Arc<Mutex<ControlSettings>>,
    samples: SampleSlot,
    sink: S,
    preferences: Box<dyn PreferenceStore>,
    limits: RadiusLimits,
    heartbeat: Heartbeat,
    tick_interval: Duration,
    outputs: watch::Sender<Option<ControlOutput>>,
    persist_failed: bool,
}

impl<S: FrameSink> ControlLoop<S> {
    pub fn new(
        settings: Arc<Mutex<ControlSettings>>,
        samples: SampleSlot,
        sink: S,
        preferences: Box<dyn PreferenceStore>,
        limits: RadiusLimits,
        tick_interval: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        let (outputs, _) = watch::channel(None);
        Self {
            settings,
            samples,
            sink,
            preferences,
            limits,
            heartbeat: Heartbeat::new(heartbeat_interval),
            tick_interval,
            outputs,
            persist_failed: false,
        }
    }

    /// Watch the result of each tick
    pub fn subscribe(&self) -> watch::Receiver<Option<ControlOutput>> {
        self.outputs.subscribe()
    }

    /// Run one control tick.
    pub fn tick(&mut self, now: Instant) -> ControlOutput {
        let settings = *self
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let sample = self.samples.latest();

        let trimmed = trim_radius(
            self.limits.max,
            settings.trim_fraction,
            settings.fine_trim_fraction,
        );
        let direction = translate_direction(sample.as_ref());

        let mut radius = trimmed;
        if settings.tilt_steer_enabled {
            if let Some(sample) = &sample {
                radius = apply_tilt_steer(radius, sample);
            }
        }
        radius = radius.max(self.limits.min);

        self.persist(trimmed, settings.heading_offset);

        let heartbeat = self
            .heartbeat
            .tick(now, settings.heartbeat_enabled && settings.foreground);

        let frame = ConfigFrame::new(
            radius,
            settings.heading_offset,
            settings.throttle,
            direction,
            heartbeat,
        );

        // Sent whenever the link reports ready; the sink drops it if a
        // write is still in flight
        let connected = self.sink.is_connected();
        if connected {
            self.sink.send(frame);
        }
        trace!("Tick: radius {:.3} {} connected={}", radius, direction, connected);

        let output = ControlOutput {
            radius,
            direction,
            heading_offset: frame.heading_offset(),
            throttle: frame.throttle(),
            heartbeat,
            frame,
            connected,
        };
        self.outputs.send_replace(Some(output));
        output
    }

    fn persist(&mut self, radius: f32, heading_offset: u8) {
        self.preferences
            .set_int(keys::HEADING_OFFSET, heading_offset as i64);
        self.preferences.set_float(keys::RADIUS, radius);

        match self.preferences.flush() {
            Ok(()) => self.persist_failed = false,
            Err(e) => {
                if !self.persist_failed {
                    warn!("Failed to save control preferences: {}", e);
                }
                self.persist_failed = true;
            }
        }
    }

    /// Tick on a fixed period until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Control loop started ({:?} tick)", self.tick_interval);
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                instant = interval.tick() => {
                    self.tick(instant.into_std());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Control loop stopped");
    }
}
