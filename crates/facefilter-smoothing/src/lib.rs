//! Smoothing primitives for noisy tracking signals.
//!
//! Everything in here is a plain numeric filter: no allocation after
//! construction, no failure modes, always returns a value. The one-euro
//! filter follows Casiez et al. — an exponential low-pass whose cutoff
//! frequency rises with the estimated rate of change, trading jitter
//! suppression against lag.

use glam::Mat4;

/// Zero out small values around the rest position.
///
/// Tracking inputs rarely sit at exactly zero; a deadzone keeps an idle
/// signal from shimmering.
pub fn apply_deadzone(value: f32, zone: f32) -> f32 {
    if value.abs() <= zone {
        0.0
    } else {
        value
    }
}

/// First-order exponential low-pass filter.
///
/// The first sample passes through unchanged (there is no history to blend
/// with).
#[derive(Debug, Clone, Default)]
pub struct LowPassFilter {
    last: Option<f32>,
}

impl LowPassFilter {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Blend `value` against the previous output with the given alpha in
    /// `(0, 1]`. Alpha of 1 passes the raw value through.
    pub fn apply(&mut self, value: f32, alpha: f32) -> f32 {
        let out = match self.last {
            Some(last) => alpha.mul_add(value - last, last),
            None => value,
        };
        self.last = Some(out);
        out
    }

    /// Last output, if any sample has been filtered yet.
    pub fn last(&self) -> Option<f32> {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Adaptive cutoff low-pass filter (one-euro family).
///
/// Timestamps must be monotonically increasing; a non-advancing timestamp
/// returns the previous output without updating state. The first call for a
/// fresh filter returns the raw value unchanged.
#[derive(Debug, Clone)]
pub struct OneEuroFilter {
    min_cutoff: f32,
    beta: f32,
    d_cutoff: f32,
    value: LowPassFilter,
    derivative: LowPassFilter,
    last_timestamp: Option<f64>,
}

impl OneEuroFilter {
    /// `min_cutoff` is the cutoff frequency (Hz) at rest, `beta` the speed
    /// coefficient. The derivative cutoff stays at 1 Hz.
    pub fn new(min_cutoff: f32, beta: f32) -> Self {
        Self::with_derivative_cutoff(min_cutoff, beta, 1.0)
    }

    pub fn with_derivative_cutoff(min_cutoff: f32, beta: f32, d_cutoff: f32) -> Self {
        Self {
            min_cutoff,
            beta,
            d_cutoff,
            value: LowPassFilter::new(),
            derivative: LowPassFilter::new(),
            last_timestamp: None,
        }
    }

    /// Filter one sample taken at `timestamp` (seconds).
    pub fn filter(&mut self, raw: f32, timestamp: f64) -> f32 {
        let (last_value, last_timestamp) = match (self.value.last(), self.last_timestamp) {
            (Some(v), Some(t)) => (v, t),
            _ => {
                // No history: the raw value is the best estimate.
                self.last_timestamp = Some(timestamp);
                self.derivative.apply(0.0, 1.0);
                return self.value.apply(raw, 1.0);
            }
        };

        let dt = (timestamp - last_timestamp) as f32;
        if dt <= 0.0 {
            return last_value;
        }
        self.last_timestamp = Some(timestamp);

        let speed = (raw - last_value) / dt;
        let smoothed_speed = self.derivative.apply(speed, alpha(self.d_cutoff, dt));
        let cutoff = self.min_cutoff + self.beta * smoothed_speed.abs();
        self.value.apply(raw, alpha(cutoff, dt))
    }

    pub fn reset(&mut self) {
        self.value.reset();
        self.derivative.reset();
        self.last_timestamp = None;
    }
}

/// Smoothing weight for a given cutoff frequency and time step.
fn alpha(cutoff: f32, dt: f32) -> f32 {
    let tau = 1.0 / (2.0 * std::f32::consts::PI * cutoff);
    1.0 / (1.0 + tau / dt)
}

/// One-euro filtering over a 4x4 matrix, treating the sixteen flattened
/// elements as independent scalar channels.
///
/// Deliberately not a geometric blend: decompose/recompose is avoided so
/// noisy rotations never pass through quaternion interpolation artifacts.
#[derive(Debug, Clone)]
pub struct OneEuroMat4 {
    channels: Box<[OneEuroFilter; 16]>,
}

impl OneEuroMat4 {
    pub fn new(min_cutoff: f32, beta: f32) -> Self {
        Self {
            channels: Box::new(std::array::from_fn(|_| {
                OneEuroFilter::new(min_cutoff, beta)
            })),
        }
    }

    pub fn filter(&mut self, raw: &Mat4, timestamp: f64) -> Mat4 {
        let elements = raw.to_cols_array();
        let mut out = [0.0f32; 16];
        for (i, element) in elements.iter().enumerate() {
            out[i] = self.channels[i].filter(*element, timestamp);
        }
        Mat4::from_cols_array(&out)
    }

    pub fn reset(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.reset();
        }
    }
}
