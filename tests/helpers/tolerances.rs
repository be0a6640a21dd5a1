//! Tolerance constants for audio testing.

/// Floating point rounding errors (passthrough, exact gain).
pub const FLOAT_EPSILON: f32 = 1e-6;

/// Gain computed from decibels.
pub const DSP_EPSILON: f32 = 1e-4;

/// Same as [`DSP_EPSILON`] for double precision sessions.
pub const DSP_EPSILON_F64: f64 = 1e-4;

/// How long a test waits for something that happens on another thread.
pub const SETTLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
