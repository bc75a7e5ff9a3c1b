use chrono::TimeDelta;
use thiserror::Error;

/// A configuration value that can never produce a meaningful estimate.
///
/// Raised when an estimator is constructed or when its settings are replaced.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("expected {name} to be greater than zero but got: {value}")]
    NotPositive { name: &'static str, value: f64 },
    #[error("expected {name} in range [{min}, {max}] but got: {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("expected {name} to be one of {allowed:?} but got: {value}")]
    Unsupported {
        name: &'static str,
        value: u32,
        allowed: &'static [u32],
    },
}

impl ConfigError {
    /// Returns an error unless `value` is finite and strictly positive.
    pub(crate) fn positive(name: &'static str, value: f64) -> Result<(), Self> {
        match value.is_finite() && value > 0.0 {
            true => Ok(()),
            false => Err(Self::NotPositive { name, value }),
        }
    }

    /// Returns an error unless `value` lies in `[min, max]`.
    pub(crate) fn within(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), Self> {
        match (min..=max).contains(&value) {
            true => Ok(()),
            false => Err(Self::OutOfRange {
                name,
                value,
                min,
                max,
            }),
        }
    }
}

/// The reason an estimator withheld its result for a frame.
///
/// These are ordinary outcomes of gating and filtering, not faults. The next
/// frame is evaluated independently.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NoEstimate {
    #[error("vehicle state unavailable: {0}")]
    PoseUnavailable(#[from] LookupError),
    #[error("settings rejected: {0}")]
    InvalidSettings(#[from] ConfigError),
    #[error("vehicle state stamp differs from frame stamp by {error}")]
    StampMismatch { error: TimeDelta },
    #[error("altitude {altitude_m:.3} m is below the minimum of {min_m:.3} m")]
    BelowMinAltitude { altitude_m: f64, min_m: f64 },
    #[error("camera is tilted {tilt_deg:.2} deg from vertical, limit is {max_deg:.2} deg")]
    ExcessiveTilt { tilt_deg: f64, max_deg: f64 },
    #[error("rotation rate {rate:.3} rad/s exceeds {max:.3} rad/s")]
    ExcessiveRotation { rate: f64, max: f64 },
    #[error("frame is too small to process after scaling: {width}x{height}")]
    DegenerateFrame { width: u32, height: u32 },
    #[error("no previous frame to compare against")]
    FirstFrame,
    #[error("frame stamp does not advance past the previous frame")]
    NonIncreasingStamp,
    #[error("not enough grid lines: {found} found")]
    InsufficientLines { found: usize },
    #[error("not enough flow samples: {found} < {min}")]
    InsufficientSamples { found: usize, min: usize },
    #[error("flow sample variance {variance:.4} exceeds {max:.4}")]
    ExcessiveVariance { variance: f64, max: f64 },
}

/// A fatal failure of blob detection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BlobError {
    #[error("contour without points reached rectangle fitting")]
    EmptyContour,
}

/// The vehicle state service could not answer a query.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LookupError {
    #[error("timed out waiting for vehicle state")]
    Timeout,
    #[error("no vehicle state has been recorded")]
    Empty,
    #[error("requested stamp precedes the oldest buffered state")]
    Expired,
}
