//! Integer-micros fixed point.
//!
//! All quantities and prices inside the core are `i64` micros. Conversions
//! to and from `f64` happen only when parsing operator input or rendering
//! output.

/// Scale factor: 1 unit = 1_000_000 micros (6 decimal places).
pub const MICROS_PER_UNIT: i64 = 1_000_000;

/// Returned by [`units_to_micros`] when the input is not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrosError {
    /// Input was `NaN` or infinite.
    NotFinite,
    /// Input would overflow `i64` after scaling.
    OutOfRange,
}

impl std::fmt::Display for MicrosError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MicrosError::NotFinite => write!(f, "units_to_micros: non-finite input"),
            MicrosError::OutOfRange => write!(f, "units_to_micros: value out of i64 range"),
        }
    }
}

impl std::error::Error for MicrosError {}

/// Convert micros to `f64` units for display or wire serialization.
pub fn micros_to_units(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_UNIT as f64
}

/// Convert `f64` units into micros, rounding to the nearest micro.
pub fn units_to_micros(units: f64) -> Result<i64, MicrosError> {
    if !units.is_finite() {
        return Err(MicrosError::NotFinite);
    }
    let scaled = units * MICROS_PER_UNIT as f64;
    if scaled > i64::MAX as f64 || scaled < i64::MIN as f64 {
        return Err(MicrosError::OutOfRange);
    }
    Ok(scaled.round() as i64)
}
