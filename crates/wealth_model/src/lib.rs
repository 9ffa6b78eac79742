//! Pure Rust model of the managed-wealth reserve, NAV and settlement math
//! No I/O, no clocks, no panics; every function is total over finite inputs
//!
//! The `wealth_keeper` service crate calls into this crate for every number it
//! persists, so the arithmetic can be tested in isolation.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod nav;
pub mod reserve;
pub mod settlement;

pub use backoff::*;
pub use nav::*;
pub use reserve::*;
pub use settlement::*;

/// Round to 8 decimal places, the precision every persisted amount is kept at.
#[inline]
pub fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round8() {
        assert_eq!(round8(0.123456789), 0.12345679);
        assert_eq!(round8(50.0), 50.0);
        assert_eq!(round8(-1.000000004), -1.0);
    }
}
