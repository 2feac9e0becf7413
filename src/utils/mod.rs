//! Shared utilities.

pub mod math;

pub use math::{apply_bps, mul_div, to_decimal, units_from_decimal, BPS_DENOMINATOR};
