//! Fixed-point rate conversion and measurement helpers for I/Q streams.

pub mod halfband;
pub mod rate;
pub mod spectrum;
pub mod window;

pub use rate::{convert, Conversion, Decimator, Interpolator, Placement};
