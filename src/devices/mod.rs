//! Platform device backends, each behind its own cargo feature.

#[cfg(feature = "pulse")]
pub mod pulse;
#[cfg(feature = "screen")]
pub mod screen;
