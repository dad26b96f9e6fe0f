//! Range math and segment planning.
//!
//! Splits a download into contiguous segments with inclusive byte ranges and
//! builds the HTTP `Range` values used by segment workers.

mod range;

pub use range::{plan_segments, Segment};
