//! Points and homogeneous transforms in physical (world) coordinates.

pub mod point;
pub mod transform;

pub use point::*;
pub use transform::*;
