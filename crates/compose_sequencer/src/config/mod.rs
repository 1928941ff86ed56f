//! Compose file parsing, interpolation and readiness condition model

mod compose_file;
mod conditions;
mod image;
mod interpolation;

pub use compose_file::*;
pub use conditions::*;
pub use image::*;
pub use interpolation::*;
