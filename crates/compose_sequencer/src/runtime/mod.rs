//! Runtime components: start ordering, the startup executor and teardown

pub mod dependency;
pub mod executor;
pub mod remove;

pub use dependency::*;
pub use executor::*;
pub use remove::*;
