#![allow(clippy::missing_panics_doc)]

pub mod registry;
pub mod sim;

pub use registry::{Counter, Registry};
pub use sim::{Core, Sim};
