//! Data models for mentorloop

pub mod configuration;
pub mod workflow;

pub use configuration::*;
pub use workflow::*;
