//! Reference agent implementations

pub mod command;
pub mod pipeline;
pub mod tail;

pub use command::*;
pub use pipeline::*;
pub use tail::*;
