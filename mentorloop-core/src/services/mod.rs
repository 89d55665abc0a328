//! Collaborator services used around the pipeline

pub mod input;
pub mod logging;
pub mod retrieval;

pub use input::*;
pub use retrieval::*;
