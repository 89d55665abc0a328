//! Workflow orchestration module

pub mod agent;
pub mod engine;
pub mod error;
pub mod hitl;
pub mod orchestrator;
pub mod persistence;
pub mod policy;
pub mod state;
pub mod validator;

pub use agent::*;
pub use engine::*;
pub use error::*;
pub use hitl::*;
pub use orchestrator::*;
pub use persistence::*;
pub use policy::*;
pub use validator::*;
