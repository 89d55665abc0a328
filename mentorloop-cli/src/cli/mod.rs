//! CLI command handling

pub mod handlers;
pub mod output;
pub mod review;
pub mod review_handlers;
