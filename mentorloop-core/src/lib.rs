//! # Mentorloop Core Library
//!
//! Orchestration engine for a multi-agent math tutor: a fixed pipeline of
//! stage agents, a retry / escalation policy, and a human-in-the-loop gate
//! that suspends runs until a reviewer decides.

pub mod agents;
pub mod memory;
pub mod models;
pub mod services;
pub mod workflow;
