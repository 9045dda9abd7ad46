//! Shared types for the ServiceAI platform

pub mod types;

pub use types::*;
