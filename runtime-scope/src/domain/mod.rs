//! Domain model for runtime-scope
//!
//! Core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

pub use errors::EngineError;
pub use types::{EventCategory, Interval, Pid, RingMode, Tid};
