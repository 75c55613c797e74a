//! Structured error types for runtime-scope
//!
//! Using thiserror for automatic Display implementation and error chaining.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unsupported event: {0}")]
    UnsupportedEvent(String),

    #[error("Invalid sampling interval in event spec: {0}")]
    InvalidInterval(String),

    #[error("Permission denied opening perf counters (check /proc/sys/kernel/perf_event_paranoid)")]
    PermissionDenied,

    #[error("Kernel resource limit reached while opening perf counters: {0}")]
    ResourceExhausted(String),

    #[error("No threads could be sampled")]
    NoThreadsSampled,

    #[error("Sampling engine is already running")]
    AlreadyRunning,

    #[error("Failed to install signal handler: {0}")]
    SignalSetup(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_event_display() {
        let err = EngineError::UnsupportedEvent("not-a-real-event".to_string());
        assert_eq!(err.to_string(), "Unsupported event: not-a-real-event");
    }

    #[test]
    fn test_permission_denied_mentions_paranoid_knob() {
        assert!(EngineError::PermissionDenied.to_string().contains("perf_event_paranoid"));
    }
}
