//! Error taxonomy (spec.md §7). Kinds, not exception types: callers match on
//! `ErrorKind` to decide retry/recovery/propagation policy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error on {device}: {message}")]
    Transport { device: String, message: String },

    #[error("device {device} is locked: {reason}")]
    DeviceLocked { device: String, reason: String },

    #[error("element not found: {message}")]
    ElementNotFound { message: String },

    #[error("screen state mismatch: expected {expected}, got {actual}")]
    StateMismatch { expected: String, actual: String },

    #[error("extraction failed for sensor {sensor_id}: {message}")]
    Extraction { sensor_id: String, message: String },

    #[error("operation timed out after {elapsed_ms}ms: {context}")]
    Timeout { elapsed_ms: u64, context: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("capture failed: all screenshot paths returned below the sanity floor")]
    CaptureFailed,

    /// Carries a `LoopSignal` across a step handler boundary — the only
    /// control signal this error type allows through. Matched specially by
    /// the `loop` step dispatch and otherwise treated as a no-op if it ever
    /// escapes the outermost loop (malformed flow, spec.md §7).
    #[error("{0}")]
    LoopControl(#[from] LoopSignal),
}

impl EngineError {
    pub fn transport(device: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Transport { device: device.into(), message: message.into() }
    }

    pub fn device_locked(device: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::DeviceLocked { device: device.into(), reason: reason.into() }
    }

    pub fn element_not_found(message: impl Into<String>) -> Self {
        EngineError::ElementNotFound { message: message.into() }
    }

    pub fn timeout(elapsed_ms: u64, context: impl Into<String>) -> Self {
        EngineError::Timeout { elapsed_ms, context: context.into() }
    }

    /// Whether an executor step should retry on this error kind rather than
    /// fail the step outright.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transport { .. } | EngineError::StateMismatch { .. })
    }
}

/// Sentinels used by `loop` step control flow. These are the only control
/// signals allowed to cross a step handler boundary (spec.md §7 propagation
/// policy); everything else is caught and recorded on the step result.
#[derive(Debug, Error)]
pub enum LoopSignal {
    #[error("break_loop")]
    Break,
    #[error("continue_loop")]
    Continue,
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_state_mismatch_are_retryable_everything_else_is_not() {
        assert!(EngineError::transport("s1", "timed out").is_retryable());
        assert!(EngineError::StateMismatch { expected: "a".into(), actual: "b".into() }.is_retryable());
        assert!(!EngineError::device_locked("s1", "cooling down").is_retryable());
        assert!(!EngineError::CaptureFailed.is_retryable());
    }

    #[test]
    fn device_locked_display_carries_the_reason_the_scheduler_pattern_matches_on() {
        let cooldown = EngineError::device_locked("s1", "max unlock attempts exceeded, cooling down");
        assert!(cooldown.to_string().contains("cooling down"));

        let unlock_failed = EngineError::device_locked("s1", "unlock_failed");
        assert!(unlock_failed.to_string().contains("unlock_failed"));
    }
}
