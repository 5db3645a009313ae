//! Crate-wide error kinds (spec §7). These are constructed at the point of
//! failure, logged, and in most cases swallowed rather than propagated
//! across a thread boundary -- see the call sites in each module.

use thiserror::Error;

/// Extracts a human-readable message from a `catch_unwind` payload, for
/// building a `CallbackError` at a listener/callback panic boundary.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid value for parameter '{parameter}': {value}")]
    InvalidParameterValue { parameter: String, value: String },

    #[error("unknown scale '{0}'")]
    InvalidScale(String),

    #[error("MIDI send failed: {0}")]
    MidiSendFailed(String),

    #[error("callback raised: {0}")]
    CallbackError(String),

    #[error("clock drift accumulator saturated at {0:.1}ms")]
    ClockDrift(f64),

    #[error("fugue generation error: {0}")]
    FugueGenerationError(String),
}
