//! Error types for the playback engine.
//!
//! Only the engine decides whether a failure is recoverable (seek) or promotes the
//! system to the error state; units just report the variant upward.

use thiserror::Error;

/// Failure reported by a unit or by the engine itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The source is unreachable or its format is unsupported.
    #[error("cannot open source {location}: {reason}")]
    SourceOpen { location: String, reason: String },

    /// Bitstream corruption or a mid-stream decoder failure.
    #[error("decode error: {0}")]
    Decode(String),

    /// Requested seek offset is out of range or the decoder refused it.
    #[error("seek error: {0}")]
    Seek(String),

    /// Illegal format renegotiation or an invalid pipeline setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Render sink / output device failure.
    #[error("output error: {0}")]
    Output(String),

    /// The engine control thread is gone.
    #[error("engine is shut down")]
    Closed,
}

/// Convenience result alias used throughout the engine.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn source_open(location: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        EngineError::SourceOpen {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decode(reason: impl std::fmt::Display) -> Self {
        EngineError::Decode(reason.to_string())
    }

    pub fn seek(reason: impl std::fmt::Display) -> Self {
        EngineError::Seek(reason.to_string())
    }

    pub fn configuration(reason: impl std::fmt::Display) -> Self {
        EngineError::Configuration(reason.to_string())
    }

    pub fn output(reason: impl std::fmt::Display) -> Self {
        EngineError::Output(reason.to_string())
    }

    /// Seek failures are recovered locally; everything else ends the current source.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::Seek(_))
    }
}

impl From<symphonia::core::errors::Error> for EngineError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        EngineError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_errors_are_not_fatal() {
        assert!(!EngineError::seek("past end").is_fatal());
        assert!(EngineError::decode("bad frame").is_fatal());
        assert!(EngineError::configuration("mid-stream").is_fatal());
    }

    #[test]
    fn source_open_message_names_location() {
        let err = EngineError::source_open("/tmp/missing.flac", "not found");
        assert_eq!(
            err.to_string(),
            "cannot open source /tmp/missing.flac: not found"
        );
    }
}
