//! Error types shared by the playback engine.
//!
//! Every failure that reaches the command front-end is a [`PlaybackError`].
//! The front-end should never show the raw payload; it calls
//! [`PlaybackError::user_message`] for the normalized, human-readable cause.

use thiserror::Error;

pub type PlaybackResult<T> = std::result::Result<T, PlaybackError>;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("voice transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("could not resolve track: {0}")]
    Resolution(#[from] ResolveError),

    #[error("metadata cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("unexpected error: {0}")]
    Unknown(String),
}

/// Bad input from the caller. Returned synchronously, never logged as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no playback session exists for this guild")]
    NoSession,

    #[error("nothing is playing right now")]
    NothingPlaying,

    #[error("the queue is full (maximum {max} tracks)")]
    QueueFull { max: usize },

    #[error("invalid loop mode: {0}")]
    InvalidLoopMode(String),

    #[error("playback is already paused")]
    AlreadyPaused,

    #[error("playback is not paused")]
    NotPaused,

    #[error("no pending track at position {0}")]
    NoSuchPosition(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to join voice channel: {0}")]
    Join(String),

    #[error("not connected to a voice channel")]
    NotConnected,

    #[error("failed to start playback: {0}")]
    Play(String),

    #[error("track control failed: {0}")]
    Control(String),

    #[error("failed to leave voice channel: {0}")]
    Leave(String),

    #[error("transport did not respond within {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unsupported locator: {0}")]
    Unsupported(String),

    #[error("nothing found for {0}")]
    NotFound(String),

    #[error("lookup failed: {0}")]
    Lookup(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache record is malformed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PlaybackError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(e) => Some(e),
            _ => None,
        }
    }

    /// Normalized cause suitable for showing to a user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(e) => e.to_string(),
            Self::Transport(TransportError::Join(_)) => {
                "I couldn't join that voice channel.".to_string()
            }
            Self::Transport(TransportError::NotConnected) => {
                "I'm not connected to a voice channel.".to_string()
            }
            Self::Transport(TransportError::Timeout(_)) => {
                "The voice connection timed out, try again.".to_string()
            }
            Self::Transport(_) => "The voice connection failed.".to_string(),
            Self::Resolution(ResolveError::NotFound(what)) => {
                format!("No results found for {}.", what)
            }
            Self::Resolution(ResolveError::Unsupported(_)) => {
                "That link isn't supported.".to_string()
            }
            Self::Resolution(_) => "I couldn't load that track.".to_string(),
            Self::Cache(_) | Self::Unknown(_) => "Something went wrong.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn validation_errors_pass_their_message_through() {
        let err = PlaybackError::from(ValidationError::QueueFull { max: 3 });
        assert!(err.is_validation());
        assert_eq!(err.user_message(), "the queue is full (maximum 3 tracks)");
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let err = PlaybackError::from(TransportError::Play("opus: bad frame at 0x3f".into()));
        assert!(!err.is_validation());
        assert!(!err.user_message().contains("opus"));

        let err = PlaybackError::Unknown("actor channel closed".into());
        assert_eq!(err.user_message(), "Something went wrong.");
    }
}
