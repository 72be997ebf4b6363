//! Error taxonomy shared across the pipeline.
//!
//! Platform, strategy and upload errors stay inside their component; only
//! [`RetrievalError`] reaches callers of the publisher.

use thiserror::Error;

use crate::identity::{PlatformType, TrackIdentity};
use crate::platform::PlatformFeature;

/// Errors surfaced by a platform client.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The stored token is missing, expired or was rejected.
    #[error("{platform} requires re-authorization for user {user_id}")]
    Unauthenticated { platform: PlatformType, user_id: i64 },

    /// The platform backend failed (5xx, timeouts).
    #[error("{platform} is temporarily unavailable: {reason}")]
    TemporarilyUnavailable { platform: PlatformType, reason: String },

    /// The adapter does not declare the requested capability.
    #[error("{platform} does not support {feature:?}")]
    UnsupportedOperation {
        platform: PlatformType,
        feature: PlatformFeature,
    },

    /// The request was understood but the user's account cannot do it,
    /// e.g. playback control without a premium subscription.
    #[error("{0}")]
    ClientSide(String),

    #[error("no client is registered for platform {0}")]
    UnsupportedPlatform(PlatformType),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a single retrieval strategy gave up. Never escapes the chain.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("track not found on the source platform")]
    NotFound,

    #[error("source platform session is not authenticated")]
    Unauthenticated,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected http status {0}")]
    Status(reqwest::StatusCode),

    #[error("strategy produced no audio")]
    Empty,

    #[error("external tool failed: {0}")]
    Tool(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of a single upload attempt against the blob store.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The store declared the content permanently unacceptable.
    #[error("artifact of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    /// The store rejected the submission; a retry may succeed.
    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, UploadError::TooLarge { .. })
    }
}

/// Caller-facing failure of `resolve_and_cache`.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("track {identity} could not be found on {}", .identity.platform())]
    NotFound { identity: TrackIdentity },

    #[error("{platform} requires re-authorization")]
    Unauthenticated { platform: PlatformType },

    #[error("{platform} is temporarily unavailable, try again later: {reason}")]
    TemporarilyUnavailable { platform: PlatformType, reason: String },

    #[error("every retrieval strategy failed for {identity} (tried: {})", format_attempted(.attempted))]
    RetrievalExhausted {
        identity: TrackIdentity,
        attempted: Vec<&'static str>,
    },

    #[error("artifact for {identity} is too large ({size} bytes, limit {limit})")]
    ArtifactTooLarge {
        identity: TrackIdentity,
        size: u64,
        limit: u64,
    },

    #[error("upload for {identity} failed after {attempts} attempts: {reason}")]
    UploadFailed {
        identity: TrackIdentity,
        attempts: u32,
        reason: String,
    },

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),

    #[error("retrieval task for {identity} was aborted")]
    Aborted { identity: TrackIdentity },
}

impl RetrievalError {
    pub(crate) fn from_platform(err: PlatformError, identity: &TrackIdentity) -> Self {
        match err {
            PlatformError::Unauthenticated { platform, .. } => {
                RetrievalError::Unauthenticated { platform }
            }
            PlatformError::TemporarilyUnavailable { platform, reason } => {
                RetrievalError::TemporarilyUnavailable { platform, reason }
            }
            other => RetrievalError::TemporarilyUnavailable {
                platform: identity.platform(),
                reason: other.to_string(),
            },
        }
    }
}

fn format_attempted(attempted: &[&'static str]) -> String {
    if attempted.is_empty() {
        "none".to_string()
    } else {
        attempted.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_large_is_not_transient() {
        assert!(!UploadError::TooLarge { size: 10, limit: 5 }.is_transient());
        assert!(UploadError::Rejected("busy".to_string()).is_transient());
    }

    #[test]
    fn test_exhausted_message_lists_strategies() {
        let err = RetrievalError::RetrievalExhausted {
            identity: TrackIdentity::new(PlatformType::Spotify, "abc"),
            attempted: vec!["deezer", "youtube"],
        };
        assert_eq!(
            err.to_string(),
            "every retrieval strategy failed for spotify_abc (tried: deezer, youtube)"
        );

        let err = RetrievalError::RetrievalExhausted {
            identity: TrackIdentity::new(PlatformType::Spotify, "abc"),
            attempted: vec![],
        };
        assert!(err.to_string().ends_with("(tried: none)"));
    }

    #[test]
    fn test_platform_error_mapping() {
        let identity = TrackIdentity::new(PlatformType::Spotify, "abc");
        let mapped = RetrievalError::from_platform(
            PlatformError::Unauthenticated {
                platform: PlatformType::Spotify,
                user_id: 1,
            },
            &identity,
        );
        assert!(matches!(
            mapped,
            RetrievalError::Unauthenticated {
                platform: PlatformType::Spotify
            }
        ));
    }
}
