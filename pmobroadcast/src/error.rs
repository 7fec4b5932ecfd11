//! Error types for the broadcast pipeline

use std::path::PathBuf;

use crate::splice::Rejection;

/// Result type alias for broadcast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a broadcast session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The session source could not be opened (fatal for `start()`)
    #[error("Source {path} could not be opened: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external audio processor could not be launched
    #[error("Failed to spawn audio processor '{program}': {source}")]
    ProcessorSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Bitrate probing failed (always recovered by the fallback bitrate)
    #[error("Bitrate probe failed: {0}")]
    Probe(String),

    /// The mixer could not be started, the previous source was resumed
    #[error("Effect merge failed: {0}")]
    MergeFailed(String),

    /// Another effect injection is still in flight
    #[error("An effect injection is already in progress")]
    SpliceInProgress,

    /// Nothing is playing (never started, stopped, or source exhausted)
    #[error("No broadcast is currently playing")]
    NotPlaying,

    /// No file in the effects directory matches the requested name
    #[error("The sound effect '{0}' was not found")]
    EffectNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::SpliceInProgress => Self::SpliceInProgress,
            Rejection::NotPlaying | Rejection::Stale => Self::NotPlaying,
        }
    }
}

impl Error {
    /// Indique si l'erreur correspond à une ressource absente (fichier, effet)
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::EffectNotFound(_) => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            Self::SourceUnreadable { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
