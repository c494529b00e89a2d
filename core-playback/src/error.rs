//! # Playback Error Types

use core_devices::DeviceError;
use core_session::SessionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlaybackError {
    /// Fewer distinct tracks are on offer than the run asked for.
    #[error("Catalog offers {available} distinct tracks, {requested} requested")]
    InsufficientCatalog { requested: usize, available: usize },

    #[error("Track list cannot be empty")]
    EmptyTrackList,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Track {track_id} aborted: {reason}")]
    Aborted { track_id: String, reason: String },

    #[error("Invalid state transition: {0}")]
    InvalidState(String),
}

impl PlaybackError {
    /// Whether the run has to end.
    pub fn is_fatal(&self) -> bool {
        match self {
            PlaybackError::Session(e) => e.is_fatal(),
            PlaybackError::Device(_) | PlaybackError::Aborted { .. } => false,
            PlaybackError::InsufficientCatalog { .. }
            | PlaybackError::EmptyTrackList
            | PlaybackError::InvalidState(_) => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlaybackError>;
