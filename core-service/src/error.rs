use thiserror::Error;

/// Exit status of a run that passed.
pub const EXIT_PASS: i32 = 0;
/// Exit status of a run that completed with a failing verdict.
pub const EXIT_FAIL: i32 = 1;
/// Exit status of a run that could not be carried out.
pub const EXIT_FATAL: i32 = 2;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error(transparent)]
    Config(#[from] core_runtime::Error),

    #[error("Session error: {0}")]
    Session(#[from] core_session::SessionError),

    #[error("Device error: {0}")]
    Device(#[from] core_devices::DeviceError),

    #[error("Playback error: {0}")]
    Playback(#[from] core_playback::PlaybackError),

    #[error("Failed to write report to {path}: {source}")]
    Report {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    /// Every error that reaches the caller means the run never produced a
    /// verdict.
    pub fn exit_code(&self) -> i32 {
        EXIT_FATAL
    }

    /// Rejected credentials, as opposed to an unreachable service.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            CoreError::Session(core_session::SessionError::AuthenticationFailed { .. })
                | CoreError::Playback(core_playback::PlaybackError::Session(
                    core_session::SessionError::AuthenticationFailed { .. }
                ))
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
