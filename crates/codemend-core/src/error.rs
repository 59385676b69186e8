use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for the scheduling-and-remediation core.
///
/// Per-repository failures during a sweep are logged and isolated; failures
/// inside a remediation run abort that run after workspace cleanup;
/// configuration failures are fatal before any side effect.
#[derive(Debug, Error)]
pub enum Error {
    #[error("missing required configuration: {0}")]
    Configuration(String),

    #[error("unsupported schedule interval: {0:?}")]
    UnsupportedInterval(String),

    #[error("{program} exited with status {status}: {stderr}")]
    Command {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("failed to clone repository: {0}")]
    CloneFailed(String),

    #[error("remote API call failed: {0}")]
    RemoteApi(String),

    #[error("lint tool not resolvable on this host: {0}")]
    ToolUnavailable(String),

    #[error("persistence failure: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::RemoteApi(e.to_string())
    }
}
