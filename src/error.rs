#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid test or node configuration. Surfaced to the caller, never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Connect failure, socket reset or HTTP parse failure on the transport.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A request exceeded its configured deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Malformed or unexpected control-plane payload.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
