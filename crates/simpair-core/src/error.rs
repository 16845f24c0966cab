use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid settings detected before any work starts.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Unreadable item '{id}': {reason}")]
    UnreadableItem { id: String, reason: String },

    #[error("Matcher backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Comparison of '{left}' and '{right}' failed: {reason}")]
    Comparison {
        left: String,
        right: String,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
