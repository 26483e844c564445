use std::io;

use thiserror::Error;

/// Coarse classification used by callers that only care about how to react,
/// not about the underlying transport detail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    UnsupportedProtocol,
    Transport,
    RateLimited,
    StaleState,
    Internal,
}

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{message}")]
    Http { status: u16, message: String },
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Stale state: {0}")]
    StaleState(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
}

impl LauncherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LauncherError::Validation(_) => ErrorKind::Validation,
            LauncherError::UnsupportedProtocol(_) => ErrorKind::UnsupportedProtocol,
            LauncherError::Network(_) | LauncherError::Http { .. } | LauncherError::WebSocket(_) => {
                ErrorKind::Transport
            }
            LauncherError::RateLimited(_) => ErrorKind::RateLimited,
            LauncherError::StaleState(_) => ErrorKind::StaleState,
            LauncherError::Io(_)
            | LauncherError::Serde(_)
            | LauncherError::Config(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status of a backend rejection, if this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            LauncherError::Http { status, .. } => Some(*status),
            LauncherError::Network(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }

    /// Reclassifies a backend rejection with one of `statuses` as stale
    /// state. Any other error is returned unchanged.
    pub fn into_stale(self, statuses: &[u16]) -> LauncherError {
        match self.status() {
            Some(status) if statuses.contains(&status) => {
                LauncherError::StaleState(self.to_string())
            }
            _ => self,
        }
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;
