//! Shared error type used across all Tiller crates.

use crate::outcome::ErrorKind;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("model transport: {0}")]
    Model(String),

    #[error("model behavior: {0}")]
    ModelBehavior(String),

    #[error("max turns exceeded ({0})")]
    MaxTurnsExceeded(u32),

    #[error("run cancelled")]
    Cancelled,

    #[error("store: {0}")]
    Store(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("config: {0}")]
    Config(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map a run-fatal error to its wire kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Model(_) | Error::Http(_) | Error::Timeout(_) => ErrorKind::ModelError,
            Error::ModelBehavior(_) => ErrorKind::ModelBehavior,
            Error::MaxTurnsExceeded(_) => ErrorKind::MaxTurnsExceeded,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Store(_) => ErrorKind::Store,
            _ => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_wire_taxonomy() {
        assert_eq!(Error::Model("x".into()).kind(), ErrorKind::ModelError);
        assert_eq!(Error::ModelBehavior("x".into()).kind(), ErrorKind::ModelBehavior);
        assert_eq!(Error::MaxTurnsExceeded(3).kind(), ErrorKind::MaxTurnsExceeded);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(Error::Store("down".into()).kind(), ErrorKind::Store);
        assert_eq!(Error::Config("x".into()).kind(), ErrorKind::Internal);
    }
}
