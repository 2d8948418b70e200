use std::io;

use thiserror::Error;

use crate::{
    marshal::MarshalError,
    protocol::{ResponseError, TransportError},
};

#[derive(Debug, Error)]
pub enum Error {
    /// A connect, ping or request outlived its deadline.
    #[error("[TimeoutException]: {why}")]
    Timeout { why: String },

    /// No live connection can serve the request.
    #[error("[NoAvailableNodesException]: {why}")]
    NoAvailableNodes { why: String },

    #[error("[NotFoundError]: {why}")]
    NotFound { why: String },

    /// The store rejected the request as malformed.
    #[error("[InvalidRequestException]: {why}")]
    InvalidRequest { why: String },

    #[error("[UnknownTypeError]: no codec for type '{0}'")]
    UnknownType(String),

    #[error("[InvalidNameError]: {why}")]
    InvalidName { why: String },

    #[error("[AuthenticationException]: {why}")]
    Authentication { why: String },

    #[error("[store error][{code:?}]: {why}")]
    Store { code: ResponseError, why: String },

    #[error("[connection][{host}]: not ready")]
    NotConnected { host: String },

    #[error("[connection][{request}]: unexpected response {response}")]
    UnexpectedResponse {
        request: &'static str,
        response: String,
    },

    #[error(transparent)]
    Marshal(MarshalError),

    #[error(transparent)]
    Transport(TransportError),

    #[error("[config]: {0}")]
    Config(String),

    #[error("[compression]: {0}")]
    Compression(io::Error),

    #[error("[io]: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn no_available_nodes(why: &str) -> Self {
        Error::NoAvailableNodes { why: why.into() }
    }

    /// Maps a store-side failure onto the error taxonomy, keeping the reason verbatim.
    pub(crate) fn from_response(code: ResponseError, why: String) -> Self {
        match code {
            ResponseError::InvalidRequest => Error::InvalidRequest { why },
            ResponseError::NotFound => Error::NotFound { why },
            ResponseError::Authentication | ResponseError::Authorization => {
                Error::Authentication { why }
            }
            ResponseError::TimedOut => Error::Timeout { why },
            code => Error::Store { code, why },
        }
    }

    /// True for failures that say something about the host's health rather
    /// than about the request.
    pub fn is_host_failure(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::Transport(_) | Error::NotConnected { .. }
        )
    }
}

impl From<MarshalError> for Error {
    fn from(value: MarshalError) -> Self {
        match value {
            MarshalError::UnknownType(name) => Error::UnknownType(name),
            other => Error::Marshal(other),
        }
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::TimedOut => Error::Timeout {
                why: "Connection Timed Out".into(),
            },
            other => Error::Transport(other),
        }
    }
}
