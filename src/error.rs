use thiserror::Error;

/// No response was received: DNS, connect, TLS, timeout or a body that
/// could not be read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("network error: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("refresh token rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("token refresh failed: {0}")]
    Transport(String),
    #[error("token refresh returned an invalid body")]
    InvalidResponse,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },
    #[error("request rejected ({status}): {message}")]
    Client { status: u16, message: String },
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("session expired: {0}")]
    Refresh(#[from] RefreshError),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. } | Self::Client { status, .. } | Self::Server { status, .. } => {
                Some(*status)
            }
            Self::Refresh(RefreshError::Rejected { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// Server-provided message when a response was received.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Auth { message, .. } | Self::Client { message, .. } | Self::Server { message, .. } => {
                Some(message.as_str())
            }
            _ => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid session json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {source}")]
    InvalidUrl {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("{name} has no host")]
    MissingHost { name: &'static str },
    #[error("invalid {name}: {value}")]
    InvalidNumber { name: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no conversation is selected")]
    NoActiveConversation,
    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Human-readable failure returned by login, registration and password
/// changes. Carries either the server's message or a generic fallback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct AuthFailure {
    pub message: String,
}

impl AuthFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
