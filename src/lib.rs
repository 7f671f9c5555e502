//! Client-side session layer for the KnowYourStats API: an authenticated
//! HTTP client with single-flight token refresh, a session controller, a
//! persisted session store, transient notifications and streaming
//! connections.

mod app;
mod commands;
pub mod config;
pub mod error;
pub mod http;
pub mod notifications;
mod redact;
pub mod refresh;
pub mod state;
pub mod types;

pub use app::run;
pub use config::ClientConfig;
pub use error::{AuthFailure, ConfigError, HttpError, RefreshError, StoreError, StreamError, TransportError};
pub use http::{ApiClient, ReqwestTransport, SendOptions, Transport};
pub use notifications::NotificationQueue;
pub use refresh::TokenRefresher;
pub use state::{SessionController, SessionStore};
