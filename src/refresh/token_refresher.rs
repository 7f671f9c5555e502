use crate::config::ClientConfig;
use crate::error::RefreshError;
use crate::http::{extract_message, HttpRequest, RequestBody, Transport};
use crate::redact::redact_secrets;
use crate::state::{SessionBus, SessionSignal, SessionStore};
use crate::types::AccessTokenResponse;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const TOKEN_REFRESH_PATH: &str = "auth/token/refresh/";

type RefreshFlight = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

enum RefreshState {
    Idle,
    InFlight(RefreshFlight),
}

/// Exchanges the refresh token for a new access token. At most one
/// exchange is outstanding at any time; concurrent callers await the same
/// one and receive its result.
#[derive(Clone)]
pub struct TokenRefresher {
    transport: Arc<dyn Transport>,
    store: SessionStore,
    bus: SessionBus,
    refresh_url: Arc<str>,
    state: Arc<Mutex<RefreshState>>,
}

impl TokenRefresher {
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        store: SessionStore,
        bus: SessionBus,
    ) -> Self {
        Self {
            transport,
            store,
            bus,
            refresh_url: Arc::from(config.endpoint(TOKEN_REFRESH_PATH)),
            state: Arc::new(Mutex::new(RefreshState::Idle)),
        }
    }

    pub async fn refresh(&self) -> Result<String, RefreshError> {
        self.join_or_start(None).await
    }

    /// Like [`refresh`](Self::refresh), for a caller whose request was
    /// rejected while carrying `stale`. When nothing is in flight and the
    /// store already holds a different access token, that token is returned
    /// without a network call.
    pub async fn refresh_after(&self, stale: Option<&str>) -> Result<String, RefreshError> {
        self.join_or_start(stale).await
    }

    pub async fn is_refreshing(&self) -> bool {
        matches!(*self.state.lock().await, RefreshState::InFlight(_))
    }

    async fn join_or_start(&self, stale: Option<&str>) -> Result<String, RefreshError> {
        let flight = {
            let mut state = self.state.lock().await;
            let existing = match &*state {
                RefreshState::InFlight(flight) => Some(flight.clone()),
                RefreshState::Idle => None,
            };
            match existing {
                Some(flight) => flight,
                None => {
                    if let Some(stale) = stale {
                        if let Some(current) = self.store.access_token().await {
                            if current != stale {
                                return Ok(current);
                            }
                        }
                    }
                    let flight = exchange(
                        self.transport.clone(),
                        self.store.clone(),
                        self.bus.clone(),
                        self.refresh_url.clone(),
                    )
                    .boxed()
                    .shared();
                    *state = RefreshState::InFlight(flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut state = self.state.lock().await;
        if matches!(&*state, RefreshState::InFlight(current) if current.ptr_eq(&flight)) {
            *state = RefreshState::Idle;
        }
        result
    }
}

async fn request_access_token(
    transport: &dyn Transport,
    refresh_url: &str,
    refresh: Option<&str>,
) -> Result<AccessTokenResponse, RefreshError> {
    let refresh = refresh.ok_or(RefreshError::MissingRefreshToken)?;

    let response = transport
        .execute(HttpRequest {
            method: Method::POST,
            url: refresh_url.to_string(),
            bearer: None,
            body: RequestBody::Json(serde_json::json!({ "refresh": refresh })),
        })
        .await
        .map_err(|e| RefreshError::Transport(e.message))?;

    if !response.is_success() {
        return Err(RefreshError::Rejected {
            status: response.status,
            message: extract_message(&response.body, response.status),
        });
    }

    let parsed: AccessTokenResponse =
        serde_json::from_slice(&response.body).map_err(|_| RefreshError::InvalidResponse)?;
    if parsed.access.trim().is_empty() {
        return Err(RefreshError::InvalidResponse);
    }
    Ok(parsed)
}

/// Every store write below is conditional on the refresh token that was
/// sent: a session replaced while the exchange ran is left untouched.
async fn exchange(
    transport: Arc<dyn Transport>,
    store: SessionStore,
    bus: SessionBus,
    refresh_url: Arc<str>,
) -> Result<String, RefreshError> {
    tracing::debug!("refreshing access token");
    let sent = store.refresh_token().await;
    match request_access_token(transport.as_ref(), &refresh_url, sent.as_deref()).await {
        Ok(tokens) => {
            let access = tokens.access.trim().to_string();
            let rotated = tokens.refresh.as_deref().map(str::trim).filter(|s| !s.is_empty());
            let written = match sent.as_deref() {
                Some(sent) => store.replace_tokens(sent, &access, rotated).await,
                None => Ok(false),
            };
            match written {
                Ok(true) => tracing::debug!("access token refreshed"),
                Ok(false) => tracing::debug!("session changed while refreshing, new token not persisted"),
                Err(e) => tracing::warn!(error = %e, "failed to persist refreshed access token"),
            }
            Ok(access)
        }
        Err(err) => {
            let cleared = match store.clear_if_current(sent.as_deref()).await {
                Ok(cleared) => cleared,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to clear persisted session");
                    true
                }
            };
            if !cleared {
                tracing::debug!(
                    error = %redact_secrets(&err.to_string()),
                    "token refresh failed for a session that is already gone"
                );
                return Err(err);
            }
            tracing::warn!(
                error = %redact_secrets(&err.to_string()),
                "token refresh failed, ending session"
            );
            bus.publish(SessionSignal::Expired {
                reason: err.to_string(),
            });
            Err(err)
        }
    }
}
