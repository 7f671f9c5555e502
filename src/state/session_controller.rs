use super::{PersistedSession, SessionBus, SessionSignal, SessionStore};
use crate::config::ClientConfig;
use crate::error::{AuthFailure, HttpError, StreamError};
use crate::http::{chat_channel, ApiClient, SendOptions, StreamConnection, Transport};
use crate::notifications::NotificationQueue;
use crate::redact::redact_secrets;
use crate::types::{
    AuthResponse, LoginRequest, PasswordChange, ProfileUpdate, RegistrationRequest, Session,
    SessionStatus, SessionView, StatusResponse, UserProfile,
};
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

pub const LOGIN_PATH: &str = "auth/login/";
pub const REGISTER_PATH: &str = "auth/register/";
pub const LOGOUT_PATH: &str = "auth/logout/";
pub const PROFILE_PATH: &str = "auth/profile/";
pub const CHANGE_PASSWORD_PATH: &str = "auth/change-password/";

const LOGIN_FALLBACK: &str = "Login failed. Please try again.";
const REGISTER_FALLBACK: &str = "Registration failed. Please try again.";
const CHANGE_PASSWORD_FALLBACK: &str = "Password change failed. Please try again.";
const UNREACHABLE_MESSAGE: &str = "Unable to reach the server. Check your connection and try again.";
const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please sign in again.";

/// Tokens are not kept here: the store is their only holder, so a refresh
/// is visible to every reader at once.
struct SessionState {
    status: SessionStatus,
    user: Option<UserProfile>,
    active_conversation: Option<String>,
}

/// The part of the controller the expiry listener needs. It holds no
/// [`ApiClient`], so the listener ends once every client is dropped.
#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<SessionState>>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    store: SessionStore,
    notifications: NotificationQueue,
}

impl Shared {
    fn set_status(&self, state: &mut SessionState, status: SessionStatus) {
        state.status = status;
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    /// Drops the persisted and in-memory session. Returns whether there was
    /// an authenticated session to drop.
    async fn reset(&self) -> bool {
        if let Err(e) = self.store.clear().await {
            tracing::warn!(error = %e, "failed to clear persisted session");
        }
        let mut state = self.state.lock().await;
        let was_authenticated = state.status == SessionStatus::Authenticated;
        state.user = None;
        state.active_conversation = None;
        self.set_status(&mut state, SessionStatus::Unauthenticated);
        was_authenticated
    }

    async fn expire(&self, reason: &str) {
        if self.reset().await {
            tracing::info!(reason = %redact_secrets(reason), "session expired");
            self.notifications.info(SESSION_EXPIRED_MESSAGE);
        }
    }

    async fn handle_signal(&self, signal: SessionSignal) {
        match signal {
            SessionSignal::Expired { reason } => {
                // The refresher clears the store before signalling, so a
                // complete session here belongs to a newer sign-in.
                if matches!(self.store.load().await, Ok(Some(_))) {
                    tracing::debug!("ignoring expiry signal from an earlier session");
                    return;
                }
                self.expire(&reason).await;
            }
        }
    }
}

/// Owns the authentication state of one application instance and is the
/// only writer of it.
#[derive(Clone)]
pub struct SessionController {
    api: ApiClient,
    shared: Shared,
}

impl SessionController {
    /// The receiver of the bus `api` was built with must go to
    /// [`spawn_session_listener`], or forced logouts are never applied.
    pub fn new(api: ApiClient, notifications: NotificationQueue) -> Self {
        let (status_tx, _rx) = watch::channel(SessionStatus::Loading);
        let shared = Shared {
            state: Arc::new(Mutex::new(SessionState {
                status: SessionStatus::Loading,
                user: None,
                active_conversation: None,
            })),
            status_tx: Arc::new(status_tx),
            store: api.store().clone(),
            notifications,
        };
        Self { api, shared }
    }

    /// Builds the client, the controller and the expiry listener in one go.
    /// Must be called inside a tokio runtime.
    pub fn bootstrap(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        store: SessionStore,
        notifications: NotificationQueue,
    ) -> Self {
        let (bus, rx) = SessionBus::channel();
        let api = ApiClient::new(config, transport, store, bus);
        let controller = Self::new(api, notifications);
        spawn_session_listener(&controller, rx);
        controller
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.shared.notifications
    }

    /// Restores a persisted session without waiting on the network. When one
    /// exists the profile is refreshed in the background; the returned
    /// handle tracks that refresh.
    pub async fn initialize(&self) -> Option<JoinHandle<()>> {
        let persisted = match self.shared.store.load().await {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted session");
                None
            }
        };

        let Some(persisted) = persisted else {
            // Leftovers of an incomplete write are not a session.
            if let Err(e) = self.shared.store.clear().await {
                tracing::warn!(error = %e, "failed to clear partial session");
            }
            let mut state = self.shared.state.lock().await;
            self.shared.set_status(&mut state, SessionStatus::Unauthenticated);
            return None;
        };

        {
            let mut state = self.shared.state.lock().await;
            tracing::info!(user = %persisted.user.id, "restored persisted session");
            state.user = Some(persisted.user);
            self.shared.set_status(&mut state, SessionStatus::Authenticated);
        }

        let controller = self.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = controller.fetch_profile().await {
                tracing::warn!(error = %e, "background profile refresh failed, keeping cached profile");
            }
        }))
    }

    async fn complete_auth(
        &self,
        result: Result<AuthResponse, HttpError>,
        fallback: &str,
        greeting: &str,
    ) -> Result<UserProfile, AuthFailure> {
        let response = result.map_err(|e| {
            tracing::info!(error = %redact_secrets(&e.to_string()), "authentication failed");
            AuthFailure::new(failure_message(&e, fallback))
        })?;

        if !response.success {
            let message = response
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| fallback.to_string());
            return Err(AuthFailure::new(message));
        }
        let (Some(user), Some(tokens)) = (response.user, response.tokens) else {
            tracing::warn!("authentication response is missing the user or the tokens");
            return Err(AuthFailure::new(fallback));
        };

        let persisted = PersistedSession {
            access_token: tokens.access,
            refresh_token: tokens.refresh,
            user: user.clone(),
        };
        if let Err(e) = self.shared.store.save(persisted).await {
            tracing::warn!(error = %e, "failed to persist session");
            return Err(AuthFailure::new("Signed in, but the session could not be saved."));
        }

        {
            let mut state = self.shared.state.lock().await;
            state.user = Some(user.clone());
            state.active_conversation = None;
            self.shared.set_status(&mut state, SessionStatus::Authenticated);
        }
        tracing::info!(user = %user.id, "signed in");
        self.shared.notifications.success(greeting);
        Ok(user)
    }

    async fn send_anonymous<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<AuthResponse, HttpError> {
        let body = serde_json::to_value(body)
            .map_err(|e| HttpError::InvalidResponse(format!("unserializable body: {e}")))?;
        self.api
            .send_as(Method::POST, path, Some(body), SendOptions::without_refresh())
            .await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, AuthFailure> {
        let email = email.trim();
        let result = self
            .send_anonymous(LOGIN_PATH, &LoginRequest { email, password })
            .await;
        self.complete_auth(result, LOGIN_FALLBACK, "Signed in successfully.")
            .await
    }

    pub async fn register(&self, request: &RegistrationRequest) -> Result<UserProfile, AuthFailure> {
        let result = self.send_anonymous(REGISTER_PATH, request).await;
        self.complete_auth(result, REGISTER_FALLBACK, "Account created successfully.")
            .await
    }

    /// Ends the session. The server call is best effort; local state is
    /// cleared regardless. Safe to call repeatedly.
    pub async fn logout(&self) {
        if let Some(refresh) = self.shared.store.refresh_token().await {
            let body = serde_json::json!({ "refresh_token": refresh });
            if let Err(e) = self
                .api
                .send(Method::POST, LOGOUT_PATH, Some(body), SendOptions::without_refresh())
                .await
            {
                tracing::warn!(error = %redact_secrets(&e.to_string()), "server logout failed");
            }
        }

        if self.shared.reset().await {
            tracing::info!("signed out");
            self.shared.notifications.success("Signed out.");
        }
    }

    async fn store_profile(&self, user: &UserProfile) {
        {
            let mut state = self.shared.state.lock().await;
            if state.status != SessionStatus::Authenticated {
                return;
            }
            state.user = Some(user.clone());
        }
        if let Err(e) = self.shared.store.replace_user(user.clone()).await {
            tracing::warn!(error = %e, "failed to persist profile");
        }
    }

    /// Replaces the cached profile with the server's. Failures leave the
    /// session as it was.
    pub async fn fetch_profile(&self) -> Result<UserProfile, HttpError> {
        let user: UserProfile = self.api.get(PROFILE_PATH).await?;
        self.store_profile(&user).await;
        Ok(user)
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, HttpError> {
        let user: UserProfile = self.api.patch(PROFILE_PATH, update).await?;
        self.store_profile(&user).await;
        self.shared.notifications.success("Profile updated.");
        Ok(user)
    }

    pub async fn change_password(&self, change: &PasswordChange) -> Result<String, AuthFailure> {
        let response = self
            .api
            .post::<StatusResponse, _>(CHANGE_PASSWORD_PATH, change)
            .await
            .map_err(|e| AuthFailure::new(failure_message(&e, CHANGE_PASSWORD_FALLBACK)))?;
        let message = response.message.filter(|m| !m.trim().is_empty());
        if !response.success {
            return Err(AuthFailure::new(
                message.unwrap_or_else(|| CHANGE_PASSWORD_FALLBACK.to_string()),
            ));
        }
        Ok(message.unwrap_or_else(|| "Password changed successfully.".to_string()))
    }

    pub async fn select_conversation(&self, conversation_id: Option<String>) {
        let id = conversation_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        self.shared.state.lock().await.active_conversation = id;
    }

    pub async fn active_conversation(&self) -> Option<String> {
        self.shared.state.lock().await.active_conversation.clone()
    }

    pub async fn open_chat_stream(&self) -> Result<StreamConnection, StreamError> {
        let conversation = self
            .active_conversation()
            .await
            .ok_or(StreamError::NoActiveConversation)?;
        Ok(self.api.connect_stream(&chat_channel(&conversation)).await?)
    }

    /// Forced logout: clears the session without contacting the server and
    /// tells the user why.
    pub async fn expire(&self, reason: &str) {
        self.shared.expire(reason).await;
    }

    pub async fn status(&self) -> SessionStatus {
        self.shared.state.lock().await.status
    }

    /// The current tokens, read from the store, with the signed-in user.
    pub async fn session(&self) -> Session {
        let user = self.user().await;
        match self.shared.store.load().await {
            Ok(Some(persisted)) if user.is_some() => Session {
                user,
                ..persisted.into()
            },
            _ => Session::default(),
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session().await.is_authenticated()
    }

    pub async fn user(&self) -> Option<UserProfile> {
        self.shared.state.lock().await.user.clone()
    }

    pub async fn view(&self) -> SessionView {
        let is_authenticated = self.is_authenticated().await;
        let state = self.shared.state.lock().await;
        SessionView {
            status: state.status,
            is_authenticated,
            user: state.user.clone(),
            active_conversation: state.active_conversation.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }
}

fn failure_message(error: &HttpError, fallback: &str) -> String {
    match error {
        HttpError::Transport(_) => UNREACHABLE_MESSAGE.to_string(),
        HttpError::Auth { message, .. } | HttpError::Client { message, .. }
            if !message.starts_with("HTTP ") =>
        {
            redact_secrets(message).into_owned()
        }
        _ => fallback.to_string(),
    }
}

/// Applies [`SessionSignal`]s from the refresher until every sender is gone.
pub fn spawn_session_listener(
    controller: &SessionController,
    mut rx: mpsc::UnboundedReceiver<SessionSignal>,
) -> JoinHandle<()> {
    let shared = controller.shared.clone();
    tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            shared.handle_signal(signal).await;
        }
        tracing::debug!("session listener stopped");
    })
}
