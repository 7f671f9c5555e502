use crate::config::ClientConfig;
use crate::error::HttpError;
use crate::http::transport::{
    FilePart, HttpRequest, HttpResponse, MultipartBody, RequestBody, Transport,
};
use crate::http::upload::{ProgressSender, ProgressTracker, UploadFile, UploadStream};
use crate::refresh::TokenRefresher;
use crate::state::{SessionBus, SessionStore};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// A request that got a 401 is replayed at most this many times.
pub const MAX_AUTH_RETRIES: u8 = 1;

const MAX_TEXT_MESSAGE_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Whether a 401 may trigger a credential refresh and a replay.
    pub allow_refresh: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            allow_refresh: true,
        }
    }
}

impl SendOptions {
    pub fn without_refresh() -> Self {
        Self {
            allow_refresh: false,
        }
    }
}

fn read_string(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn first_field_error(root: &serde_json::Map<String, Value>) -> Option<String> {
    for (field, value) in root {
        let message = match value {
            Value::Array(items) => items.iter().find_map(|v| read_string(Some(v))),
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        };
        if let Some(message) = message {
            return Some(if field == "non_field_errors" {
                message
            } else {
                format!("{field}: {message}")
            });
        }
    }
    None
}

/// Best human-readable message in an error body.
pub(crate) fn extract_message(body: &[u8], status: u16) -> String {
    if let Ok(Value::Object(root)) = serde_json::from_slice::<Value>(body) {
        for key in ["message", "detail", "error"] {
            if let Some(message) = read_string(root.get(key)) {
                return message;
            }
        }
        if let Some(message) = first_field_error(&root) {
            return message;
        }
        return format!("HTTP {status}");
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() || text.starts_with('<') {
        return format!("HTTP {status}");
    }
    text.chars().take(MAX_TEXT_MESSAGE_LEN).collect()
}

pub(crate) fn classify(response: HttpResponse) -> Result<HttpResponse, HttpError> {
    let status = response.status;
    if response.is_success() {
        return Ok(response);
    }
    let message = extract_message(&response.body, status);
    match status {
        401 => Err(HttpError::Auth { status, message }),
        400..=499 => Err(HttpError::Client { status, message }),
        500..=599 => Err(HttpError::Server { status, message }),
        _ => Err(HttpError::InvalidResponse(format!("unexpected status {status}"))),
    }
}

pub(crate) fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T, HttpError> {
    let body = response.body.as_ref();
    let parsed = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::from_value(Value::Null)
    } else {
        serde_json::from_slice(body)
    };
    parsed.map_err(|e| HttpError::InvalidResponse(e.to_string()))
}

/// Authenticated client for the application API. Cloning is cheap and
/// shares the transport, the store and the refresher.
#[derive(Clone)]
pub struct ApiClient {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    store: SessionStore,
    refresher: TokenRefresher,
}

impl ApiClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        store: SessionStore,
        bus: SessionBus,
    ) -> Self {
        let refresher = TokenRefresher::new(&config, transport.clone(), store.clone(), bus);
        Self {
            config: Arc::new(config),
            transport,
            store,
            refresher,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn refresher(&self) -> &TokenRefresher {
        &self.refresher
    }

    /// Sends one logical request. The body is rebuilt for every attempt, so
    /// a replay never shares state with the request that got the 401.
    async fn dispatch<F>(
        &self,
        method: Method,
        path: &str,
        options: SendOptions,
        mut body: F,
    ) -> Result<HttpResponse, HttpError>
    where
        F: FnMut() -> RequestBody + Send,
    {
        let url = self.config.endpoint(path);
        let mut token = self.store.access_token().await;
        let mut attempt: u8 = 0;

        loop {
            tracing::debug!(%method, %url, attempt, authenticated = token.is_some(), "dispatching request");
            let request = HttpRequest {
                method: method.clone(),
                url: url.clone(),
                bearer: token.clone(),
                body: body(),
            };
            let response = match self.transport.execute(request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(%method, %url, error = %e, "request failed without a response");
                    return Err(e.into());
                }
            };

            let may_refresh = options.allow_refresh && token.is_some() && attempt < MAX_AUTH_RETRIES;
            if response.status == 401 && may_refresh {
                attempt += 1;
                tracing::debug!(%url, "access token rejected, refreshing");
                token = Some(self.refresher.refresh_after(token.as_deref()).await?);
                continue;
            }

            let result = classify(response);
            if let Err(e) = &result {
                tracing::debug!(%method, %url, error = %e, "request returned an error status");
            }
            return result;
        }
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: SendOptions,
    ) -> Result<Value, HttpError> {
        self.send_as(method, path, body, options).await
    }

    pub async fn send_as<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: SendOptions,
    ) -> Result<T, HttpError> {
        let response = self
            .dispatch(method, path, options, || match &body {
                Some(value) => RequestBody::Json(value.clone()),
                None => RequestBody::Empty,
            })
            .await?;
        decode(&response)
    }

    fn to_json<B: Serialize + ?Sized>(body: &B) -> Result<Value, HttpError> {
        serde_json::to_value(body)
            .map_err(|e| HttpError::InvalidResponse(format!("unserializable body: {e}")))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, HttpError> {
        self.send_as(Method::GET, path, None, SendOptions::default()).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, HttpError> {
        let body = Self::to_json(body)?;
        self.send_as(Method::POST, path, Some(body), SendOptions::default()).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, HttpError> {
        let body = Self::to_json(body)?;
        self.send_as(Method::PUT, path, Some(body), SendOptions::default()).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, HttpError> {
        let body = Self::to_json(body)?;
        self.send_as(Method::PATCH, path, Some(body), SendOptions::default()).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, HttpError> {
        self.send_as(Method::DELETE, path, None, SendOptions::default()).await
    }

    /// Multipart upload of `file` plus extra text fields. Progress goes to
    /// `progress` as non-decreasing observations. The full size is reported
    /// once the last chunk is handed to the transport, before the server
    /// answers; a later server error still fails the call.
    pub async fn upload<T: DeserializeOwned>(
        &self,
        path: &str,
        file: UploadFile,
        fields: Vec<(String, String)>,
        progress: Option<ProgressSender>,
    ) -> Result<T, HttpError> {
        let tracker = ProgressTracker::new(file.total_bytes(), progress);
        let response = self
            .dispatch(Method::POST, path, SendOptions::default(), || {
                RequestBody::Multipart(MultipartBody {
                    fields: fields.clone(),
                    file: FilePart {
                        field: file.field.clone(),
                        file_name: file.file_name.clone(),
                        mime: file.mime.clone(),
                        stream: UploadStream::new(file.content.clone(), tracker.clone()),
                    },
                })
            })
            .await?;
        let value = decode(&response)?;
        tracker.finish();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RefreshError, TransportError};
    use crate::http::testing::{seeded_store, Reply, ScriptedTransport};
    use crate::types::UploadProgress;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    const PROFILE: &str = "auth/profile/";
    const REFRESH: &str = "auth/token/refresh/";

    fn client(transport: Arc<ScriptedTransport>, store: SessionStore) -> ApiClient {
        let (bus, _rx) = SessionBus::channel();
        ApiClient::new(crate::http::testing::test_config(), transport, store, bus)
    }

    #[test]
    fn extract_message_prefers_message_then_detail_then_field_errors() {
        assert_eq!(extract_message(br#"{"success":false,"message":"Bad"}"#, 400), "Bad");
        assert_eq!(extract_message(br#"{"detail":"Not found."}"#, 404), "Not found.");
        assert_eq!(
            extract_message(br#"{"password":["Password fields didn't match."]}"#, 400),
            "password: Password fields didn't match."
        );
        assert_eq!(
            extract_message(br#"{"non_field_errors":["Invalid credentials"]}"#, 400),
            "Invalid credentials"
        );
        assert_eq!(extract_message(b"<html>oops</html>", 502), "HTTP 502");
        assert_eq!(extract_message(b"", 500), "HTTP 500");
        assert_eq!(extract_message(b"upstream timeout", 504), "upstream timeout");
    }

    #[test]
    fn classify_maps_status_ranges() {
        let response = |status| HttpResponse {
            status,
            body: bytes::Bytes::from_static(br#"{"detail":"x"}"#),
        };
        assert!(matches!(classify(response(200)), Ok(_)));
        assert!(matches!(classify(response(401)), Err(HttpError::Auth { status: 401, .. })));
        assert!(matches!(classify(response(404)), Err(HttpError::Client { status: 404, .. })));
        assert!(matches!(classify(response(503)), Err(HttpError::Server { status: 503, .. })));
    }

    #[tokio::test]
    async fn attaches_bearer_only_when_a_session_exists() {
        let transport = ScriptedTransport::new(|_| Ok(Reply::json(200, json!({"ok": true}))));

        let anonymous = client(transport.clone(), SessionStore::in_memory());
        let _: Value = anonymous.get("reports/").await.unwrap();

        let signed_in = client(transport.clone(), seeded_store("access-1").await);
        let _: Value = signed_in.get("reports/").await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests[0].bearer, None);
        assert_eq!(requests[1].bearer.as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn replays_once_with_the_refreshed_token() {
        let transport = ScriptedTransport::new(|req| match req.path.as_str() {
            REFRESH => Ok(Reply::json(200, json!({"access": "access-2"}))),
            _ if req.bearer.as_deref() == Some("access-2") => Ok(Reply::json(200, json!({"id": 1}))),
            _ => Ok(Reply::json(401, json!({"detail": "Token expired"}))),
        });
        let store = seeded_store("access-1").await;
        let api = client(transport.clone(), store.clone());

        let value: Value = api.get(PROFILE).await.unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(transport.count(&Method::POST, REFRESH), 1);
        assert_eq!(transport.count(&Method::GET, PROFILE), 2);
        assert_eq!(store.access_token().await.as_deref(), Some("access-2"));
    }

    #[tokio::test]
    async fn second_401_is_terminal_without_a_third_attempt() {
        let transport = ScriptedTransport::new(|req| match req.path.as_str() {
            REFRESH => Ok(Reply::json(200, json!({"access": "access-2"}))),
            _ => Ok(Reply::json(401, json!({"detail": "Still no"}))),
        });
        let api = client(transport.clone(), seeded_store("access-1").await);

        let err = api.get::<Value>(PROFILE).await.unwrap_err();
        assert_eq!(
            err,
            HttpError::Auth {
                status: 401,
                message: "Still no".to_string()
            }
        );
        assert_eq!(transport.count(&Method::GET, PROFILE), 2);
        assert_eq!(transport.count(&Method::POST, REFRESH), 1);
    }

    #[tokio::test]
    async fn anonymous_401_never_refreshes() {
        let transport =
            ScriptedTransport::new(|_| Ok(Reply::json(401, json!({"detail": "Invalid credentials"}))));
        let api = client(transport.clone(), SessionStore::in_memory());

        let err = api
            .post::<Value, _>("auth/login/", &json!({"email": "a", "password": "b"}))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Auth { .. }));
        assert_eq!(transport.count(&Method::POST, REFRESH), 0);
    }

    #[tokio::test]
    async fn concurrent_401s_share_a_single_refresh() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = refreshes.clone();
        let transport = ScriptedTransport::new(move |req| match req.path.as_str() {
            REFRESH => {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::json(200, json!({"access": "fresh"})).delayed(std::time::Duration::from_millis(20)))
            }
            _ if req.bearer.as_deref() == Some("fresh") => Ok(Reply::json(200, json!({"path": req.path}))),
            _ => Ok(Reply::json(401, json!({"detail": "expired"}))
                .delayed(std::time::Duration::from_millis(5))),
        });
        let api = client(transport.clone(), seeded_store("stale").await);

        let mut handles = Vec::new();
        for i in 0..8 {
            let api = api.clone();
            handles.push(tokio::spawn(async move { api.get::<Value>(&format!("datasets/{i}/")).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        let replays = transport
            .requests()
            .into_iter()
            .filter(|r| r.path != REFRESH && r.bearer.as_deref() == Some("fresh"))
            .count();
        assert_eq!(replays, 8);
    }

    #[tokio::test]
    async fn failed_refresh_fails_every_waiter_identically() {
        let transport = ScriptedTransport::new(|req| match req.path.as_str() {
            REFRESH => Ok(
                Reply::json(401, json!({"detail": "Token is blacklisted"}))
                    .delayed(std::time::Duration::from_millis(20)),
            ),
            _ => Ok(Reply::json(401, json!({"detail": "expired"}))),
        });
        let store = seeded_store("stale").await;
        let api = client(transport.clone(), store.clone());

        let (a, b, c) = tokio::join!(
            api.get::<Value>("reports/"),
            api.get::<Value>("datasets/"),
            api.get::<Value>(PROFILE)
        );
        let expected = HttpError::Refresh(RefreshError::Rejected {
            status: 401,
            message: "Token is blacklisted".to_string(),
        });
        assert_eq!(a.unwrap_err(), expected);
        assert_eq!(b.unwrap_err(), expected);
        assert_eq!(c.unwrap_err(), expected);
        assert_eq!(transport.count(&Method::POST, REFRESH), 1);
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn transport_failures_are_not_application_failures() {
        let transport = ScriptedTransport::new(|_| Err(TransportError::new("connection refused")));
        let api = client(transport, SessionStore::in_memory());
        let err = api.get::<Value>("reports/").await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(err.status(), None);
    }

    #[tokio::test]
    async fn error_statuses_carry_the_server_message() {
        let transport = ScriptedTransport::new(|req| match req.path.as_str() {
            "missing/" => Ok(Reply::json(404, json!({"success": false, "message": "Dataset not found"}))),
            _ => Ok(Reply::text(500, "boom")),
        });
        let api = client(transport, SessionStore::in_memory());

        let err = api.delete::<Value>("missing/").await.unwrap_err();
        assert_eq!(
            err,
            HttpError::Client {
                status: 404,
                message: "Dataset not found".to_string()
            }
        );
        let err = api.put::<Value, _>("broken/", &json!({})).await.unwrap_err();
        assert_eq!(
            err,
            HttpError::Server {
                status: 500,
                message: "boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn empty_success_body_decodes_as_null() {
        let transport = ScriptedTransport::new(|_| Ok(Reply::empty(204)));
        let api = client(transport, SessionStore::in_memory());
        let value: Value = api.delete("datasets/1/").await.unwrap();
        assert_eq!(value, Value::Null);
        let unit: Option<Value> = api.delete("datasets/1/").await.unwrap();
        assert_eq!(unit, None);
    }

    #[tokio::test]
    async fn upload_progress_is_monotonic_and_ends_at_100() {
        let transport = ScriptedTransport::new(|req| match req.path.as_str() {
            REFRESH => Ok(Reply::json(200, json!({"access": "access-2"}))),
            _ if req.bearer.as_deref() == Some("access-2") => Ok(Reply::json(201, json!({"success": true}))),
            _ => Ok(Reply::json(401, json!({"detail": "expired"}))),
        });
        let api = client(transport.clone(), seeded_store("access-1").await);
        let (tx, mut rx) = mpsc::unbounded_channel::<UploadProgress>();

        let file = UploadFile::new("sales.csv", vec![7_u8; 200_000]).with_mime("text/csv");
        let value: Value = api
            .upload(
                "datasets/",
                file,
                vec![("description".to_string(), "Q3".to_string())],
                Some(tx),
            )
            .await
            .unwrap();
        assert_eq!(value["success"], true);

        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p.percent());
        }
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100));

        let uploads: Vec<_> = transport.requests().into_iter().filter(|r| r.path == "datasets/").collect();
        assert_eq!(uploads.len(), 2);
        assert!(uploads.iter().all(|r| r.uploaded == Some(200_000)));
        assert_eq!(uploads[1].fields, vec![("description".to_string(), "Q3".to_string())]);
    }

    #[tokio::test]
    async fn upload_reaches_100_even_when_the_server_then_fails() {
        let transport = ScriptedTransport::new(|_| Ok(Reply::json(500, json!({"detail": "disk full"}))));
        let api = client(transport, seeded_store("access-1").await);
        let (tx, mut rx) = mpsc::unbounded_channel::<UploadProgress>();

        let file = UploadFile::new("sales.csv", vec![1_u8; 50_000]);
        let result: Result<Value, HttpError> = api.upload("datasets/", file, Vec::new(), Some(tx)).await;
        assert!(matches!(result, Err(HttpError::Server { .. })));

        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            last = Some(p.percent());
        }
        assert_eq!(last, Some(100));
    }
}
