//! Scripted transport for unit tests.

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::http::transport::{HttpRequest, HttpResponse, RequestBody, Transport};
use crate::state::{PersistedSession, SessionStore};
use crate::types::UserProfile;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Method;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_API_URL: &str = "http://api.test/api";
pub const TEST_WS_URL: &str = "ws://rt.test:8001";

pub fn test_config() -> ClientConfig {
    ClientConfig::new(TEST_API_URL, TEST_WS_URL).unwrap()
}

pub fn profile(email: &str) -> UserProfile {
    serde_json::from_value(serde_json::json!({
        "id": 42,
        "email": email,
        "full_name": "Ada Lovelace",
        "company_name": "Analytical Engines"
    }))
    .unwrap()
}

pub async fn seeded_store(access: &str) -> SessionStore {
    let store = SessionStore::in_memory();
    store
        .save(PersistedSession {
            access_token: access.to_string(),
            refresh_token: "refresh-1".to_string(),
            user: profile("ada@example.com"),
        })
        .await
        .unwrap();
    store
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    /// URL relative to the API base, e.g. `auth/login/`.
    pub path: String,
    pub bearer: Option<String>,
    pub json: Option<Value>,
    pub uploaded: Option<u64>,
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: Bytes,
    pub delay: Option<Duration>,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Bytes::from(body.to_string()),
            delay: None,
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            body: Bytes::from(body.to_string()),
            delay: None,
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: Bytes::new(),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Handler = dyn Fn(&Recorded) -> Result<Reply, TransportError> + Send + Sync;

pub struct ScriptedTransport {
    handler: Box<Handler>,
    log: Mutex<Vec<Recorded>>,
}

impl ScriptedTransport {
    pub fn new(
        handler: impl Fn(&Recorded) -> Result<Reply, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, method: &Method, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| &r.method == method && r.path == path)
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            bearer,
            body,
        } = request;
        let path = url
            .strip_prefix(TEST_API_URL)
            .unwrap_or(&url)
            .trim_start_matches('/')
            .to_string();

        let (json, uploaded, fields) = match body {
            RequestBody::Empty => (None, None, Vec::new()),
            RequestBody::Json(value) => (Some(value), None, Vec::new()),
            RequestBody::Multipart(multipart) => {
                let mut stream = multipart.file.stream;
                let mut sent = 0_u64;
                while let Some(chunk) = stream.next().await {
                    sent += chunk.map(|c| c.len() as u64).unwrap_or(0);
                    tokio::task::yield_now().await;
                }
                (None, Some(sent), multipart.fields)
            }
        };

        let recorded = Recorded {
            method,
            path,
            bearer,
            json,
            uploaded,
            fields,
        };
        self.log.lock().unwrap().push(recorded.clone());

        let reply = (self.handler)(&recorded)?;
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(HttpResponse {
            status: reply.status,
            body: reply.body,
        })
    }
}
