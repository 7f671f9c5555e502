use crate::error::TransportError;
use crate::http::upload::UploadStream;
use crate::redact::redact_secrets;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;

pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub body: RequestBody,
}

pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(MultipartBody),
}

pub struct MultipartBody {
    pub fields: Vec<(String, String)>,
    pub file: FilePart,
}

pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub mime: Option<String>,
    pub stream: UploadStream,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Puts a request on the wire. Any response, whatever its status, is `Ok`;
/// `Err` means no response was received.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

fn build_headers(bearer: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Some(token) = bearer {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }
    }
    headers
}

fn network_error(e: reqwest::Error) -> TransportError {
    let kind = if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    TransportError::new(format!("{kind}: {}", redact_secrets(&e.to_string())))
}

fn build_form(body: MultipartBody) -> Result<Form, TransportError> {
    let mut form = Form::new();
    for (name, value) in body.fields {
        form = form.text(name, value);
    }

    let FilePart {
        field,
        file_name,
        mime,
        stream,
    } = body.file;
    let len = stream.total_bytes();
    let mut part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), len).file_name(file_name);
    if let Some(mime) = mime {
        part = part.mime_str(&mime).map_err(network_error)?;
    }
    Ok(form.part(field, part))
}

pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .map_err(network_error)?,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            bearer,
            body,
        } = request;

        let builder = self
            .http
            .request(method, url.as_str())
            .headers(build_headers(bearer.as_deref()));
        let builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(multipart) => builder.multipart(build_form(multipart)?),
        };

        let res = builder.send().await.map_err(network_error)?;
        let status = res.status().as_u16();
        let body = res.bytes().await.map_err(network_error)?;
        Ok(HttpResponse { status, body })
    }
}
