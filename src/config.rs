use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const ENV_API_URL: &str = "KYS_API_URL";
pub const ENV_WS_URL: &str = "KYS_WS_URL";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "KYS_HTTP_TIMEOUT_SECS";
pub const ENV_SESSION_FILE: &str = "KYS_SESSION_FILE";

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SESSION_FILE: &str = ".kys-session.json";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub ws_url: Url,
    pub timeout: Duration,
    pub session_file: PathBuf,
}

fn parse_origin(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|source| ConfigError::InvalidUrl { name, source })?;
    if url.host_str().is_none() {
        return Err(ConfigError::MissingHost { name });
    }
    Ok(url)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ClientConfig {
    pub fn new(api_url: &str, ws_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            api_url: parse_origin(ENV_API_URL, api_url)?,
            ws_url: parse_origin(ENV_WS_URL, ws_url)?,
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            session_file: PathBuf::from(DEFAULT_SESSION_FILE),
        })
    }

    /// Reads the process environment, after loading a `.env` file if one is
    /// present. Unset variables fall back to the local development origin.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = non_empty(lookup(ENV_API_URL)).unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let ws_url = non_empty(lookup(ENV_WS_URL)).unwrap_or_else(|| DEFAULT_WS_URL.to_string());
        let mut config = Self::new(&api_url, &ws_url)?;

        if let Some(raw) = non_empty(lookup(ENV_HTTP_TIMEOUT_SECS)) {
            let secs = raw.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
                name: ENV_HTTP_TIMEOUT_SECS,
                value: raw.clone(),
            })?;
            config.timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(path) = non_empty(lookup(ENV_SESSION_FILE)) {
            config.session_file = PathBuf::from(path);
        }
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_file = path.into();
        self
    }

    /// Absolute URL for an API path. Query strings are passed through.
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.api_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    /// Streaming transport is secure exactly when the HTTP origin is.
    pub fn stream_secure(&self) -> bool {
        self.api_url.scheme() == "https"
    }

    pub fn stream_host(&self) -> String {
        let host = self.ws_url.host_str().unwrap_or("localhost");
        match self.ws_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn from_lookup_defaults_to_local_development_origins() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.endpoint("/auth/login/"), "http://localhost:8000/api/auth/login/");
        assert_eq!(config.stream_host(), "localhost:8000");
        assert!(!config.stream_secure());
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn from_lookup_reads_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://stats.example.com/api/"),
            (ENV_WS_URL, "wss://rt.example.com"),
            (ENV_HTTP_TIMEOUT_SECS, "5"),
            (ENV_SESSION_FILE, "/tmp/s.json"),
        ]))
        .unwrap();
        assert_eq!(config.endpoint("datasets/"), "https://stats.example.com/api/datasets/");
        assert!(config.stream_secure());
        assert_eq!(config.stream_host(), "rt.example.com");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.session_file, PathBuf::from("/tmp/s.json"));
    }

    #[test]
    fn from_lookup_rejects_garbage() {
        assert!(ClientConfig::from_lookup(lookup(&[(ENV_API_URL, "not a url")])).is_err());
        assert!(ClientConfig::from_lookup(lookup(&[(ENV_HTTP_TIMEOUT_SECS, "soon")])).is_err());
    }
}
