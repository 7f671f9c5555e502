use crate::config::ClientConfig;
use crate::error::{HttpError, TransportError};
use crate::http::client::ApiClient;
use crate::redact::redact_secrets;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type StreamConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `<ws|wss>://<host>/ws/<channel>/?token=<accessToken>`. The query is
/// omitted when there is no token.
pub fn stream_url(config: &ClientConfig, channel: &str, access_token: Option<&str>) -> String {
    let scheme = if config.stream_secure() { "wss" } else { "ws" };
    let channel = channel.trim().trim_matches('/');
    let mut url = format!("{scheme}://{}/ws/{channel}/", config.stream_host());
    if let Some(token) = access_token {
        url.push_str("?token=");
        url.push_str(&urlencoding::encode(token));
    }
    url
}

pub fn chat_channel(conversation_id: &str) -> String {
    format!("chat/{}", urlencoding::encode(conversation_id.trim()))
}

impl ApiClient {
    pub async fn stream_url(&self, channel: &str) -> String {
        let token = self.store().access_token().await;
        stream_url(self.config(), channel, token.as_deref())
    }

    /// Opens a persistent bidirectional connection on `channel`,
    /// authenticated with the current access token.
    pub async fn connect_stream(&self, channel: &str) -> Result<StreamConnection, HttpError> {
        let url = self.stream_url(channel).await;
        tracing::debug!(url = %redact_secrets(&url), "opening stream connection");
        match tokio_tungstenite::connect_async(url).await {
            Ok((stream, _response)) => Ok(stream),
            Err(e) => {
                let message = redact_secrets(&e.to_string()).into_owned();
                tracing::warn!(%channel, error = %message, "stream connection failed");
                Err(TransportError::new(message).into())
            }
        }
    }
}
