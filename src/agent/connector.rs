use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

use crate::config::{AgentConfig, CredentialMode};

pub type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Credential attached to the agent handshake.
#[derive(Debug, Clone)]
pub enum Credential {
    None,
    Header { name: HeaderName, value: HeaderValue },
}

impl Credential {
    pub fn header(name: &str, value: &str) -> Result<Self, ConnectorConfigError> {
        if value.is_empty() {
            return Ok(Credential::None);
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConnectorConfigError::HeaderName(e.to_string()))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|e| ConnectorConfigError::HeaderValue(e.to_string()))?;
        value.set_sensitive(true);
        Ok(Credential::Header { name, value })
    }
}

/// Open a WebSocket to `destination`, presenting `credential` on the handshake.
///
/// The handshake is bounded by `timeout`. Nothing is retried here.
pub async fn connect(
    destination: &str,
    credential: &Credential,
    timeout: Duration,
) -> Result<AgentSocket, ConnectError> {
    let mut request = destination
        .into_client_request()
        .map_err(|e| ConnectError::Protocol(format!("invalid agent URL: {e}")))?;

    if let Credential::Header { name, value } = credential {
        request.headers_mut().insert(name.clone(), value.clone());
    }

    let (socket, response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| {
            ConnectError::Network(format!(
                "handshake timed out after {}ms",
                timeout.as_millis()
            ))
        })??;

    tracing::debug!(status = %response.status(), "Agent handshake complete");
    Ok(socket)
}

/// Resolves the agent destination and credential from config and opens connections.
pub struct AgentConnector {
    mode: CredentialMode,
    destination: String,
    signed_url_endpoint: String,
    credential: Credential,
    connect_timeout: Duration,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

impl AgentConnector {
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConnectorConfigError> {
        Ok(Self {
            mode: config.credential_mode,
            destination: resolve_template(&config.url_template, &config.agent_id),
            signed_url_endpoint: resolve_template(&config.signed_url_endpoint, &config.agent_id),
            credential: Credential::header(&config.credential_header, &config.api_key)?,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            http: reqwest::Client::new(),
        })
    }

    /// Where connections go, for logging. Signed URLs are only known per call.
    pub fn describe(&self) -> &str {
        match self.mode {
            CredentialMode::Header => &self.destination,
            CredentialMode::SignedUrl => &self.signed_url_endpoint,
        }
    }

    pub async fn connect(&self) -> Result<AgentSocket, ConnectError> {
        match self.mode {
            CredentialMode::Header => {
                connect(&self.destination, &self.credential, self.connect_timeout).await
            }
            CredentialMode::SignedUrl => {
                let url = self.fetch_signed_url().await?;
                // The signature in the URL is the credential
                connect(&url, &Credential::None, self.connect_timeout).await
            }
        }
    }

    /// Exchange the API key for a one-time signed WebSocket URL.
    async fn fetch_signed_url(&self) -> Result<String, ConnectError> {
        let mut req = self
            .http
            .get(&self.signed_url_endpoint)
            .timeout(self.connect_timeout);
        if let Credential::Header { name, value } = &self.credential {
            req = req.header(name.as_str(), value.as_bytes());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ConnectError::Network(format!("signed URL request failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ConnectError::Auth(format!(
                "signed URL request rejected: HTTP {status}"
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ConnectError::Protocol(format!(
                "signed URL request failed: HTTP {status}: {body}"
            )));
        }

        let parsed: SignedUrlResponse = resp
            .json()
            .await
            .map_err(|e| ConnectError::Protocol(format!("bad signed URL response: {e}")))?;

        tracing::debug!("Obtained signed agent URL");
        Ok(parsed.signed_url)
    }
}

pub fn resolve_template(template: &str, agent_id: &str) -> String {
    template.replace("{agent_id}", agent_id)
}

/// Why the agent connection could not be established.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectError {
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectError::Network(_) => "network",
            ConnectError::Auth(_) => "auth",
            ConnectError::Protocol(_) => "protocol",
        }
    }

    /// Rejected credentials will be rejected again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectError::Auth(_))
    }
}

impl From<tungstenite::Error> for ConnectError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Http(resp)
                if resp.status() == StatusCode::UNAUTHORIZED
                    || resp.status() == StatusCode::FORBIDDEN =>
            {
                ConnectError::Auth(format!("agent rejected handshake: HTTP {}", resp.status()))
            }
            tungstenite::Error::Http(resp) => {
                ConnectError::Protocol(format!("unexpected handshake response: HTTP {}", resp.status()))
            }
            tungstenite::Error::Io(e) => ConnectError::Network(e.to_string()),
            tungstenite::Error::Tls(e) => ConnectError::Network(format!("TLS: {e}")),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                ConnectError::Network("connection closed during handshake".into())
            }
            other => ConnectError::Protocol(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorConfigError {
    #[error("invalid credential header name: {0}")]
    HeaderName(String),
    #[error("invalid credential value: {0}")]
    HeaderValue(String),
}
