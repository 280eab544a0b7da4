use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub external_url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

/// How the agent credential is presented.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    /// API key sent as a header on the WebSocket handshake.
    #[default]
    Header,
    /// API key exchanged for a short-lived signed URL before each call.
    SignedUrl,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// WebSocket URL of the agent; `{agent_id}` is substituted.
    #[serde(default = "default_url_template")]
    pub url_template: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_credential_header")]
    pub credential_header: String,
    #[serde(default)]
    pub credential_mode: CredentialMode,
    /// HTTPS endpoint returning `{"signed_url": ...}`; `{agent_id}` is substituted.
    #[serde(default = "default_signed_url_endpoint")]
    pub signed_url_endpoint: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Extra connect attempts after the first one fails. Credential rejections are never retried.
    #[serde(default)]
    pub connect_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_url_template() -> String {
    "wss://api.elevenlabs.io/v1/convai/conversation?agent_id={agent_id}".to_string()
}

fn default_credential_header() -> String {
    "xi-api-key".to_string()
}

fn default_signed_url_endpoint() -> String {
    "https://api.elevenlabs.io/v1/convai/conversation/get_signed_url?agent_id={agent_id}"
        .to_string()
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_retry_backoff() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_audio_field")]
    pub audio_field: String,
    #[serde(default)]
    pub forward_caller_control: bool,
    #[serde(default)]
    pub forward_agent_events: bool,
    /// Frames queued per session for broadcast and keep-alive replies.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    /// How long teardown waits for the second pump before aborting it.
    #[serde(default = "default_teardown_timeout")]
    pub teardown_timeout_ms: u64,
    /// Longest a single frame write may block before the peer is treated as gone.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            audio_field: default_audio_field(),
            forward_caller_control: false,
            forward_agent_events: false,
            outbox_capacity: default_outbox_capacity(),
            teardown_timeout_ms: default_teardown_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

pub fn default_audio_field() -> String {
    "user_audio_chunk".to_string()
}

fn default_outbox_capacity() -> usize {
    64
}

fn default_teardown_timeout() -> u64 {
    2_000
}

fn default_write_timeout() -> u64 {
    5_000
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file from same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            format!(
                "Failed to read config at {}: {}. Copy config.example.toml to {}",
                path.display(),
                e,
                path.display()
            )
        })?;

        let mut config = Self::from_toml(&contents)?;

        // Secrets and per-deployment ids come from the environment when set
        if let Ok(v) = std::env::var("ELEVENLABS_API_KEY") {
            config.agent.api_key = v;
        }
        if let Ok(v) = std::env::var("ELEVENLABS_AGENT_ID") {
            config.agent.agent_id = v;
        }
        if let Ok(v) = std::env::var("SERVER_EXTERNAL_URL") {
            config.server.external_url = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn validate(&self) -> Result<(), String> {
        let needs_agent_id = self.agent.url_template.contains("{agent_id}")
            || (self.agent.credential_mode == CredentialMode::SignedUrl
                && self.agent.signed_url_endpoint.contains("{agent_id}"));
        if needs_agent_id && self.agent.agent_id.is_empty() {
            return Err("agent.agent_id is empty (set it or ELEVENLABS_AGENT_ID)".into());
        }
        if self.agent.credential_mode == CredentialMode::SignedUrl && self.agent.api_key.is_empty()
        {
            return Err("agent.credential_mode = \"signed_url\" requires an API key".into());
        }
        if self.relay.outbox_capacity == 0 {
            return Err("relay.outbox_capacity must be at least 1".into());
        }
        if self.relay.write_timeout_ms == 0 {
            return Err("relay.write_timeout_ms must be at least 1".into());
        }
        if self.relay.audio_field.is_empty() {
            return Err("relay.audio_field must not be empty".into());
        }
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("VOICE_RELAY_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".voice-relay")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("VOICE_RELAY_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}
