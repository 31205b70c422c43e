use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    /// Identity sent to the broker during the reverse introduction.
    pub check_uuid: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub reverse: ReverseConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiConfig {
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReverseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
}

impl Default for ReverseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_backoff_secs: default_max_backoff_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TlsConfig {
    /// Management API CA: PEM path or inline PEM; empty for web roots.
    #[serde(default)]
    pub ca_file: String,
    /// Broker CA, same forms.
    #[serde(default)]
    pub broker_ca: String,
}

fn default_listen() -> String {
    "127.0.0.1:43191".to_string()
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

impl AgentConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn reverse_opts(&self) -> telemon_reverse::ReverseOpts {
        telemon_reverse::ReverseOpts {
            enabled: self.reverse.enabled,
            max_backoff: Duration::from_secs(self.reverse.max_backoff_secs),
            refresh_interval: Duration::from_secs(self.reverse.refresh_interval_secs),
            dispatch_timeout: Duration::from_secs(self.reverse.dispatch_timeout_secs),
        }
    }
}
