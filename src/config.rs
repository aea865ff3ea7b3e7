//! Environment-backed configuration.
//!
//! A `.env` file in the working directory is loaded first when present.

use serde::Deserialize;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const CONSUL_HOST: &str = "CONSUL_HOST";
pub const CONSUL_PORT: &str = "CONSUL_PORT";
pub const CONSUL_USE_TLS: &str = "CONSUL_USE_TLS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment variable `{0}` is not set")]
    Missing(&'static str),

    #[error("Environment variable `{name}` has an invalid value `{value}`")]
    Invalid { name: &'static str, value: String },
}

/// Read the database connection string from `DATABASE_URL`.
pub fn database_url() -> Result<String, ConfigError> {
    let _ = dotenvy::dotenv();
    std::env::var(DATABASE_URL).map_err(|_| ConfigError::Missing(DATABASE_URL))
}

/// Location of the service discovery agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsulHostConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl Default for ConsulHostConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8500,
            use_tls: false,
        }
    }
}

impl ConsulHostConfig {
    /// Build from `CONSUL_HOST`, `CONSUL_PORT` and `CONSUL_USE_TLS`, keeping
    /// defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(host) = std::env::var(CONSUL_HOST) {
            config.host = host;
        }
        if let Ok(port) = std::env::var(CONSUL_PORT) {
            config.port = port.parse().map_err(|_| ConfigError::Invalid {
                name: CONSUL_PORT,
                value: port.clone(),
            })?;
        }
        if let Ok(use_tls) = std::env::var(CONSUL_USE_TLS) {
            config.use_tls = match use_tls.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: CONSUL_USE_TLS,
                        value: use_tls,
                    })
                }
            };
        }
        Ok(config)
    }

    /// Base URL of the agent HTTP API, e.g. `http://localhost:8500/v1/`.
    pub fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}/v1/", self.host, self.port)
    }
}
