//! Service endpoint lookup against a Consul agent.

use serde::Deserialize;
use tracing::debug;

use crate::blocking::BlockingContext;
use crate::config::{ConfigError, ConsulHostConfig};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Service discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Blocking runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("The service discovery client has been disposed")]
    Disposed,
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Network location a service is registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceHealth {
    service: AgentService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    address: String,
    port: u16,
}

struct Transport {
    client: reqwest::Client,
    blocking: BlockingContext,
}

/// Resolves service ids to endpoints with one HTTP request per lookup.
///
/// Holds a single connection-reusing HTTP client until disposed.
pub struct ServiceSync {
    base_url: String,
    transport: Option<Transport>,
}

impl ServiceSync {
    pub fn new(config: &ConsulHostConfig) -> DiscoveryResult<Self> {
        let transport = Transport {
            client: reqwest::Client::new(),
            blocking: BlockingContext::dedicated()?,
        };
        Ok(Self {
            base_url: config.base_url(),
            transport: Some(transport),
        })
    }

    pub fn from_env() -> DiscoveryResult<Self> {
        Self::new(&ConsulHostConfig::from_env()?)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Look up `service_id`, blocking the calling thread until it resolves.
    pub fn get_service_endpoint(&self, service_id: &str) -> DiscoveryResult<ServiceEndpoint> {
        let transport = self.transport.as_ref().ok_or(DiscoveryError::Disposed)?;
        transport
            .blocking
            .block_on(lookup(&transport.client, &self.base_url, service_id))?
    }

    pub async fn get_service_endpoint_async(
        &self,
        service_id: &str,
    ) -> DiscoveryResult<ServiceEndpoint> {
        let transport = self.transport.as_ref().ok_or(DiscoveryError::Disposed)?;
        lookup(&transport.client, &self.base_url, service_id).await
    }

    pub fn is_disposed(&self) -> bool {
        self.transport.is_none()
    }

    /// Release the HTTP client. Later calls are no-ops.
    pub fn dispose(&mut self) {
        if self.transport.take().is_some() {
            debug!(base_url = %self.base_url, "Service discovery client disposed");
        }
    }
}

impl std::fmt::Debug for ServiceSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSync")
            .field("base_url", &self.base_url)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

async fn lookup(
    client: &reqwest::Client,
    base_url: &str,
    service_id: &str,
) -> DiscoveryResult<ServiceEndpoint> {
    let url = format!("{base_url}agent/health/service/id/{service_id}");
    let health: ServiceHealth = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    debug!(
        service_id,
        address = %health.service.address,
        port = health.service.port,
        "Resolved service endpoint"
    );
    Ok(ServiceEndpoint {
        address: health.service.address,
        port: health.service.port,
    })
}
