use crate::config::Config;
use crate::error::{Result, VcServeError};
use crate::metrics;
use crate::origin::{OriginFetcher, RetryConfig};
use crate::resolver::CacheResolver;
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Asset resolver for both namespaces
    pub resolver: CacheResolver,
    /// Renders the Prometheus exposition for `/metrics`
    pub metrics: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    /// Build the shared HTTP client and open both namespace stores.
    pub async fn new(config: Config) -> Result<Self> {
        let timeout = Duration::from_secs(config.fetch_timeout_secs);

        let http_client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| VcServeError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let origin = OriginFetcher::new(
            http_client,
            RetryConfig {
                max_attempts: config.fetch_max_attempts,
                timeout,
                ..RetryConfig::default()
            },
        );
        let resolver = CacheResolver::open(&config, origin).await?;

        Ok(Self {
            config: Arc::new(config),
            resolver,
            metrics: metrics::init(),
            started_at: Instant::now(),
        })
    }
}
