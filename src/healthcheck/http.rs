use super::HealthChecker;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{redirect, Client, StatusCode};
use std::sync::OnceLock;
use std::time::Duration;

/// Per-request timeout for HTTP readiness probes.
pub const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Global shared HTTP client for health checks.
///
/// One pool for every service's probes keeps file descriptor use flat no
/// matter how many services are supervised. Redirects are not followed: a
/// 3xx already proves the server is answering.
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .redirect(redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client for health checks: {}", e);
                Client::new()
            })
    })
}

/// HTTP-based health checker: HEAD first, GET if HEAD is not answered
/// with success. 2xx and 3xx count as ready.
pub struct HttpChecker {
    url: String,
    client: Client,
    timeout: Duration,
}

impl HttpChecker {
    /// # Errors
    ///
    /// Returns error if URL is malformed or uses unsupported scheme.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        Self::validate_url(&url)?;
        Ok(Self {
            url,
            client: shared_client().clone(),
            timeout: HTTP_PROBE_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `base` joined with `path`, e.g. `http://localhost:3000` + `/health`.
    pub fn for_service(base: &str, path: &str) -> Result<Self> {
        let parsed = url::Url::parse(base)
            .map_err(|e| Error::Config(format!("Invalid service URL '{}': {}", base, e)))?;
        let joined = parsed
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid health check path '{}': {}", path, e)))?;
        Self::new(joined.to_string())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Validate that a URL is well-formed and uses HTTP/HTTPS scheme.
    fn validate_url(url: &str) -> Result<()> {
        match url::Url::parse(url) {
            Ok(parsed) => {
                let scheme = parsed.scheme();
                if scheme != "http" && scheme != "https" {
                    return Err(Error::Config(format!(
                        "Invalid healthcheck URL '{}': scheme must be http or https, got '{}'",
                        url, scheme
                    )));
                }
                Ok(())
            }
            Err(e) => Err(Error::Config(format!(
                "Invalid healthcheck URL '{}': {}",
                url, e
            ))),
        }
    }

    fn is_ready(status: StatusCode) -> bool {
        status.is_success() || status.is_redirection()
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self) -> Result<bool> {
        if let Ok(response) = self
            .client
            .head(&self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            if Self::is_ready(response.status()) {
                return Ok(true);
            }
        }

        match self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => Ok(Self::is_ready(response.status())),
            Err(_) => Ok(false),
        }
    }

    fn timeout(&self) -> Duration {
        // HEAD and GET each get the full per-request budget.
        self.timeout * 2
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}
