/// GitLab service control
///
/// `docker compose up -d` returns as soon as containers are scheduled, but
/// GitLab needs minutes before it answers HTTP. Starting therefore polls
/// the configured URL until it responds with a non-error status.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use tracing::debug;

use crate::core::docker::DockerCli;
use crate::core::error::{ManagerError, Result};
use crate::utils::console;
use crate::utils::{HEALTH_CHECK_ATTEMPTS, HEALTH_CHECK_INTERVAL_SECS, HEALTH_CHECK_TIMEOUT_SECS, STATUS_TIMEOUT_SECS};

/// Outcome of a single readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Responded with a status below 400
    Ready(u16),
    /// Responded with an error status
    Unhealthy(u16),
    /// Connection error or timeout
    Unreachable(String),
}

impl Probe {
    pub fn is_ready(&self) -> bool {
        matches!(self, Probe::Ready(_))
    }
}

/// Checks whether an HTTP endpoint is serving
pub trait HealthProbe: Send + Sync {
    fn probe<'a>(&'a self, url: &'a str, timeout: Duration) -> BoxFuture<'a, Probe>;
}

/// `reqwest`-backed probe issuing a plain GET
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true) // For self-signed certs
            .build()
            .map_err(|e| ManagerError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl HealthProbe for HttpProbe {
    fn probe<'a>(&'a self, url: &'a str, timeout: Duration) -> BoxFuture<'a, Probe> {
        async move {
            match self.client.get(url).timeout(timeout).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status < 400 {
                        Probe::Ready(status)
                    } else {
                        Probe::Unhealthy(status)
                    }
                }
                Err(e) => Probe::Unreachable(e.to_string()),
            }
        }
        .boxed()
    }
}

/// How long to wait for GitLab to come up
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub attempts: u32,
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            attempts: HEALTH_CHECK_ATTEMPTS,
            interval: Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS),
            request_timeout: Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS),
        }
    }
}

impl HealthPolicy {
    /// Upper bound on time spent sleeping between attempts
    pub fn ceiling(&self) -> Duration {
        self.interval * self.attempts
    }
}

pub struct ServiceController {
    docker: DockerCli,
    probe: Arc<dyn HealthProbe>,
    url: String,
    policy: HealthPolicy,
}

impl ServiceController {
    pub fn new(docker: DockerCli, probe: Arc<dyn HealthProbe>, url: impl Into<String>) -> Self {
        Self {
            docker,
            probe,
            url: url.into(),
            policy: HealthPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: HealthPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Bring the stack up and block until GitLab answers
    pub async fn start(&self) -> Result<()> {
        console::step("Starting GitLab...");
        self.docker.compose_up().await?;

        console::step(&format!(
            "Waiting for GitLab to start (this may take up to {})...",
            humantime::format_duration(self.policy.ceiling())
        ));
        self.wait_until_ready().await
    }

    /// Bring the stack down
    pub async fn stop(&self) -> Result<()> {
        console::step("Stopping GitLab...");
        self.docker.compose_down().await?;
        console::success("GitLab stopped successfully.");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// One-shot reachability report; never fails
    pub async fn status(&self) -> Probe {
        console::step("Checking GitLab status...");
        let probe = self
            .probe
            .probe(&self.url, Duration::from_secs(STATUS_TIMEOUT_SECS))
            .await;

        match &probe {
            Probe::Ready(_) => console::success(&format!("GitLab is running at {}", self.url)),
            Probe::Unhealthy(code) => {
                console::warn(&format!("GitLab is not responding. Reason: HTTP {}", code))
            }
            Probe::Unreachable(reason) => {
                console::warn(&format!("GitLab is not responding. Reason: {}", reason))
            }
        }
        probe
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let attempts = self.policy.attempts;

        for attempt in 1..=attempts {
            let probe = self.probe.probe(&self.url, self.policy.request_timeout).await;
            debug!(attempt, ?probe, url = %self.url, "health check");

            if probe.is_ready() {
                console::success(&format!("GitLab is running at {}!", self.url));
                return Ok(());
            }

            console::step(&format!("Waiting for GitLab... (Attempt {}/{})", attempt, attempts));
            if attempt < attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }

        Err(ManagerError::StartTimeout { attempts })
    }
}
