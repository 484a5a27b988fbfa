//! Cooperative shutdown: termination signals and spot-preemption notices both
//! raise one process-wide flag that the processing loop polls between chunks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, ScribeError};

/// Reason recorded when the metadata endpoint reports an imminent preemption.
pub const PREEMPTION_REASON: &str = "preemption";

const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECS: &str = "21600";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct ShutdownState {
    requested: AtomicBool,
    reason: OnceLock<String>,
}

/// Cheaply cloneable handle on the shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    state: Arc<ShutdownState>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT/SIGTERM/SIGHUP into [`request`](Self::request), with the
    /// signal name as the reason. Must be called inside a tokio runtime.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name) in [
            (SignalKind::interrupt(), "SIGINT"),
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::hangup(), "SIGHUP"),
        ] {
            let mut stream = signal(kind).map_err(|e| {
                ScribeError::Config(format!("Failed to install {name} handler: {e}"))
            })?;
            let coordinator = self.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    coordinator.request(name);
                }
            });
        }
        Ok(())
    }

    /// Route Ctrl+C and console close events into [`request`](Self::request).
    ///
    /// Only one handler can be installed per process.
    #[cfg(not(unix))]
    pub fn install_signal_handlers(&self) -> Result<()> {
        let coordinator = self.clone();
        ctrlc::set_handler(move || {
            coordinator.request("ctrl-c");
        })
        .map_err(|e| ScribeError::Config(format!("Failed to install signal handler: {e}")))
    }

    /// Raise the flag. The first caller's reason wins; returns whether this call was first.
    pub fn request(&self, reason: impl Into<String>) -> bool {
        let first = self.state.reason.set(reason.into()).is_ok();
        self.state.requested.store(true, Ordering::SeqCst);
        if first {
            warn!("Shutdown requested via {}", self.reason().unwrap_or_default());
        }
        first
    }

    pub fn should_stop(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.state.reason.get().cloned()
    }

    /// Poll `poller` every `interval` until a preemption notice arrives or
    /// shutdown is requested some other way. Poll failures are only logged.
    pub fn spawn_preemption_poller(
        &self,
        poller: PreemptionPoller,
        interval: Duration,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while !coordinator.should_stop() {
                match poller.check().await {
                    Ok(true) => {
                        coordinator.request(PREEMPTION_REASON);
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => debug!("Preemption poll failed: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}

/// Client for the instance metadata service's spot interruption notice.
#[derive(Debug, Clone)]
pub struct PreemptionPoller {
    client: reqwest::Client,
    endpoint: String,
}

impl PreemptionPoller {
    /// `endpoint` is the metadata service base URL, e.g. `http://169.254.169.254`.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_token(&self) -> Result<String> {
        let token = self
            .client
            .put(format!("{}/latest/api/token", self.endpoint))
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECS)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(token)
    }

    /// `Ok(true)` when an interruption notice is pending, `Ok(false)` when there is none.
    pub async fn check(&self) -> Result<bool> {
        let token = self.fetch_token().await?;
        let response = self
            .client
            .get(format!(
                "{}/latest/meta-data/spot/instance-action",
                self.endpoint
            ))
            .header(TOKEN_HEADER, token)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => {
                response.error_for_status()?;
                Ok(false)
            }
        }
    }
}
