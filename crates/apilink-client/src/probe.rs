use std::{future::Future, time::Duration};

use apilink_core::{ClassifiedError, ErrorClass, LinkConfig, ProbeOutcome};
use tracing::debug;

use crate::pipeline::transport_error;

/// Something that can tell whether the backend answers right now.
///
/// Probes report outcomes only. They never publish events or touch shared
/// state; the connectivity monitor owns both.
pub trait ReachabilityProbe: Send + Sync + 'static {
    fn probe(&self) -> impl Future<Output = ProbeOutcome> + Send;
}

/// Lightweight GET against the backend's connection-test endpoint.
///
/// Sent once with its own short timeout and without credentials. Any answer
/// below 500 proves the server is up.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(config: &LinkConfig) -> Result<Self, ClassifiedError> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .map_err(|err| {
                ClassifiedError::new(
                    ErrorClass::Unknown,
                    format!("failed to build probe client: {err}"),
                )
            })?;
        Ok(Self {
            client,
            url: config.url_for(&config.probe_path),
            timeout: config.probe_timeout(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One probe round-trip, keeping the classified failure.
    pub async fn check(&self) -> Result<u16, ClassifiedError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| transport_error(&err, &self.url, self.timeout))?;
        let status = response.status().as_u16();
        if status >= 500 {
            return Err(ClassifiedError::from_status(
                status,
                format!("probe answered HTTP {status}"),
            )
            .with_url(self.url.clone()));
        }
        Ok(status)
    }
}

impl ReachabilityProbe for HttpProbe {
    async fn probe(&self) -> ProbeOutcome {
        match self.check().await {
            Ok(status) => {
                debug!(url = %self.url, status, "backend probe answered");
                ProbeOutcome::Reachable
            }
            Err(err) => {
                debug!(url = %self.url, class = err.class.code(), "backend probe failed: {}", err.message);
                ProbeOutcome::Failed(err.class)
            }
        }
    }
}
