//! Resilient client runtime for an HTTP JSON backend.
//!
//! [`LinkContext`] wires the token manager, request pipeline, connectivity
//! monitor and degraded-mode gateway around one shared event bus. Collaborators
//! receive the context (or the pieces they need) instead of reaching for
//! globals.

pub mod credentials;
pub mod degraded;
pub mod monitor;
pub mod pipeline;
pub mod probe;
pub mod session;

use std::sync::Arc;

use apilink_core::{
    ClassifiedError, Clock, ConnectivityState, EventBus, EventStream, LinkConfig, LinkStatus,
    SystemClock,
};
use apilink_platform::KeyValueStore;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

pub use credentials::{Credential, TokenManager};
pub use degraded::{DegradedFlag, DegradedGateway, ReadOutcome};
pub use monitor::{ConnectivityHandle, ConnectivityMonitor, MonitorTask};
pub use pipeline::{RequestBody, RequestPipeline, RequestSpec, UploadPart};
pub use probe::{HttpProbe, ReachabilityProbe};
pub use session::SessionClient;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connectivity monitor is already running")]
    MonitorAlreadyRunning,
    #[error("connectivity monitor is not running")]
    MonitorNotRunning,
    #[error(transparent)]
    Client(#[from] ClassifiedError),
}

/// Every component of the link layer, built once and shared.
pub struct LinkContext {
    config: Arc<LinkConfig>,
    events: EventBus,
    tokens: Arc<TokenManager>,
    pipeline: Arc<RequestPipeline>,
    gateway: Arc<DegradedGateway>,
    monitor: Arc<ConnectivityMonitor<HttpProbe>>,
    session: SessionClient,
    monitor_task: Mutex<Option<MonitorTask>>,
}

impl LinkContext {
    pub fn new(config: LinkConfig, durable: Arc<dyn KeyValueStore>) -> Result<Self, LinkError> {
        Self::with_clock(config, durable, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: LinkConfig,
        durable: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LinkError> {
        let config = Arc::new(config);
        let events = EventBus::new(EVENT_BUFFER);

        let tokens = Arc::new(
            TokenManager::new(
                durable.clone(),
                events.clone(),
                clock.clone(),
                config.max_token_age_ms,
            )
            .allow_test_credentials(config.allow_test_credentials),
        );
        let pipeline = Arc::new(RequestPipeline::new(
            config.clone(),
            tokens.clone(),
            events.clone(),
        )?);

        let flag = DegradedFlag::load(durable);
        let gateway = Arc::new(DegradedGateway::new(flag.clone()));
        let monitor = Arc::new(ConnectivityMonitor::new(
            HttpProbe::new(&config)?,
            events.clone(),
            flag,
            clock,
            config.probe_interval(),
            config.unreachable_threshold,
        ));
        let session = SessionClient::new(pipeline.clone(), tokens.clone(), gateway.clone());

        info!(base_url = %config.base_url, "link context ready");
        Ok(Self {
            config,
            events,
            tokens,
            pipeline,
            gateway,
            monitor,
            session,
            monitor_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub fn gateway(&self) -> &Arc<DegradedGateway> {
        &self.gateway
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor<HttpProbe>> {
        &self.monitor
    }

    pub fn session(&self) -> &SessionClient {
        &self.session
    }

    pub fn connectivity_handle(&self) -> ConnectivityHandle {
        self.monitor.handle()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.state()
    }

    pub fn status(&self) -> LinkStatus {
        self.monitor.status()
    }

    /// Read through the degraded-mode gateway.
    pub async fn read(&self, endpoint: &str) -> Result<ReadOutcome<Value>, ClassifiedError> {
        self.gateway
            .read(endpoint, || async move {
                self.pipeline.execute(&RequestSpec::get(endpoint)).await
            })
            .await
    }

    pub async fn start_monitor(&self) -> Result<(), LinkError> {
        let mut guard = self.monitor_task.lock().await;
        if guard.as_ref().is_some_and(MonitorTask::is_running) {
            return Err(LinkError::MonitorAlreadyRunning);
        }
        *guard = Some(self.monitor.clone().spawn());
        Ok(())
    }

    pub async fn stop_monitor(&self) -> Result<(), LinkError> {
        let running = {
            let mut guard = self.monitor_task.lock().await;
            guard.take()
        };
        let Some(running) = running else {
            return Err(LinkError::MonitorNotRunning);
        };
        running.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apilink_core::{LinkEvent, ManualClock, Notice, next_event};
    use apilink_platform::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    fn context(base_url: &str) -> LinkContext {
        let mut config = LinkConfig::with_base_url(base_url);
        config.retry_base_delay_ms = 1;
        config.probe_timeout_ms = 500;
        LinkContext::with_clock(
            config,
            Arc::new(InMemoryStore::default()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
        .expect("context")
    }

    #[tokio::test]
    async fn unreachable_backend_degrades_reads_to_fallbacks() {
        let ctx = context("http://127.0.0.1:1");
        ctx.gateway()
            .register_fallback("/api/legal-updates", json!([{"title": "cached"}]));
        let mut stream = ctx.subscribe();

        assert_eq!(ctx.monitor().probe_now().await, LinkStatus::OnlineUnreachable);
        assert!(ctx.gateway().is_degraded());

        let outcome = ctx.read("/api/legal-updates").await.expect("fallback read");
        assert_eq!(
            outcome,
            ReadOutcome::Fallback(json!([{"title": "cached"}]))
        );

        let mut notices = Vec::new();
        while let Ok(event) = stream.try_recv() {
            if let LinkEvent::Notify { notice } = event {
                notices.push(notice);
            }
        }
        assert_eq!(notices, vec![Notice::BackendUnreachable]);
    }

    #[tokio::test]
    async fn healthy_backend_serves_live_reads() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/test-connection"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/legal-updates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(["live"])))
            .mount(&server)
            .await;

        let ctx = context(&server.uri());
        assert_eq!(ctx.monitor().probe_now().await, LinkStatus::OnlineReachable);
        let outcome = ctx.read("/api/legal-updates").await.expect("live read");
        assert_eq!(outcome, ReadOutcome::Live(json!(["live"])));
    }

    #[tokio::test]
    async fn monitor_can_only_run_once() {
        let server = MockServer::start().await;
        Mock::given(path("/api/test-connection"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let ctx = context(&server.uri());
        ctx.start_monitor().await.expect("first start");
        assert!(matches!(
            ctx.start_monitor().await,
            Err(LinkError::MonitorAlreadyRunning)
        ));
        ctx.stop_monitor().await.expect("stop");
        assert!(matches!(
            ctx.stop_monitor().await,
            Err(LinkError::MonitorNotRunning)
        ));
    }

    #[tokio::test]
    async fn running_monitor_detects_unreachable_backend() {
        let ctx = context("http://127.0.0.1:1");
        let mut stream = ctx.subscribe();
        ctx.start_monitor().await.expect("start");

        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(LinkEvent::ConnectivityChanged { status }) = next_event(&mut stream).await {
                    break status;
                }
            }
        })
        .await
        .expect("monitor publishes a status change");
        assert_eq!(status, LinkStatus::OnlineUnreachable);

        ctx.stop_monitor().await.expect("stop");
    }
}
