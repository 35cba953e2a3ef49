//! Degraded-mode gateway: serves registered fallback data for reads while the
//! backend is known to be unavailable.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use apilink_core::{ClassifiedError, ErrorClass, LinkStatus};
use apilink_platform::{KeyValueStore, ScopedStore, StoreError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::credentials::CREDENTIAL_NAMESPACE;

pub const UNAVAILABLE_KEY: &str = "backend_unavailable";
pub const UNAVAILABLE_SINCE_KEY: &str = "backend_unavailable_since";

/// Persisted "backend unavailable" flag.
///
/// Written only by the connectivity monitor. Survives restarts so the first
/// reads after a relaunch are served from fallbacks until a probe succeeds.
#[derive(Clone)]
pub struct DegradedFlag {
    store: ScopedStore<Arc<dyn KeyValueStore>>,
    since_ms: Arc<Mutex<Option<u64>>>,
}

impl DegradedFlag {
    /// Load the flag from `store`. Unreadable storage counts as "not degraded".
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let store = ScopedStore::new(store, CREDENTIAL_NAMESPACE);
        let since_ms = match store.get(UNAVAILABLE_KEY) {
            Ok(value) if value == "true" => Some(
                store
                    .get(UNAVAILABLE_SINCE_KEY)
                    .ok()
                    .and_then(|since| since.parse().ok())
                    .unwrap_or_default(),
            ),
            Ok(_) | Err(StoreError::NotFound) => None,
            Err(err) => {
                warn!("failed to read degraded flag: {err}");
                None
            }
        };
        if let Some(since) = since_ms {
            info!(since_ms = since, "restored degraded mode from previous run");
        }

        Self {
            store,
            since_ms: Arc::new(Mutex::new(since_ms)),
        }
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    pub fn since_ms(&self) -> Option<u64> {
        *self.lock()
    }

    pub(crate) fn set(&self, now_ms: u64) {
        {
            let mut since = self.lock();
            if since.is_some() {
                return;
            }
            *since = Some(now_ms);
        }

        let persisted = self
            .store
            .set(UNAVAILABLE_KEY, "true")
            .and_then(|()| self.store.set(UNAVAILABLE_SINCE_KEY, &now_ms.to_string()));
        if let Err(err) = persisted {
            warn!("failed to persist degraded flag: {err}");
        }
    }

    pub(crate) fn clear(&self) {
        if self.lock().take().is_none() {
            return;
        }
        for key in [UNAVAILABLE_KEY, UNAVAILABLE_SINCE_KEY] {
            if let Err(err) = self.store.remove(key) {
                warn!(key, "failed to remove degraded flag: {err}");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<u64>> {
        self.since_ms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Where a gateway read was answered from.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<T> {
    /// The real backend answered.
    Live(T),
    /// Served from registered fallback data.
    Fallback(T),
    /// Degraded with no fallback registered for this endpoint.
    Degraded { endpoint: String },
}

impl<T> ReadOutcome<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Live(value) | Self::Fallback(value) => Some(value),
            Self::Degraded { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, Self::Live(_))
    }
}

pub struct DegradedGateway {
    flag: DegradedFlag,
    fallbacks: RwLock<HashMap<String, Value>>,
}

impl DegradedGateway {
    pub fn new(flag: DegradedFlag) -> Self {
        Self {
            flag,
            fallbacks: RwLock::new(HashMap::new()),
        }
    }

    pub fn flag(&self) -> &DegradedFlag {
        &self.flag
    }

    pub fn is_degraded(&self) -> bool {
        self.flag.is_set()
    }

    /// Register static data served for `endpoint` while degraded.
    pub fn register_fallback(&self, endpoint: impl Into<String>, data: Value) {
        self.fallbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.into(), data);
    }

    pub fn remove_fallback(&self, endpoint: &str) -> Option<Value> {
        self.fallbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint)
    }

    /// Read through the gateway. While degraded the real call is never made.
    pub async fn read<T, F, Fut>(
        &self,
        endpoint: &str,
        real_fetch: F,
    ) -> Result<ReadOutcome<T>, ClassifiedError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        if !self.flag.is_set() {
            return real_fetch().await.map(ReadOutcome::Live);
        }

        let fallback = self
            .fallbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned();
        match fallback {
            Some(data) => {
                debug!(endpoint, "serving fallback data while degraded");
                serde_json::from_value(data)
                    .map(ReadOutcome::Fallback)
                    .map_err(|err| {
                        ClassifiedError::new(
                            ErrorClass::Unknown,
                            format!("fallback data for '{endpoint}' does not decode: {err}"),
                        )
                    })
            }
            None => {
                debug!(endpoint, "no fallback registered while degraded");
                Ok(ReadOutcome::Degraded {
                    endpoint: endpoint.to_owned(),
                })
            }
        }
    }

    /// Writes always go to the real backend and surface its errors.
    pub async fn write<T, F, Fut>(&self, real_call: F) -> Result<T, ClassifiedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        if self.flag.is_set() {
            debug!("write attempted while degraded; sending to backend anyway");
        }
        real_call().await
    }

    /// Status reported to callers that only see the gateway.
    pub fn effective_status(&self, monitor_status: LinkStatus) -> LinkStatus {
        if self.flag.is_set() && monitor_status.is_usable() {
            LinkStatus::OnlineUnreachable
        } else {
            monitor_status
        }
    }
}
