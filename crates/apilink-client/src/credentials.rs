//! Bearer token lifecycle: durable storage with in-memory fallback, maximum
//! age enforcement and embedded-expiry inspection.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use apilink_core::{Clock, CredentialAction, EventBus, LinkEvent};
use apilink_platform::{KeyValueStore, ScopedStore, StoreError};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use tracing::{debug, info, warn};

pub const CREDENTIAL_NAMESPACE: &str = "apilink";
pub const TOKEN_KEY: &str = "auth_token";
pub const ISSUED_AT_KEY: &str = "auth_token_issued_at";
const TEST_CREDENTIAL_PREFIX: &str = "test-";

/// A stored bearer token and the time it was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub issued_at_ms: u64,
}

type SharedStore = ScopedStore<Arc<dyn KeyValueStore>>;

/// Sole writer of the credential. Storage failures are absorbed here and
/// never reach callers.
pub struct TokenManager {
    durable: SharedStore,
    ephemeral: Option<SharedStore>,
    cache: Mutex<Option<Credential>>,
    // Set when a durable write or delete failed; the cache is authoritative
    // until the next successful persist.
    durable_stale: AtomicBool,
    clock: Arc<dyn Clock>,
    events: EventBus,
    max_age_ms: u64,
    allow_test_credentials: bool,
}

impl TokenManager {
    pub fn new(
        durable: Arc<dyn KeyValueStore>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        max_age_ms: u64,
    ) -> Self {
        Self {
            durable: ScopedStore::new(durable, CREDENTIAL_NAMESPACE),
            ephemeral: None,
            cache: Mutex::new(None),
            durable_stale: AtomicBool::new(false),
            clock,
            events,
            max_age_ms,
            allow_test_credentials: false,
        }
    }

    /// Secondary session-scoped store that other collaborators may have
    /// copied the token into. Cleared alongside the durable store.
    pub fn with_ephemeral(mut self, ephemeral: Arc<dyn KeyValueStore>) -> Self {
        self.ephemeral = Some(ScopedStore::new(ephemeral, CREDENTIAL_NAMESPACE));
        self
    }

    /// Treat opaque `test-` tokens as never expiring. Off unless explicitly configured.
    pub fn allow_test_credentials(mut self, allow: bool) -> Self {
        self.allow_test_credentials = allow;
        self
    }

    /// Store a freshly issued token.
    pub fn set_token(&self, token: &str) {
        let credential = Credential {
            token: token.to_owned(),
            issued_at_ms: self.clock.now_ms(),
        };

        *self.lock_cache() = Some(credential.clone());
        match self.persist(&credential) {
            Ok(()) => self.durable_stale.store(false, Ordering::SeqCst),
            Err(err) => {
                warn!(error = %err, "durable credential store unavailable; keeping token in memory only");
                self.durable_stale.store(true, Ordering::SeqCst);
            }
        }

        debug!("credential stored");
        self.events.emit(LinkEvent::CredentialChanged {
            action: CredentialAction::Set,
        });
    }

    /// Current token, or `None` when absent or older than the maximum age.
    pub fn get_token(&self) -> Option<String> {
        let durable = if self.durable_stale.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            self.load_durable()
        };
        let credential = match durable {
            Ok(Some(credential)) => {
                *self.lock_cache() = Some(credential.clone());
                Some(credential)
            }
            Ok(None) => self.lock_cache().clone(),
            Err(err) => {
                debug!(error = %err, "durable credential read failed; using in-memory copy");
                self.lock_cache().clone()
            }
        }?;

        let age_ms = self.clock.now_ms().saturating_sub(credential.issued_at_ms);
        if age_ms > self.max_age_ms {
            info!(age_ms, max_age_ms = self.max_age_ms, "stored token exceeded maximum age");
            self.clear();
            return None;
        }

        Some(credential.token)
    }

    /// In-memory snapshot without touching storage or enforcing age.
    pub fn cached(&self) -> Option<Credential> {
        self.lock_cache().clone()
    }

    /// Whether `token` should be considered expired by its own declaration.
    ///
    /// JWT-shaped tokens are decoded and their `exp` claim (seconds since
    /// epoch) compared to now; a missing `exp` means no declared expiry.
    /// Anything that does not decode is expired, except `test-` tokens when
    /// test credentials are allowed.
    pub fn is_expired(&self, token: &str) -> bool {
        if self.allow_test_credentials && token.starts_with(TEST_CREDENTIAL_PREFIX) {
            return false;
        }

        match declared_expiry_secs(token) {
            Ok(Some(exp_secs)) => exp_secs.saturating_mul(1_000) <= self.clock.now_ms(),
            Ok(None) => false,
            Err(reason) => {
                debug!(%reason, "token is not structurally valid; treating as expired");
                true
            }
        }
    }

    /// A token exists, is within the maximum age and has not self-expired.
    pub fn has_valid_token(&self) -> bool {
        self.get_token()
            .is_some_and(|token| !self.is_expired(&token))
    }

    /// Remove the credential everywhere. Returns `false` (and emits nothing)
    /// when there was nothing to clear.
    pub fn clear(&self) -> bool {
        let had_cached = self.lock_cache().take().is_some();
        let stale = self.durable_stale.load(Ordering::SeqCst);
        let had_durable = match self.durable.get(TOKEN_KEY) {
            Ok(_) => !stale,
            Err(StoreError::NotFound) => false,
            Err(err) => {
                warn!(error = %err, "durable credential store unavailable during clear");
                false
            }
        };

        let mut removed = true;
        for key in [TOKEN_KEY, ISSUED_AT_KEY] {
            if let Err(err) = self.durable.remove(key) {
                warn!(key, error = %err, "failed removing durable credential entry");
                removed = false;
            }
            if let Some(ephemeral) = &self.ephemeral {
                let _ = ephemeral.remove(key);
            }
        }

        self.durable_stale.store(!removed, Ordering::SeqCst);

        if !(had_cached || had_durable) {
            return false;
        }

        debug!("credential cleared");
        self.events.emit(LinkEvent::CredentialChanged {
            action: CredentialAction::Clear,
        });
        true
    }

    fn persist(&self, credential: &Credential) -> Result<(), StoreError> {
        self.durable.set(TOKEN_KEY, &credential.token)?;
        self.durable
            .set(ISSUED_AT_KEY, &credential.issued_at_ms.to_string())
    }

    fn load_durable(&self) -> Result<Option<Credential>, StoreError> {
        let token = match self.durable.get(TOKEN_KEY) {
            Ok(token) if !token.is_empty() => token,
            Ok(_) | Err(StoreError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };

        let stored_issued_at = self
            .durable
            .get(ISSUED_AT_KEY)
            .ok()
            .and_then(|value| value.parse::<u64>().ok());
        let issued_at_ms = match stored_issued_at {
            Some(issued_at_ms) => issued_at_ms,
            None => self.recover_issued_at(&token),
        };

        Ok(Some(Credential {
            token,
            issued_at_ms,
        }))
    }

    /// A durable token without a readable timestamp inherits the cached one
    /// when it is the same token; otherwise its age starts now.
    fn recover_issued_at(&self, token: &str) -> u64 {
        if let Some(cached) = self.lock_cache().as_ref()
            && cached.token == token
        {
            return cached.issued_at_ms;
        }

        let now = self.clock.now_ms();
        if let Err(err) = self.durable.set(ISSUED_AT_KEY, &now.to_string()) {
            debug!(error = %err, "could not backfill credential timestamp");
        }
        now
    }

    fn lock_cache(&self) -> MutexGuard<'_, Option<Credential>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decode the `exp` claim of a JWT-shaped token.
fn declared_expiry_secs(token: &str) -> Result<Option<u64>, String> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err("expected three dot-separated segments".to_owned());
    };
    if header.is_empty() || payload.is_empty() || signature.is_empty() {
        return Err("empty token segment".to_owned());
    }

    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|err| format!("payload is not base64url: {err}"))?;
    let claims: serde_json::Value =
        serde_json::from_slice(&decoded).map_err(|err| format!("payload is not JSON: {err}"))?;
    let claims = claims
        .as_object()
        .ok_or_else(|| "payload is not a JSON object".to_owned())?;

    match claims.get("exp") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(exp) => exp
            .as_u64()
            .or_else(|| exp.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
            .map(Some)
            .ok_or_else(|| "exp claim is not a number".to_owned()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use apilink_core::{ManualClock, drain_events};
    use apilink_platform::{InMemoryStore, UnavailableStore};

    const HOUR_MS: u64 = 60 * 60 * 1_000;
    const NOW_MS: u64 = 1_700_000_000_000;

    pub(crate) fn jwt_with_exp(exp_secs: u64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":1,"exp":{exp_secs}}}"#));
        format!("{header}.{payload}.c2lnbmF0dXJl")
    }

    /// Reads succeed, every write and delete fails.
    struct ReadOnlyStore {
        inner: InMemoryStore,
    }

    impl ReadOnlyStore {
        fn seeded(token: &str, issued_at_ms: u64) -> Self {
            let inner = InMemoryStore::default();
            inner
                .set_value(CREDENTIAL_NAMESPACE, TOKEN_KEY, token)
                .expect("seed token");
            inner
                .set_value(CREDENTIAL_NAMESPACE, ISSUED_AT_KEY, &issued_at_ms.to_string())
                .expect("seed timestamp");
            Self { inner }
        }
    }

    impl KeyValueStore for ReadOnlyStore {
        fn set_value(&self, _: &str, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("read-only filesystem".into()))
        }

        fn get_value(&self, namespace: &str, key: &str) -> Result<String, StoreError> {
            self.inner.get_value(namespace, key)
        }

        fn delete_value(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("read-only filesystem".into()))
        }
    }

    fn manager(store: Arc<dyn KeyValueStore>, clock: &ManualClock) -> (TokenManager, EventBus) {
        let events = EventBus::new(32);
        let manager = TokenManager::new(store, events.clone(), Arc::new(clock.clone()), 24 * HOUR_MS);
        (manager, events)
    }

    #[test]
    fn stores_token_durably_and_emits_set() {
        let clock = ManualClock::new(NOW_MS);
        let store = InMemoryStore::default();
        let (tokens, events) = manager(Arc::new(store.clone()), &clock);
        let mut stream = events.subscribe();

        tokens.set_token("abc");

        assert_eq!(
            store.get_value(CREDENTIAL_NAMESPACE, TOKEN_KEY).expect("token persisted"),
            "abc"
        );
        assert_eq!(
            store
                .get_value(CREDENTIAL_NAMESPACE, ISSUED_AT_KEY)
                .expect("timestamp persisted"),
            NOW_MS.to_string()
        );
        assert_eq!(tokens.get_token().as_deref(), Some("abc"));
        assert_eq!(
            drain_events(&mut stream),
            vec![LinkEvent::CredentialChanged {
                action: CredentialAction::Set
            }]
        );
    }

    #[test]
    fn falls_back_to_memory_when_durable_store_fails() {
        let clock = ManualClock::new(NOW_MS);
        let (tokens, events) = manager(Arc::new(UnavailableStore::new("quota exceeded")), &clock);
        let mut stream = events.subscribe();

        tokens.set_token("memory-only");

        assert_eq!(tokens.get_token().as_deref(), Some("memory-only"));
        assert_eq!(
            tokens.cached().map(|c| c.issued_at_ms),
            Some(NOW_MS),
            "issued-at recorded with the token"
        );
        assert_eq!(drain_events(&mut stream).len(), 1);
    }

    #[test]
    fn clear_sticks_when_durable_store_is_read_only() {
        let clock = ManualClock::new(NOW_MS);
        let (tokens, events) = manager(Arc::new(ReadOnlyStore::seeded("old", NOW_MS)), &clock);
        let mut stream = events.subscribe();
        assert_eq!(tokens.get_token().as_deref(), Some("old"));

        assert!(tokens.clear());
        assert_eq!(tokens.get_token(), None);
        assert!(!tokens.clear(), "second clear has nothing left to remove");
        assert_eq!(
            drain_events(&mut stream),
            vec![LinkEvent::CredentialChanged {
                action: CredentialAction::Clear
            }]
        );
    }

    #[test]
    fn new_token_wins_over_unwritable_durable_copy() {
        let clock = ManualClock::new(NOW_MS);
        let (tokens, _events) = manager(Arc::new(ReadOnlyStore::seeded("old", NOW_MS)), &clock);

        tokens.set_token("new");
        assert_eq!(tokens.get_token().as_deref(), Some("new"));

        clock.advance(HOUR_MS);
        assert_eq!(tokens.get_token().as_deref(), Some("new"));
    }

    #[test]
    fn successful_persist_makes_durable_store_authoritative_again() {
        let clock = ManualClock::new(NOW_MS);
        let store = InMemoryStore::default();
        let (tokens, _events) = manager(Arc::new(store.clone()), &clock);

        tokens.set_token("first");
        store
            .set_value(CREDENTIAL_NAMESPACE, TOKEN_KEY, "rotated")
            .expect("external write");
        assert_eq!(tokens.get_token().as_deref(), Some("rotated"));
    }

    #[test]
    fn tokens_older_than_max_age_are_cleared_even_if_not_self_expired() {
        let clock = ManualClock::new(NOW_MS);
        let (tokens, events) = manager(Arc::new(InMemoryStore::default()), &clock);
        let far_future = NOW_MS / 1_000 + 365 * 24 * 3_600;
        let token = jwt_with_exp(far_future);
        tokens.set_token(&token);
        assert!(!tokens.is_expired(&token));

        let mut stream = events.subscribe();
        clock.advance(24 * HOUR_MS + 1);

        assert_eq!(tokens.get_token(), None);
        assert_eq!(tokens.cached(), None);
        assert_eq!(
            drain_events(&mut stream),
            vec![LinkEvent::CredentialChanged {
                action: CredentialAction::Clear
            }]
        );
    }

    #[test]
    fn token_exactly_at_max_age_is_still_valid() {
        let clock = ManualClock::new(NOW_MS);
        let (tokens, _) = manager(Arc::new(InMemoryStore::default()), &clock);
        tokens.set_token("abc");
        clock.advance(24 * HOUR_MS);
        assert_eq!(tokens.get_token().as_deref(), Some("abc"));
    }

    #[test]
    fn picks_up_tokens_written_by_another_process() {
        let clock = ManualClock::new(NOW_MS);
        let store = InMemoryStore::default();
        let (tokens, _) = manager(Arc::new(store.clone()), &clock);

        store
            .set_value(CREDENTIAL_NAMESPACE, TOKEN_KEY, "external")
            .expect("seed token");
        assert_eq!(tokens.get_token().as_deref(), Some("external"));
        assert_eq!(
            store
                .get_value(CREDENTIAL_NAMESPACE, ISSUED_AT_KEY)
                .expect("timestamp backfilled"),
            NOW_MS.to_string()
        );
    }

    #[test]
    fn clear_is_idempotent_and_emits_once() {
        let clock = ManualClock::new(NOW_MS);
        let ephemeral = InMemoryStore::default();
        ephemeral
            .set_value(CREDENTIAL_NAMESPACE, TOKEN_KEY, "abc")
            .expect("seed ephemeral");
        let events = EventBus::new(16);
        let tokens = TokenManager::new(
            Arc::new(InMemoryStore::default()),
            events.clone(),
            Arc::new(clock.clone()),
            HOUR_MS,
        )
        .with_ephemeral(Arc::new(ephemeral.clone()));
        tokens.set_token("abc");

        let mut stream = events.subscribe();
        assert!(tokens.clear());
        assert!(!tokens.clear());
        assert!(!tokens.clear());

        assert_eq!(
            drain_events(&mut stream),
            vec![LinkEvent::CredentialChanged {
                action: CredentialAction::Clear
            }]
        );
        assert_eq!(
            ephemeral.get_value(CREDENTIAL_NAMESPACE, TOKEN_KEY),
            Err(StoreError::NotFound)
        );
        assert_eq!(tokens.get_token(), None);
    }

    #[test]
    fn decodes_embedded_expiry() {
        let clock = ManualClock::new(NOW_MS);
        let (tokens, _) = manager(Arc::new(InMemoryStore::default()), &clock);
        let now_secs = NOW_MS / 1_000;

        assert!(tokens.is_expired(&jwt_with_exp(now_secs - 1)));
        assert!(tokens.is_expired(&jwt_with_exp(now_secs)));
        assert!(!tokens.is_expired(&jwt_with_exp(now_secs + 60)));

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#);
        assert!(!tokens.is_expired(&format!("{header}.{payload}.sig")));
    }

    #[test]
    fn malformed_tokens_are_expired() {
        let clock = ManualClock::new(NOW_MS);
        let (tokens, _) = manager(Arc::new(InMemoryStore::default()), &clock);

        assert!(tokens.is_expired("opaque"));
        assert!(tokens.is_expired("a.b"));
        assert!(tokens.is_expired("a.!!!.c"));
        assert!(tokens.is_expired(&format!("a.{}.c", URL_SAFE_NO_PAD.encode(b"[1,2]"))));
        assert!(tokens.is_expired("test-token-12345"));
    }

    #[test]
    fn test_credentials_only_bypass_expiry_when_allowed() {
        let clock = ManualClock::new(NOW_MS);
        let events = EventBus::default();
        let tokens = TokenManager::new(
            Arc::new(InMemoryStore::default()),
            events,
            Arc::new(clock),
            HOUR_MS,
        )
        .allow_test_credentials(true);

        assert!(!tokens.is_expired("test-token-12345"));
        assert!(tokens.is_expired("prod-token"));
    }

    #[test]
    fn has_valid_token_combines_age_and_expiry() {
        let clock = ManualClock::new(NOW_MS);
        let (tokens, _) = manager(Arc::new(InMemoryStore::default()), &clock);
        assert!(!tokens.has_valid_token());

        tokens.set_token(&jwt_with_exp(NOW_MS / 1_000 + 30));
        assert!(tokens.has_valid_token());

        clock.advance(31_000);
        assert!(!tokens.has_valid_token());
    }
}
