use serde::{Deserialize, Serialize};

/// Semantic category assigned to every failed call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// No response reached the client (connection refused, DNS, timeout).
    NetworkUnreachable,
    /// The request was rejected by cross-origin policy before reaching application code.
    CorsBlocked,
    /// HTTP 401.
    Unauthorized,
    /// HTTP 403.
    Forbidden,
    /// HTTP 5xx.
    ServerError,
    /// Any other failed response (remaining 4xx codes, undecodable bodies).
    Unknown,
}

impl ErrorClass {
    /// Default retry predicate: only transient classes are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::NetworkUnreachable | Self::ServerError)
    }

    /// Stable machine-readable code.
    pub fn code(self) -> &'static str {
        match self {
            Self::NetworkUnreachable => "network_unreachable",
            Self::CorsBlocked => "cors_blocked",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::ServerError => "server_error",
            Self::Unknown => "unknown",
        }
    }
}

/// Which side of the credential lifecycle a `CredentialChanged` event reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CredentialAction {
    Set,
    Clear,
}

/// Combined connectivity status derived from the browser/OS signal and backend probes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LinkStatus {
    /// Network is up and the backend answered the last probe.
    OnlineReachable,
    /// Network is up but the backend is not answering.
    OnlineUnreachable,
    /// Network is up and the server is running, but cross-origin policy rejects us.
    OnlineMisconfigured,
    /// The host reported loss of network.
    Offline,
}

impl LinkStatus {
    /// Whether the backend can currently be used for real calls.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::OnlineReachable)
    }
}

/// Snapshot of the shared connectivity state.
///
/// Only the connectivity monitor writes this; everyone else reads copies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectivityState {
    /// Host-reported network availability.
    pub browser_online: bool,
    /// Result of the most recent backend observation.
    pub backend_reachable: bool,
    /// Milliseconds since Unix epoch of the most recent observation, if any.
    pub last_checked_at_ms: Option<u64>,
    /// Class of the most recent failed observation, cleared on success.
    pub last_error: Option<ErrorClass>,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            browser_online: true,
            backend_reachable: true,
            last_checked_at_ms: None,
            last_error: None,
        }
    }
}

/// User-facing notification kinds. At most one outage notice and one recovery
/// notice are live at any time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Notice {
    WentOffline,
    BackendUnreachable,
    BackendMisconfigured,
    BackOnline,
}

/// Event broadcast by the link layer to any number of collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LinkEvent {
    /// A bearer token was stored or removed.
    CredentialChanged {
        action: CredentialAction,
    },
    /// A call terminally failed without reaching the server.
    NetworkError {
        message: String,
    },
    /// A call was rejected by cross-origin policy.
    CorsError {
        message: String,
        url: String,
    },
    /// A non-authentication call was answered with 401.
    SessionExpired {
        url: String,
    },
    /// The combined connectivity status changed.
    ConnectivityChanged {
        status: LinkStatus,
    },
    /// One-shot notification for a status transition.
    Notify {
        notice: Notice,
    },
}

/// Why a request is being made. Authentication attempts expect 401 as a
/// normal "wrong credentials" answer and must not expire the session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RequestPurpose {
    #[default]
    Standard,
    Authentication,
}
