use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ErrorClass;

/// Lower-cased fragments that identify a cross-origin rejection in a transport error message.
const CORS_MESSAGE_PATTERNS: &[&str] = &[
    "cors",
    "cross-origin",
    "cross origin",
    "access-control-allow-origin",
    "preflight",
];

/// Failure returned to every caller of the link layer.
///
/// Raw transport errors never escape; they are folded into one of the
/// [`ErrorClass`] variants first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{}: {message}", .class.code())]
pub struct ClassifiedError {
    /// Semantic category.
    pub class: ErrorClass,
    /// HTTP status when a response was received.
    pub status: Option<u16>,
    /// Human-readable message (transport message or server-provided text).
    pub message: String,
    /// Target URL of the failed call, when known.
    pub url: Option<String>,
}

impl ClassifiedError {
    /// Construct a new classified error without status or URL.
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            status: None,
            message: message.into(),
            url: None,
        }
    }

    /// Attach the HTTP status that produced this error.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach the URL of the failed call.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Classify a transport-level failure where no response was received.
    pub fn transport(message: impl Into<String>) -> Self {
        let message = message.into();
        let class = match classify(None, &message) {
            Classification::Failed(class) => class,
            Classification::Success => ErrorClass::NetworkUnreachable,
        };
        Self::new(class, message)
    }

    /// Classify a received response with a failing status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let class = match classify(Some(status), "") {
            Classification::Failed(class) => class,
            Classification::Success => ErrorClass::Unknown,
        };
        Self::new(class, message).with_status(status)
    }
}

/// Outcome of classifying one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The response should be handed to the caller as a body.
    Success,
    /// The call failed with the given class.
    Failed(ErrorClass),
}

/// Classify a call from the presence of a response, its status and the
/// transport error message. First match wins:
///
/// 1. no response + CORS phrasing → `CorsBlocked`
/// 2. no response → `NetworkUnreachable`
/// 3. 401 → `Unauthorized`
/// 4. 403 → `Forbidden`
/// 5. ≥ 500 → `ServerError`
/// 6. other 4xx → `Unknown`, anything else is a success
pub fn classify(status: Option<u16>, transport_message: &str) -> Classification {
    let Some(status) = status else {
        return if is_cors_message(transport_message) {
            Classification::Failed(ErrorClass::CorsBlocked)
        } else {
            Classification::Failed(ErrorClass::NetworkUnreachable)
        };
    };

    match classify_http_status(status) {
        Some(class) => Classification::Failed(class),
        None => Classification::Success,
    }
}

/// Map an HTTP status to its failure class, or `None` for non-failing statuses.
pub fn classify_http_status(status: u16) -> Option<ErrorClass> {
    match status {
        401 => Some(ErrorClass::Unauthorized),
        403 => Some(ErrorClass::Forbidden),
        500..=u16::MAX => Some(ErrorClass::ServerError),
        400..=499 => Some(ErrorClass::Unknown),
        _ => None,
    }
}

/// Whether a transport error message carries known cross-origin rejection phrasing.
pub fn is_cors_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    CORS_MESSAGE_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}
