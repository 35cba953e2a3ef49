use crate::{
    error::ClassifiedError,
    types::{ErrorClass, LinkEvent, RequestPurpose},
};

/// Events to broadcast for a terminally failed call.
///
/// `token_present` reports whether a bearer token was attached; only then can
/// a 401 mean the session expired.
pub fn failure_events(
    error: &ClassifiedError,
    purpose: RequestPurpose,
    token_present: bool,
) -> Vec<LinkEvent> {
    let url = error.url.clone().unwrap_or_default();
    match error.class {
        ErrorClass::NetworkUnreachable => vec![LinkEvent::NetworkError {
            message: error.message.clone(),
        }],
        ErrorClass::CorsBlocked => vec![LinkEvent::CorsError {
            message: error.message.clone(),
            url,
        }],
        ErrorClass::Unauthorized if purpose == RequestPurpose::Standard && token_present => {
            vec![LinkEvent::SessionExpired { url }]
        }
        _ => Vec::new(),
    }
}

/// Whether a failed call should wipe the stored credential.
pub fn clears_credential(
    error: &ClassifiedError,
    purpose: RequestPurpose,
    token_present: bool,
) -> bool {
    error.class == ErrorClass::Unauthorized
        && purpose == RequestPurpose::Standard
        && token_present
}
