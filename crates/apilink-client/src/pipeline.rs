//! Request pipeline: builds requests, attaches credentials, runs them through
//! the retry loop and classifies every outcome.

use std::{error::Error as StdError, sync::Arc, time::Duration};

use apilink_core::{
    Classification, ClassifiedError, ErrorClass, EventBus, LinkConfig, RequestPurpose,
    RetryPolicy, classify, clears_credential, failure_events, with_retry,
};
use reqwest::{
    Method,
    header::{ACCEPT, HeaderMap, HeaderValue},
    multipart,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::credentials::TokenManager;

const MAX_MESSAGE_LEN: usize = 240;

/// One field of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        content_type: Option<String>,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Multipart(Vec<UploadPart>),
}

/// Description of one logical call. Rebuilt into a fresh HTTP request for
/// every attempt.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
    pub purpose: RequestPurpose,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            purpose: RequestPurpose::Standard,
            timeout: None,
            retry: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(RequestBody::Json(body))
    }

    pub fn put_json(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(RequestBody::Json(body))
    }

    pub fn patch_json(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).with_body(RequestBody::Json(body))
    }

    /// Multipart POST, sent with the upload timeout.
    pub fn upload(path: impl Into<String>, parts: Vec<UploadPart>) -> Self {
        Self::new(Method::POST, path).with_body(RequestBody::Multipart(parts))
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Mark this call as a login/registration attempt.
    pub fn authentication(mut self) -> Self {
        self.purpose = RequestPurpose::Authentication;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    fn is_upload(&self) -> bool {
        matches!(self.body, RequestBody::Multipart(_))
    }
}

/// Executes [`RequestSpec`]s against the configured backend.
pub struct RequestPipeline {
    client: reqwest::Client,
    config: Arc<LinkConfig>,
    tokens: Arc<TokenManager>,
    events: EventBus,
}

impl RequestPipeline {
    pub fn new(
        config: Arc<LinkConfig>,
        tokens: Arc<TokenManager>,
        events: EventBus,
    ) -> Result<Self, ClassifiedError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| {
                ClassifiedError::new(
                    ErrorClass::Unknown,
                    format!("failed to build HTTP client: {err}"),
                )
            })?;

        Ok(Self {
            client,
            config,
            tokens,
            events,
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Run one logical call with retries. Terminal failures are broadcast and
    /// a 401 on a non-authentication call clears the stored credential.
    pub async fn execute(&self, spec: &RequestSpec) -> Result<Value, ClassifiedError> {
        let policy = spec.retry.unwrap_or_else(|| self.config.retry_policy());
        let url = self.config.url_for(&spec.path);
        let token = self.tokens.get_token();

        let result = with_retry(&policy, |attempt| {
            debug!(method = %spec.method, %url, attempt, "sending request");
            self.send_once(spec, &url, token.as_deref())
        })
        .await;

        result.inspect_err(|err| self.publish_failure(err, spec.purpose, token.is_some()))
    }

    /// Execute and decode the body into `T`.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        spec: &RequestSpec,
    ) -> Result<T, ClassifiedError> {
        let url = self.config.url_for(&spec.path);
        let body = self.execute(spec).await?;
        serde_json::from_value(body).map_err(|err| {
            ClassifiedError::new(
                ErrorClass::Unknown,
                format!("failed to decode response: {err}"),
            )
            .with_url(url)
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClassifiedError> {
        self.execute_json(&RequestSpec::get(path)).await
    }

    async fn send_once(
        &self,
        spec: &RequestSpec,
        url: &str,
        token: Option<&str>,
    ) -> Result<Value, ClassifiedError> {
        let timeout = spec.timeout.unwrap_or_else(|| {
            if spec.is_upload() {
                self.config.upload_timeout()
            } else {
                self.config.request_timeout()
            }
        });

        let mut request = self
            .client
            .request(spec.method.clone(), url)
            .timeout(timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request = match &spec.body {
            RequestBody::Empty => request,
            RequestBody::Json(body) => request.json(body),
            RequestBody::Multipart(parts) => request.multipart(build_form(parts, url)?),
        };

        let response = request
            .send()
            .await
            .map_err(|err| transport_error(&err, url, timeout))?;
        let status = response.status().as_u16();
        let classification = classify(Some(status), "");
        let text = match response.text().await {
            Ok(text) => text,
            // The status line already arrived; a truncated body does not
            // change what the server answered.
            Err(err) => match classification {
                Classification::Failed(_) => {
                    debug!(status, %url, "failed reading error body: {err}");
                    String::new()
                }
                Classification::Success => return Err(transport_error(&err, url, timeout)),
            },
        };

        match classification {
            Classification::Success => Ok(parse_body(&text)),
            Classification::Failed(class) => Err(ClassifiedError::new(
                class,
                server_message(&text, status),
            )
            .with_status(status)
            .with_url(url)),
        }
    }

    fn publish_failure(&self, error: &ClassifiedError, purpose: RequestPurpose, token_present: bool) {
        warn!(
            class = error.class.code(),
            status = error.status,
            url = error.url.as_deref().unwrap_or_default(),
            ?purpose,
            "request failed: {}",
            error.message
        );

        if clears_credential(error, purpose, token_present) {
            self.tokens.clear();
        }
        for event in failure_events(error, purpose, token_present) {
            self.events.emit(event);
        }
    }
}

fn build_form(parts: &[UploadPart], url: &str) -> Result<multipart::Form, ClassifiedError> {
    let mut form = multipart::Form::new();
    for part in parts {
        form = match part {
            UploadPart::Text { name, value } => form.text(name.clone(), value.clone()),
            UploadPart::File {
                name,
                file_name,
                content_type,
                data,
            } => {
                let mut file = multipart::Part::bytes(data.clone()).file_name(file_name.clone());
                if let Some(content_type) = content_type {
                    file = file.mime_str(content_type).map_err(|err| {
                        ClassifiedError::new(
                            ErrorClass::Unknown,
                            format!("invalid content type '{content_type}': {err}"),
                        )
                        .with_url(url)
                    })?;
                }
                form.part(name.clone(), file)
            }
        };
    }
    Ok(form)
}

/// Map a reqwest failure (no usable response) to a classified error.
pub(crate) fn transport_error(err: &reqwest::Error, url: &str, timeout: Duration) -> ClassifiedError {
    if err.is_timeout() {
        return ClassifiedError::new(
            ErrorClass::NetworkUnreachable,
            format!("request timed out after {}ms", timeout.as_millis()),
        )
        .with_url(url);
    }
    ClassifiedError::transport(error_chain(err)).with_url(url)
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}

fn server_message(text: &str, status: u16) -> String {
    if let Ok(Value::Object(body)) = serde_json::from_str::<Value>(text) {
        for key in ["message", "error", "msg"] {
            if let Some(Value::String(message)) = body.get(key) {
                return message.clone();
            }
        }
    }

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return format!("HTTP {status}");
    }
    trimmed.chars().take(MAX_MESSAGE_LEN).collect()
}
