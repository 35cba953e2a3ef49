use std::sync::Arc;

use apilink_core::{ClassifiedError, ErrorClass};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::{
    credentials::TokenManager,
    degraded::{DegradedGateway, ReadOutcome},
    pipeline::{RequestPipeline, RequestSpec},
};

pub const PROFILE_FALLBACK_KEY: &str = "profile";

/// Login, registration and profile access on top of the pipeline.
#[derive(Clone)]
pub struct SessionClient {
    pipeline: Arc<RequestPipeline>,
    tokens: Arc<TokenManager>,
    gateway: Arc<DegradedGateway>,
}

impl SessionClient {
    pub fn new(
        pipeline: Arc<RequestPipeline>,
        tokens: Arc<TokenManager>,
        gateway: Arc<DegradedGateway>,
    ) -> Self {
        Self {
            pipeline,
            tokens,
            gateway,
        }
    }

    /// Exchange credentials for a token. A rejected login never expires an
    /// existing session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Value, ClassifiedError> {
        let path = self.pipeline.config().login_path.clone();
        let spec = RequestSpec::post_json(path, json!({ "email": email, "password": password }))
            .authentication();
        let body = self.pipeline.execute(&spec).await?;

        let Some(token) = extract_token(&body) else {
            return Err(ClassifiedError::new(
                ErrorClass::Unknown,
                "login response did not include a token",
            )
            .with_url(self.pipeline.config().url_for(&spec.path)));
        };
        self.tokens.set_token(token);
        info!("login succeeded");
        Ok(body)
    }

    /// Create an account. Stores a token if the backend hands one back.
    pub async fn register(&self, user: Value) -> Result<Value, ClassifiedError> {
        let path = self.pipeline.config().register_path.clone();
        let body = self
            .pipeline
            .execute(&RequestSpec::post_json(path, user).authentication())
            .await?;

        if let Some(token) = extract_token(&body) {
            self.tokens.set_token(token);
        } else {
            debug!("registration response carried no token");
        }
        Ok(body)
    }

    /// Tokens are stateless on the server; logging out only forgets ours.
    pub fn logout(&self) {
        if self.tokens.clear() {
            info!("logged out");
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.has_valid_token()
    }

    /// Current user's profile, served from fallback data while degraded.
    pub async fn profile(&self) -> Result<ReadOutcome<Value>, ClassifiedError> {
        let path = self.pipeline.config().profile_path.clone();
        self.gateway
            .read(PROFILE_FALLBACK_KEY, || async move {
                self.pipeline.execute(&RequestSpec::get(path)).await
            })
            .await
    }

    /// Profile updates are writes and always reach the backend.
    pub async fn update_profile(&self, changes: Value) -> Result<Value, ClassifiedError> {
        let path = self.pipeline.config().profile_path.clone();
        self.gateway
            .write(|| async move {
                self.pipeline
                    .execute(&RequestSpec::put_json(path, changes))
                    .await
            })
            .await
    }
}

fn extract_token(body: &Value) -> Option<&str> {
    ["access_token", "token"]
        .into_iter()
        .find_map(|key| body.get(key).and_then(Value::as_str))
        .filter(|token| !token.is_empty())
}
