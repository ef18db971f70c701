//! The Helix HTTP core: an authenticated, validated, retrying request
//! dispatcher with one typed method per endpoint plus a generic `call`
//! escape hatch.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{HelixError, ValidationError};
use crate::ratelimit::RateLimitManager;
use crate::registry::{EndpointDescriptor, Registry};
use crate::scope::ScopeSet;
use crate::transport::{FetchRequest, HttpTransport, QueryValue};

const BASE_URL: &str = "https://api.twitch.tv/helix";

/// Seam through which the Helix client obtains and refreshes tokens. The
/// OAuth acquisition flow itself lives outside this crate.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn user_access_token(&self) -> Option<String>;
    fn app_access_token(&self) -> Option<String>;
    /// Scopes granted to `token`, as reported by the application's own
    /// bookkeeping (this crate never calls Twitch's validate endpoint).
    fn scopes_for(&self, token: &str) -> Vec<String>;
    fn can_refresh(&self) -> bool;
    async fn refresh(&self) -> Result<(), HelixError>;
}

/// Per-call parameters for [`HelixClient::call`].
#[derive(Debug, Clone, Default)]
pub struct CallParams {
    pub query: Vec<(String, QueryValue)>,
    pub body: Option<Value>,
    /// Overrides the ambient [`TokenProvider::user_access_token`] for this
    /// call only (used by the EventSub subscribe flow, which acts on behalf
    /// of a specific user).
    pub user_access_token: Option<String>,
    pub cancel: Option<CancellationToken>,
}

enum AuthChoice {
    User(String),
    App(String),
}

/// Authenticated, validated, retrying request dispatcher.
pub struct HelixClient {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<dyn TokenProvider>,
    registry: Arc<Registry>,
    rate_limit: RateLimitManager,
    client_id: String,
    max_retries: u32,
    base_url: String,
}

impl HelixClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<dyn TokenProvider>,
        registry: Arc<Registry>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            tokens,
            registry,
            rate_limit: RateLimitManager::new(),
            client_id: client_id.into(),
            max_retries: 5,
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Applies the `[helix]` section of a [`crate::config::ClientConfig`]:
    /// `max_retries` and the rate-limit manager's warning cooldown.
    pub fn with_config(mut self, config: &crate::config::HelixConfig) -> Self {
        self.max_retries = config.max_retries;
        self.rate_limit =
            RateLimitManager::with_warning_cooldown(std::time::Duration::from_secs(
                config.rate_limit_warning_cooldown_secs,
            ));
        self
    }

    /// As [`HelixClient::new`], with the `[helix]` section of a
    /// [`crate::config::ClientConfig`] applied immediately.
    pub fn from_config(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<dyn TokenProvider>,
        registry: Arc<Registry>,
        client_id: impl Into<String>,
        config: &crate::config::HelixConfig,
    ) -> Self {
        Self::new(transport, tokens, registry, client_id).with_config(config)
    }

    /// Overrides the Helix API origin. Production code never needs this;
    /// it exists so integration tests can point the client at a local mock
    /// server instead of `https://api.twitch.tv/helix`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn rate_limit(&self) -> &RateLimitManager {
        &self.rate_limit
    }

    /// Generic dispatcher: looks up `endpoint_name` in the registry and
    /// performs the full validate/auth/retry/classify pipeline from
    /// `spec.md` §4.4.
    pub async fn call(&self, endpoint_name: &str, params: CallParams) -> Result<Value, HelixError> {
        let descriptor = self
            .registry
            .lookup_endpoint(endpoint_name)
            .ok_or_else(|| HelixError::UnknownEndpoint(endpoint_name.to_string()))?;

        self.validate_query(descriptor, &params.query)?;
        if let Some(body) = &params.body {
            self.validate_body(descriptor, body)?;
        } else if descriptor.request_body.is_some() {
            return Err(HelixError::Validation(ValidationError::MissingField(
                "body".to_string(),
            )));
        }

        let auth = self.select_auth(descriptor, params.user_access_token.as_deref())?;
        if let AuthChoice::User(token) = &auth {
            if let Some(scopes) = &descriptor.auth.user_scopes {
                self.check_scopes(descriptor, token, scopes)?;
            }
        }

        let response = self
            .execute_with_retry(descriptor, &params, auth)
            .await?;
        let status = response.status;
        let result = self.classify(descriptor, response);
        if descriptor.success_codes.contains(&status) {
            self.rate_limit.on_successful_request().await;
        }
        result
    }

    fn validate_query(
        &self,
        descriptor: &EndpointDescriptor,
        query: &[(String, QueryValue)],
    ) -> Result<(), ValidationError> {
        match &descriptor.request_query {
            Some(schema) => {
                let as_value = serde_json::Value::Object(
                    query
                        .iter()
                        .map(|(k, v)| {
                            let value = match v {
                                QueryValue::Single(s) => Value::String(s.clone()),
                                QueryValue::Multi(items) => {
                                    Value::Array(items.iter().cloned().map(Value::String).collect())
                                }
                            };
                            (k.clone(), value)
                        })
                        .collect(),
                );
                schema.parse(&as_value)?;
                Ok(())
            }
            None => {
                if query.is_empty() {
                    Ok(())
                } else {
                    Err(ValidationError::UnexpectedField(
                        query[0].0.clone(),
                    ))
                }
            }
        }
    }

    fn validate_body(&self, descriptor: &EndpointDescriptor, body: &Value) -> Result<(), ValidationError> {
        match &descriptor.request_body {
            Some(schema) => {
                schema.parse(body)?;
                Ok(())
            }
            None => Err(ValidationError::UnexpectedField("body".to_string())),
        }
    }

    fn select_auth(
        &self,
        descriptor: &EndpointDescriptor,
        explicit_user_token: Option<&str>,
    ) -> Result<AuthChoice, HelixError> {
        let user_token = explicit_user_token
            .map(str::to_string)
            .or_else(|| self.tokens.user_access_token());

        if descriptor.auth.user_access_token {
            if let Some(token) = user_token {
                return Ok(AuthChoice::User(token));
            }
        }
        if descriptor.auth.app_access_token {
            if let Some(token) = self.tokens.app_access_token() {
                return Ok(AuthChoice::App(token));
            }
        }
        if !descriptor.auth.user_access_token && !descriptor.auth.app_access_token {
            // Endpoint declares no auth requirement at all; fall back to
            // whatever token is available, preferring user.
            if let Some(token) = self.tokens.user_access_token() {
                return Ok(AuthChoice::User(token));
            }
            if let Some(token) = self.tokens.app_access_token() {
                return Ok(AuthChoice::App(token));
            }
        }
        Err(HelixError::Authorization {
            endpoint: descriptor.name,
        })
    }

    fn check_scopes(
        &self,
        descriptor: &EndpointDescriptor,
        token: &str,
        required: &ScopeSet,
    ) -> Result<(), HelixError> {
        let granted = self.tokens.scopes_for(token);
        if required.is_satisfied_by(&granted) {
            Ok(())
        } else {
            Err(HelixError::InsufficientScopes {
                endpoint: descriptor.name,
                required: required.clone(),
            })
        }
    }

    async fn execute_with_retry(
        &self,
        descriptor: &EndpointDescriptor,
        params: &CallParams,
        mut auth: AuthChoice,
    ) -> Result<crate::transport::FetchResponse, HelixError> {
        let mut refreshed_once = false;
        let mut last: Option<crate::transport::FetchResponse> = None;

        for attempt in 0..self.max_retries {
            let request = self.build_request(descriptor, params, &auth);
            let response = self.transport.fetch(request).await?;
            self.rate_limit.on_request_attempt(&response.rate_limit).await;
            let status = response.status;

            match status {
                401 if !refreshed_once && self.tokens.can_refresh() => {
                    debug!(endpoint = descriptor.name, attempt, "401; attempting one token refresh");
                    self.tokens.refresh().await?;
                    refreshed_once = true;
                    auth = self.reselect_after_refresh(descriptor, &auth)?;
                    last = Some(response);
                    continue;
                }
                429 => {
                    let wait = self.rate_limit.on_rate_limit_hit().await;
                    debug!(endpoint = descriptor.name, attempt, ?wait, "429; backing off");
                    self.wait(wait, params.cancel.as_ref()).await?;
                    last = Some(response);
                    continue;
                }
                503 => {
                    debug!(endpoint = descriptor.name, attempt, "503; retrying after 1s");
                    self.wait(std::time::Duration::from_millis(1000), params.cancel.as_ref())
                        .await?;
                    last = Some(response);
                    continue;
                }
                _ => return Ok(response),
            }
        }

        // Exhausted `max_retries` fetch attempts, each already subject to the
        // retry/backoff handling above; the last one's response is what gets
        // classified. No further request is made.
        Ok(last.expect("HelixClient configured with max_retries == 0"))
    }

    fn reselect_after_refresh(
        &self,
        descriptor: &EndpointDescriptor,
        previous: &AuthChoice,
    ) -> Result<AuthChoice, HelixError> {
        match previous {
            AuthChoice::User(_) => self
                .tokens
                .user_access_token()
                .map(AuthChoice::User)
                .ok_or(HelixError::Authorization {
                    endpoint: descriptor.name,
                }),
            AuthChoice::App(_) => self
                .tokens
                .app_access_token()
                .map(AuthChoice::App)
                .ok_or(HelixError::Authorization {
                    endpoint: descriptor.name,
                }),
        }
    }

    async fn wait(&self, duration: std::time::Duration, cancel: Option<&CancellationToken>) -> Result<(), HelixError> {
        if let Some(cancel) = cancel {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(HelixError::Transport(crate::error::TransportError::Cancelled)),
                _ = sleep(duration) => Ok(()),
            }
        } else {
            sleep(duration).await;
            Ok(())
        }
    }

    fn build_request(
        &self,
        descriptor: &EndpointDescriptor,
        params: &CallParams,
        auth: &AuthChoice,
    ) -> FetchRequest {
        let url = format!("{}/{}", self.base_url, descriptor.path);
        let token = match auth {
            AuthChoice::User(t) | AuthChoice::App(t) => t,
        };

        let mut request = FetchRequest::new(method_str(descriptor), url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Client-Id", &self.client_id);

        for (key, value) in &params.query {
            request = request.query(key.clone(), value.clone());
        }
        if let Some(body) = &params.body {
            request = request.body(body.clone());
        }
        if let Some(cancel) = &params.cancel {
            request = request.cancel(cancel.clone());
        }
        request
    }

    fn classify(
        &self,
        descriptor: &EndpointDescriptor,
        response: crate::transport::FetchResponse,
    ) -> Result<Value, HelixError> {
        let status = response.status;

        if descriptor.success_codes.contains(&status) {
            return match (&descriptor.response_body, response.body) {
                (Some(schema), Some(body)) => Ok(schema.parse(&body)?),
                (Some(_), None) => Err(HelixError::EmptyBody {
                    endpoint: descriptor.name,
                }),
                (None, None) => Ok(Value::Null),
                (None, Some(_)) => Err(HelixError::UnexpectedBody {
                    endpoint: descriptor.name,
                }),
            };
        }

        if status == 429 {
            return Err(HelixError::RateLimit {
                endpoint: descriptor.name,
                snapshot: crate::error::RateLimitSnapshot {
                    limit: response.rate_limit.limit,
                    remaining: response.rate_limit.remaining,
                    reset_at_ms: response.rate_limit.reset * 1000,
                },
            });
        }

        if descriptor.error_codes.contains(&status) {
            warn!(endpoint = descriptor.name, status, "Helix call failed");
            return Err(HelixError::Api {
                endpoint: descriptor.name,
                status,
            });
        }

        warn!(endpoint = descriptor.name, status, "Helix call returned an unexpected status");
        Err(HelixError::Api {
            endpoint: descriptor.name,
            status,
        })
    }

    /// `createEventSubSubscription`: the typed form of `call` used by both
    /// delivery cores.
    pub async fn create_event_sub_subscription(
        &self,
        body: Value,
        user_access_token: Option<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<Value, HelixError> {
        let result = self
            .call(
                "createEventSubSubscription",
                CallParams {
                    query: Vec::new(),
                    body: Some(body),
                    user_access_token,
                    cancel,
                },
            )
            .await?;
        Ok(result)
    }

    pub async fn delete_event_sub_subscription(
        &self,
        id: &str,
        user_access_token: Option<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<(), HelixError> {
        self.call(
            "deleteEventSubSubscription",
            CallParams {
                query: vec![("id".to_string(), QueryValue::Single(id.to_string()))],
                body: None,
                user_access_token,
                cancel,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn get_event_sub_subscriptions(
        &self,
        query: Vec<(String, QueryValue)>,
        user_access_token: Option<String>,
    ) -> Result<Value, HelixError> {
        let result = self
            .call(
                "getEventSubSubscriptions",
                CallParams {
                    query,
                    body: None,
                    user_access_token,
                    cancel: None,
                },
            )
            .await?;
        Ok(result)
    }
}

fn method_str(descriptor: &EndpointDescriptor) -> &'static str {
    descriptor.method.as_str()
}
