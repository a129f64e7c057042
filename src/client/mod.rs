//! GitHub API client.
//!
//! [`GitHubClient`] assembles the resilience stack once and shares it between
//! REST and GraphQL calls and between clients derived with
//! [`with_auth`](GitHubClient::with_auth).

pub mod graphql;
pub mod orchestrator;
pub mod rest;

pub use self::graphql::{graphql_url, GraphQLCall};
pub use orchestrator::{CallScope, Orchestrator, RequestStrategy};
pub use rest::{rest_url, RestCall, RestResponse};

use crate::auth::AuthMethod;
use crate::cache::StaleCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{GitHubConfig, GitHubConfigBuilder};
use crate::context::Context;
use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use crate::graphql::{GraphQLRequest, GraphQLResponse};
use crate::observability::Metrics;
use crate::pagination::Page;
use crate::ratelimit::{InternalLimiter, MonitorKey, MonitorRegistry, RateLimitMonitor, RateLimitState};
use crate::resilience::{
    ConcurrencyThrottle, InProcessThrottle, NoopThrottle, RetryPolicy, RetryingTransport,
};
use crate::transport::{ReqwestTransport, Transport};
use bytes::Bytes;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE,
    USER_AGENT,
};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use url::Url;

/// Rate-limit resource of GraphQL calls.
const GRAPHQL_RESOURCE: &str = "graphql";

/// Reported by [`GitHubClient::version`] for github.com.
const DOT_COM_VERSION: &str = "unknown";

const API_VERSION_HEADER: &str = "x-github-api-version";
const ENTERPRISE_VERSION_HEADER: &str = "x-github-enterprise-version";

/// GitHub API client.
#[derive(Clone)]
pub struct GitHubClient {
    config: Arc<GitHubConfig>,
    base_url: Url,
    auth: AuthMethod,
    credential_hash: String,
    orchestrator: Arc<Orchestrator>,
    registry: Arc<MonitorRegistry>,
    versions: Arc<StaleCache<String, String>>,
    metrics: Arc<Metrics>,
}

impl GitHubClient {
    /// Creates a client with the default transport and throttle.
    pub fn new(config: GitHubConfig) -> GitHubResult<Self> {
        GitHubClientBuilder::new().config(config).build()
    }

    /// Creates a new client builder.
    pub fn builder() -> GitHubClientBuilder {
        GitHubClientBuilder::new()
    }

    /// Returns a client for `auth` sharing this client's transport, limiters,
    /// throttle and metrics.
    pub fn with_auth(&self, auth: AuthMethod) -> Self {
        let mut client = self.clone();
        client.credential_hash = auth.hash();
        tracing::debug!(
            credential = auth.token_prefix(),
            base_url = %client.base_url,
            "derived client for another credential"
        );
        client.auth = auth;
        client
    }

    /// Base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Configuration in effect.
    pub fn config(&self) -> &GitHubConfig {
        &self.config
    }

    /// One-way hash of the credential.
    pub fn credential_hash(&self) -> &str {
        &self.credential_hash
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Last REST quota reading for this credential.
    pub fn rate_limit_state(&self) -> RateLimitState {
        self.monitor(&self.config.rate_limit.resource).state()
    }

    /// Last GraphQL quota reading for this credential.
    pub fn graphql_rate_limit_state(&self) -> RateLimitState {
        self.monitor(GRAPHQL_RESOURCE).state()
    }

    fn monitor(&self, resource: &str) -> Arc<RateLimitMonitor> {
        let key = MonitorKey::new(self.base_url.as_str(), &self.credential_hash, resource);
        self.registry
            .monitor(&key, &self.config.rate_limit.header_prefix)
    }

    fn standard_headers(&self) -> GitHubResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, header_value(&self.config.user_agent)?);
        headers.insert(API_VERSION_HEADER, header_value(&self.config.api_version)?);
        if let Some(authorization) = self.auth.header()? {
            let mut value = header_value(&authorization)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    // HTTP methods

    /// Sends a REST request and returns the raw response.
    ///
    /// Non-success statuses come back as errors; 304 is a success with an
    /// empty body.
    pub async fn request<B: Serialize>(
        &self,
        ctx: &Context,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> GitHubResult<RestResponse> {
        let url = rest_url(&self.base_url, path)?;
        let mut call = RestCall::new(method, url, self.standard_headers()?);
        if let Some(body) = body {
            let bytes = serde_json::to_vec(body).map_err(|e| {
                GitHubError::new(
                    GitHubErrorKind::InvalidParameter,
                    format!("serializing request body: {}", e),
                )
            })?;
            call = call.with_body(Bytes::from(bytes));
        }

        let monitor = self.monitor(&self.config.rate_limit.resource);
        self.orchestrator
            .execute(
                ctx,
                CallScope {
                    credential_hash: &self.credential_hash,
                    monitor: &monitor,
                },
                &call,
            )
            .await
    }

    /// Makes a GET request.
    pub async fn get<T: DeserializeOwned>(&self, ctx: &Context, path: &str) -> GitHubResult<T> {
        self.request(ctx, Method::GET, path, Option::<&()>::None)
            .await?
            .json()
    }

    /// Makes a GET request with query parameters.
    pub async fn get_with_params<T: DeserializeOwned, P: Serialize>(
        &self,
        ctx: &Context,
        path: &str,
        params: &P,
    ) -> GitHubResult<T> {
        let query = serde_urlencoded::to_string(params).map_err(|e| {
            GitHubError::new(
                GitHubErrorKind::InvalidParameter,
                format!("serializing query parameters: {}", e),
            )
        })?;
        let path = match (query.is_empty(), path.contains('?')) {
            (true, _) => path.to_string(),
            (false, true) => format!("{}&{}", path, query),
            (false, false) => format!("{}?{}", path, query),
        };
        self.get(ctx, &path).await
    }

    /// Makes a GET request for one page of a list endpoint.
    pub async fn get_page<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        path: &str,
    ) -> GitHubResult<Page<T>> {
        let response = self
            .request(ctx, Method::GET, path, Option::<&()>::None)
            .await?;
        Ok(Page::new(response.json()?, response.links()))
    }

    /// Makes a POST request.
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        ctx: &Context,
        path: &str,
        body: &B,
    ) -> GitHubResult<T> {
        self.request(ctx, Method::POST, path, Some(body)).await?.json()
    }

    /// Makes a PUT request.
    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        ctx: &Context,
        path: &str,
        body: &B,
    ) -> GitHubResult<T> {
        self.request(ctx, Method::PUT, path, Some(body)).await?.json()
    }

    /// Makes a PATCH request.
    pub async fn patch<T: DeserializeOwned, B: Serialize>(
        &self,
        ctx: &Context,
        path: &str,
        body: &B,
    ) -> GitHubResult<T> {
        self.request(ctx, Method::PATCH, path, Some(body)).await?.json()
    }

    /// Makes a DELETE request.
    pub async fn delete(&self, ctx: &Context, path: &str) -> GitHubResult<()> {
        self.request(ctx, Method::DELETE, path, Option::<&()>::None)
            .await?;
        Ok(())
    }

    /// Runs a GraphQL query.
    ///
    /// Errors in the response do not fail the call; partial `data` is decoded
    /// next to them.
    pub async fn graphql<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        query: &str,
        variables: serde_json::Value,
    ) -> GitHubResult<GraphQLResponse<T>> {
        let request = GraphQLRequest::new(query).with_variables(variables);
        let call = GraphQLCall::<T>::new(
            graphql_url(&self.base_url),
            self.standard_headers()?,
            &request,
        )?;

        let monitor = self.monitor(GRAPHQL_RESOURCE);
        self.orchestrator
            .execute(
                ctx,
                CallScope {
                    credential_hash: &self.credential_hash,
                    monitor: &monitor,
                },
                &call,
            )
            .await
    }

    /// GitHub Enterprise version of the host, `"unknown"` for github.com.
    ///
    /// Lookups are cached per base URL and flushed every `version_cache_ttl`.
    pub async fn version(&self, ctx: &Context) -> GitHubResult<String> {
        if is_github_dot_com(&self.base_url) {
            return Ok(DOT_COM_VERSION.to_string());
        }
        let key = self.base_url.to_string();
        if let Some(version) = self.versions.get(&key) {
            return Ok(version);
        }

        let response = self
            .request(ctx, Method::GET, "/", Option::<&()>::None)
            .await?;
        let version = response
            .header(ENTERPRISE_VERSION_HEADER)
            .unwrap_or_default()
            .to_string();
        self.versions.insert(key, version.clone());
        Ok(version)
    }
}

fn header_value(value: &str) -> GitHubResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| {
        GitHubError::configuration(format!("invalid header value: {}", e))
    })
}

/// Returns true for github.com API hosts.
pub fn is_github_dot_com(url: &Url) -> bool {
    matches!(url.host_str(), Some("api.github.com") | Some("github.com"))
}

/// Builder for GitHubClient.
///
/// Every shared component can be injected; whatever is not falls back to the
/// defaults derived from configuration.
#[derive(Default)]
pub struct GitHubClientBuilder {
    config_builder: GitHubConfigBuilder,
    config: Option<GitHubConfig>,
    transport: Option<Arc<dyn Transport>>,
    throttle: Option<Arc<dyn ConcurrencyThrottle>>,
    registry: Option<Arc<MonitorRegistry>>,
    metrics: Option<Arc<Metrics>>,
    clock: Option<Arc<dyn Clock>>,
}

impl GitHubClientBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a complete configuration, ignoring the individual setters.
    pub fn config(mut self, config: GitHubConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.base_url(url);
        self
    }

    /// Sets the authentication method.
    pub fn auth(mut self, auth: AuthMethod) -> Self {
        self.config_builder = self.config_builder.auth(auth);
        self
    }

    /// Sets a personal access token.
    pub fn pat(self, token: impl Into<String>) -> Self {
        self.auth(AuthMethod::pat(token))
    }

    /// Sets the timeout.
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config_builder = self.config_builder.timeout(timeout);
        self
    }

    /// Sets the User-Agent.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.user_agent(ua);
        self
    }

    /// Disables transport retries.
    pub fn no_retry(mut self) -> Self {
        self.config_builder = self.config_builder.no_retry();
        self
    }

    /// Sends through `transport` instead of reqwest.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Uses `throttle` for concurrency locking, e.g. from
    /// [`connect_throttle`](crate::resilience::connect_throttle).
    pub fn throttle(mut self, throttle: Arc<dyn ConcurrencyThrottle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Shares a monitor registry with other clients.
    pub fn registry(mut self, registry: Arc<MonitorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Reports into `metrics`.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Uses `clock` for rate-limit readings and cache staleness.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the client.
    pub fn build(self) -> GitHubResult<GitHubClient> {
        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => self.config_builder.build()?,
        };
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            GitHubError::new(
                GitHubErrorKind::InvalidBaseUrl,
                format!("invalid base URL {:?}: {}", config.base_url, e),
            )
        })?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = self.metrics.unwrap_or_default();

        let base: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(
                config.timeout,
                config.connect_timeout,
            )?),
        };
        let transport = RetryingTransport::new(base, RetryPolicy::from(&config.retry))
            .with_metrics(Arc::clone(&metrics));

        let throttle = self.throttle.unwrap_or_else(|| {
            if config.concurrency.restrict_concurrency {
                Arc::new(InProcessThrottle::new())
            } else {
                Arc::new(NoopThrottle)
            }
        });
        let registry = self.registry.unwrap_or_else(|| {
            Arc::new(MonitorRegistry::new(Arc::clone(&clock)).with_metrics(Arc::clone(&metrics)))
        });
        let internal = Arc::new(InternalLimiter::from_config(&config.rate_limit)?);

        let orchestrator = Orchestrator::new(
            Arc::new(transport),
            internal,
            throttle,
            Arc::clone(&metrics),
            config.rate_limit.clone(),
        );

        let auth = config.auth.clone().unwrap_or_default();
        let versions = StaleCache::new(clock, config.version_cache_ttl);
        tracing::debug!(
            credential = auth.token_prefix(),
            base_url = %base_url,
            restrict_concurrency = config.concurrency.restrict_concurrency,
            "built GitHub client"
        );

        Ok(GitHubClient {
            credential_hash: auth.hash(),
            auth,
            base_url,
            orchestrator: Arc::new(orchestrator),
            registry,
            versions: Arc::new(versions),
            metrics,
            config: Arc::new(config),
        })
    }
}
