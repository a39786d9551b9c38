use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    cache::CacheStore,
    error::{ConfigError, Failure},
    interceptor::{Interceptor, InterceptorChain, RequestContext},
    proxy::ProxyFallback,
    registry::InflightRegistry,
    request::{Body, FormBody, Params, ProgressFn, RequestDescriptor, RequestOverrides, ResponseType},
    response::{Envelope, Payload, Response},
    retry::{RetryDecision, RetryState},
    session::{MemoryTokenStore, NoopNotifier, Notifier, TokenStore},
    transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse},
    ApiError, ClientConfig, Result,
};

/// Assembles a [`PortalClient`] from a configuration and its collaborators.
pub struct PortalClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    tokens: Arc<dyn TokenStore>,
    notifier: Arc<dyn Notifier>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl PortalClientBuilder {
    fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            tokens: Arc::new(MemoryTokenStore::new()),
            notifier: Arc::new(NoopNotifier),
            interceptors: Vec::new(),
        }
    }

    /// Replaces the default `reqwest` transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Session store the bearer token is read from.
    pub fn token_store(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Receives every terminal failure except superseded cancellations.
    pub fn notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    /// Appends an interceptor after the built-in stages.
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> std::result::Result<PortalClient, ConfigError> {
        let base = self.config.base_url.trim();
        if base.contains("://") {
            url::Url::parse(base).map_err(|source| ConfigError::InvalidUrl {
                value: base.to_owned(),
                source,
            })?;
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let http = reqwest::Client::builder().build()?;
                Arc::new(ReqwestTransport::with_client(http))
            }
        };

        let cache = CacheStore::new();
        let chain = InterceptorChain::new(
            &self.config,
            self.tokens.clone(),
            cache.clone(),
            self.interceptors,
        );
        let proxy = ProxyFallback::new(self.config.proxy_relays.iter().cloned())
            .with_logging(self.config.enable_log);

        Ok(PortalClient {
            config: Arc::new(self.config),
            transport,
            chain: Arc::new(chain),
            cache,
            inflight: InflightRegistry::new(),
            proxy: Arc::new(proxy),
            tokens: self.tokens,
            notifier: self.notifier,
        })
    }
}

/// API client with request de-duplication, caching, retry and error normalization.
///
/// Cache and in-flight registry belong to the instance; clones share them,
/// separately built clients do not.
#[derive(Clone)]
pub struct PortalClient {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    chain: Arc<InterceptorChain>,
    cache: CacheStore,
    inflight: InflightRegistry,
    proxy: Arc<ProxyFallback>,
    tokens: Arc<dyn TokenStore>,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for PortalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalClient")
            .field("config", &self.config)
            .field("tokens", &"<redacted>")
            .field("cache_entries", &self.cache.len())
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}

impl PortalClient {
    /// Starts building a client.
    pub fn builder(config: ClientConfig) -> PortalClientBuilder {
        PortalClientBuilder::new(config)
    }

    /// Creates a client with the default transport and collaborators.
    pub fn new(config: ClientConfig) -> std::result::Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    /// Creates a client configured from `PORTAL_API_*` environment variables.
    ///
    /// See [`ClientConfig::from_env`].
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn token_store(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Sends a GET request and decodes the unwrapped payload.
    pub async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        params: impl Into<Params>,
        overrides: RequestOverrides,
    ) -> Result<T> {
        let descriptor = RequestDescriptor::new(Method::GET, url)
            .params(params)
            .overrides(overrides);
        self.request(descriptor).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        body: impl Into<Body>,
        overrides: RequestOverrides,
    ) -> Result<T> {
        self.send_body(Method::POST, url, body.into(), overrides).await
    }

    pub async fn put<T: DeserializeOwned>(
        &self,
        url: &str,
        body: impl Into<Body>,
        overrides: RequestOverrides,
    ) -> Result<T> {
        self.send_body(Method::PUT, url, body.into(), overrides).await
    }

    pub async fn patch<T: DeserializeOwned>(
        &self,
        url: &str,
        body: impl Into<Body>,
        overrides: RequestOverrides,
    ) -> Result<T> {
        self.send_body(Method::PATCH, url, body.into(), overrides).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        url: &str,
        params: impl Into<Params>,
        overrides: RequestOverrides,
    ) -> Result<T> {
        let descriptor = RequestDescriptor::new(Method::DELETE, url)
            .params(params)
            .overrides(overrides);
        self.request(descriptor).await
    }

    /// Posts a multipart form, reporting upload progress to `on_progress`.
    pub async fn upload<T: DeserializeOwned>(
        &self,
        url: &str,
        form: FormBody,
        mut overrides: RequestOverrides,
        on_progress: Option<ProgressFn>,
    ) -> Result<T> {
        if on_progress.is_some() {
            overrides.progress = on_progress;
        }
        let descriptor = RequestDescriptor::new(Method::POST, url)
            .body(form)
            .overrides(overrides);
        self.request(descriptor).await
    }

    /// Fetches a binary resource, reporting download progress to `on_progress`.
    pub async fn download(
        &self,
        url: &str,
        params: impl Into<Params>,
        mut overrides: RequestOverrides,
        on_progress: Option<ProgressFn>,
    ) -> Result<Bytes> {
        overrides.response_type = ResponseType::Binary;
        if on_progress.is_some() {
            overrides.progress = on_progress;
        }
        let descriptor = RequestDescriptor::new(Method::GET, url)
            .params(params)
            .overrides(overrides);
        Ok(self.dispatch(descriptor).await?.into_bytes())
    }

    /// Dispatches `descriptor` and decodes the unwrapped JSON payload into `T`.
    pub async fn request<T: DeserializeOwned>(&self, descriptor: RequestDescriptor) -> Result<T> {
        let method = descriptor.method.clone();
        let url = descriptor.url.clone();
        let payload = self.dispatch(descriptor).await?;

        let value = match payload {
            Payload::Json(value) => value,
            Payload::Binary(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        };
        serde_json::from_value(value).map_err(|err| {
            let error =
                ApiError::undecodable(format!("invalid response payload: {err}"), &method, &url);
            self.notifier.notify(&error);
            error
        })
    }

    /// Runs one logical request through the full pipeline.
    ///
    /// A request sharing its key with one already in flight cancels the older
    /// one. Every failure is returned as an [`ApiError`]; cancellation has
    /// kind [`ErrorKind::Cancel`](crate::ErrorKind::Cancel).
    pub async fn dispatch(&self, descriptor: RequestDescriptor) -> Result<Payload> {
        let key = descriptor.request_key();
        let (ticket, signal) = self.inflight.register(&key);
        let mut ctx = RequestContext::new(descriptor, key, signal, &self.config);

        let outcome = self.run(&mut ctx).await;
        self.inflight.release(ctx.key(), ticket);

        match outcome {
            Ok(response) => Ok(response.payload),
            Err(error) => {
                self.chain.on_error(&ctx, &error);
                if !error.is_superseded() {
                    self.notifier.notify(&error);
                }
                Err(error)
            }
        }
    }

    /// Cancels the request registered under `request_id`, or every in-flight
    /// request when `None`. Returns how many requests were cancelled.
    pub fn cancel_request(&self, request_id: Option<&str>) -> usize {
        match request_id {
            Some(id) => usize::from(self.inflight.cancel(id)),
            None => self.inflight.cancel_all(),
        }
    }

    /// Removes cached responses whose key matches the regex `pattern`, or all
    /// of them when `None`.
    pub fn clear_cache(&self, pattern: Option<&str>) -> std::result::Result<usize, regex::Error> {
        let pattern = pattern.map(Regex::new).transpose()?;
        Ok(self.cache.clear(pattern.as_ref()))
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    async fn send_body<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Body,
        overrides: RequestOverrides,
    ) -> Result<T> {
        let descriptor = RequestDescriptor::new(method, url)
            .body(body)
            .overrides(overrides);
        self.request(descriptor).await
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<Response> {
        self.chain.on_request(ctx)?;

        let mut response = match ctx.take_cached() {
            Some(payload) => Response::cached(payload),
            None => self.fetch(ctx).await?,
        };

        // a response that arrived after cancellation is discarded
        if let Some(reason) = ctx.cancel_reason() {
            return Err(ApiError::cancelled(reason, ctx.method(), ctx.full_url()));
        }

        self.chain.on_response(ctx, &mut response)?;

        if let Payload::Json(value) = &mut response.payload {
            *value = match Envelope::open(std::mem::take(value)) {
                Envelope::Success(data) => data,
                Envelope::Plain(value) => value,
                Envelope::Failure { code, message } => {
                    return Err(ApiError::application(
                        code,
                        message,
                        ctx.method(),
                        ctx.full_url(),
                    ));
                }
            };
        }
        Ok(response)
    }

    async fn fetch(&self, ctx: &RequestContext) -> Result<Response> {
        let request = self.transport_request(ctx);
        let response_type = request.response_type;

        if ctx.use_proxy() {
            let outcome = self
                .guarded(ctx, None, self.proxy.fetch(self.transport.as_ref(), &request, 0))
                .await;
            return outcome
                .map(|response| Response::from_transport(response, response_type))
                .map_err(|failure| ApiError::from_failure(failure, ctx.method(), ctx.full_url()));
        }

        let policy = ctx
            .descriptor()
            .overrides
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        let mut retry = RetryState::new(&policy);

        loop {
            let timeout = request.timeout;
            let failure = match self
                .guarded(ctx, Some(timeout), self.transport.send(request.clone()))
                .await
            {
                Ok(response) if response.is_success() => {
                    return Ok(Response::from_transport(response, response_type));
                }
                Ok(response) => Failure::Response {
                    status: response.status,
                    body: response.text(),
                },
                Err(failure) => failure,
            };

            if let Failure::Cancelled(reason) = failure {
                return Err(ApiError::cancelled(reason, ctx.method(), ctx.full_url()));
            }

            match retry.on_failure(&failure) {
                RetryDecision::Retry { attempt, delay } => {
                    if self.config.enable_log {
                        tracing::info!(
                            method = %ctx.method(),
                            url = %ctx.full_url(),
                            attempt,
                            max_retries = retry.max_retries(),
                            delay_ms = %delay.as_millis(),
                            "retrying request: {failure}"
                        );
                    }
                    let mut signal = ctx.signal().clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        reason = signal.cancelled() => {
                            return Err(ApiError::cancelled(
                                reason,
                                ctx.method(),
                                ctx.full_url(),
                            ));
                        }
                    }
                }
                RetryDecision::Exhausted => {
                    return Err(ApiError::from_failure(failure, ctx.method(), ctx.full_url()));
                }
            }
        }
    }

    /// Races `call` against cancellation and, when given, a deadline.
    async fn guarded<F>(
        &self,
        ctx: &RequestContext,
        timeout: Option<Duration>,
        call: F,
    ) -> std::result::Result<TransportResponse, Failure>
    where
        F: Future<Output = std::result::Result<TransportResponse, Failure>>,
    {
        let mut signal = ctx.signal().clone();
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
                    Err(Failure::timeout(format!(
                        "timeout of {}ms exceeded",
                        timeout.as_millis()
                    )))
                }),
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            reason = signal.cancelled() => Err(Failure::Cancelled(reason)),
            outcome = deadline => outcome,
        }
    }

    fn transport_request(&self, ctx: &RequestContext) -> TransportRequest {
        let descriptor = ctx.descriptor();
        TransportRequest {
            method: descriptor.method.clone(),
            url: ctx.full_url().to_owned(),
            headers: ctx.headers().clone(),
            body: descriptor.body.clone(),
            timeout: ctx.timeout(),
            response_type: descriptor.overrides.response_type,
            progress: descriptor.overrides.progress.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PortalClient;
    use crate::session::MemoryTokenStore;
    use crate::ClientConfig;
    use std::sync::Arc;

    #[test]
    fn debug_redacts_token_store() {
        let client = PortalClient::builder(ClientConfig::default())
            .token_store(Arc::new(MemoryTokenStore::with_token("secret-token")))
            .build()
            .expect("client must build");
        let debug = format!("{client:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn invalid_absolute_base_url_is_rejected() {
        let config = ClientConfig::default().with_base_url("https://exa mple.com/api");
        assert!(PortalClient::new(config).is_err());
    }

    #[test]
    fn clear_cache_rejects_bad_pattern() {
        let client = PortalClient::new(ClientConfig::default()).expect("client must build");
        assert!(client.clear_cache(Some("(")).is_err());
        assert_eq!(client.clear_cache(None).expect("no pattern"), 0);
    }

    #[test]
    fn cancel_unknown_request_is_noop() {
        let client = PortalClient::new(ClientConfig::default()).expect("client must build");
        assert_eq!(client.cancel_request(Some("missing")), 0);
        assert_eq!(client.cancel_request(None), 0);
    }
}
