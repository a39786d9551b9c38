//! Ordered pre-request and post-response hooks.
//!
//! The built-in stages always run first and in a fixed order: timing, bearer
//! authentication, proxy tagging, cache lookup, logging. Post-response hooks
//! run in the same order, so the elapsed time is known before the cache is
//! populated and the response is logged. User interceptors run after the
//! built-ins.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;
use tokio::time::Instant;
use url::Url;

use crate::cache::CacheStore;
use crate::config::{CachePolicy, ClientConfig, Environment};
use crate::error::ApiError;
use crate::proxy::should_use_proxy;
use crate::registry::{CancelReason, CancelSignal};
use crate::request::{append_query, resolve_url, RequestDescriptor, ResponseType};
use crate::response::{Envelope, Payload, Response};
use crate::session::{bearer_authorization, TokenStore};
use crate::Result;

/// State of one logical request as it moves through the chain.
pub struct RequestContext {
    descriptor: RequestDescriptor,
    key: String,
    fingerprint: String,
    target: String,
    full_url: String,
    headers: HeaderMap,
    timeout: Duration,
    started_at: Option<Instant>,
    use_proxy: bool,
    cache_key: Option<String>,
    cache_ttl: Duration,
    cached: Option<Value>,
    signal: CancelSignal,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.descriptor.method)
            .field("full_url", &self.full_url)
            .field("key", &self.key)
            .field("use_proxy", &self.use_proxy)
            .field("cache_key", &self.cache_key)
            .finish()
    }
}

impl RequestContext {
    pub(crate) fn new(
        descriptor: RequestDescriptor,
        key: String,
        signal: CancelSignal,
        config: &ClientConfig,
    ) -> Self {
        let resolved = resolve_url(&config.base_url, &descriptor.url);
        let target = match (&config.page_origin, Url::parse(&resolved)) {
            (Some(origin), Err(_)) => origin
                .join(&resolved)
                .map(String::from)
                .unwrap_or(resolved),
            _ => resolved,
        };
        let full_url = append_query(&target, &descriptor.params);

        let mut headers = config.headers.clone();
        for (name, value) in &descriptor.headers {
            headers.insert(name.clone(), value.clone());
        }

        Self {
            fingerprint: descriptor.fingerprint(),
            timeout: descriptor.overrides.timeout.unwrap_or(config.timeout),
            cache_ttl: config.cache.max_age,
            descriptor,
            key,
            target,
            full_url,
            headers,
            started_at: None,
            use_proxy: false,
            cache_key: None,
            cached: None,
            signal,
        }
    }

    pub fn method(&self) -> &Method {
        &self.descriptor.method
    }

    /// Path as given by the caller, before the base URL is applied.
    pub fn path(&self) -> &str {
        &self.descriptor.url
    }

    /// Resolved URL including the query string.
    pub fn full_url(&self) -> &str {
        &self.full_url
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    /// Key the request is registered under for cancellation.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn use_proxy(&self) -> bool {
        self.use_proxy
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.signal.reason()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    pub(crate) fn signal(&self) -> &CancelSignal {
        &self.signal
    }

    pub(crate) fn take_cached(&mut self) -> Option<Value> {
        self.cached.take()
    }
}

/// Hook into the request pipeline.
///
/// `on_request` runs before the transport call, `on_response` after a
/// successful one (including cache hits) and `on_error` once for every
/// terminal failure.
pub trait Interceptor: Send + Sync {
    fn on_request(&self, _ctx: &mut RequestContext) -> Result<()> {
        Ok(())
    }

    fn on_response(&self, _ctx: &RequestContext, _response: &mut Response) -> Result<()> {
        Ok(())
    }

    fn on_error(&self, _ctx: &RequestContext, _error: &ApiError) {}
}

struct Timing;

impl Interceptor for Timing {
    fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        ctx.started_at = Some(Instant::now());
        Ok(())
    }

    fn on_response(&self, ctx: &RequestContext, response: &mut Response) -> Result<()> {
        response.elapsed = ctx.started_at.map(|start| start.elapsed());
        Ok(())
    }
}

struct BearerAuth {
    tokens: Arc<dyn TokenStore>,
}

impl Interceptor for BearerAuth {
    fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        let Some(token) = self.tokens.token().filter(|token| !token.trim().is_empty()) else {
            return Ok(());
        };
        // tokens that are not valid header values are skipped
        if let Ok(mut value) = HeaderValue::from_str(&bearer_authorization(&token)) {
            value.set_sensitive(true);
            ctx.headers.insert(AUTHORIZATION, value);
        }
        Ok(())
    }
}

struct ProxyTagger {
    page_origin: Option<Url>,
}

impl Interceptor for ProxyTagger {
    fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        ctx.use_proxy = should_use_proxy(&ctx.target, self.page_origin.as_ref());
        Ok(())
    }
}

struct ResponseCache {
    cache: CacheStore,
    policy: CachePolicy,
    log: bool,
}

impl ResponseCache {
    fn applies_to(&self, ctx: &RequestContext) -> bool {
        let overrides = ctx.descriptor.overrides.cache;
        if ctx.descriptor.overrides.response_type != ResponseType::Json {
            return false;
        }
        match overrides.and_then(|cache| cache.enabled) {
            Some(enabled) => enabled,
            None => self.policy.enabled && !self.policy.is_excluded(ctx.path()),
        }
    }
}

impl Interceptor for ResponseCache {
    fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        if !self.applies_to(ctx) {
            return Ok(());
        }
        if let Some(max_age) = ctx.descriptor.overrides.cache.and_then(|cache| cache.max_age) {
            ctx.cache_ttl = max_age;
        }
        if let Some(hit) = self.cache.get(&ctx.fingerprint) {
            if self.log {
                tracing::debug!(key = %ctx.fingerprint, "api cache hit");
            }
            ctx.cached = Some(hit);
        }
        ctx.cache_key = Some(ctx.fingerprint.clone());
        Ok(())
    }

    fn on_response(&self, ctx: &RequestContext, response: &mut Response) -> Result<()> {
        let Some(key) = ctx.cache_key.as_deref() else {
            return Ok(());
        };
        if response.from_cache || ctx.is_cancelled() {
            return Ok(());
        }
        if let Payload::Json(value) = &response.payload {
            if !Envelope::is_failure(value) {
                self.cache.put(key, value.clone(), ctx.cache_ttl);
            }
        }
        Ok(())
    }
}

struct RequestLogger {
    report_errors: bool,
}

impl Interceptor for RequestLogger {
    fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        tracing::debug!(
            method = %ctx.method(),
            url = %ctx.full_url,
            proxied = ctx.use_proxy,
            cached = ctx.cached.is_some(),
            "api request"
        );
        Ok(())
    }

    fn on_response(&self, ctx: &RequestContext, response: &mut Response) -> Result<()> {
        if !response.from_cache {
            let elapsed_ms = response.elapsed.map_or(0, |elapsed| elapsed.as_millis());
            tracing::debug!(
                method = %ctx.method(),
                url = %ctx.full_url,
                status = response.status,
                elapsed_ms = %elapsed_ms,
                "api response"
            );
        }
        Ok(())
    }

    fn on_error(&self, ctx: &RequestContext, error: &ApiError) {
        if self.report_errors && !error.is_superseded() {
            tracing::error!(
                method = %ctx.method(),
                url = %ctx.full_url,
                kind = %error.kind(),
                status = ?error.status(),
                "api error: {}",
                error.message()
            );
        }
    }
}

/// The fixed built-in stages followed by user interceptors.
pub struct InterceptorChain {
    stages: Vec<Arc<dyn Interceptor>>,
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl InterceptorChain {
    pub(crate) fn new(
        config: &ClientConfig,
        tokens: Arc<dyn TokenStore>,
        cache: CacheStore,
        custom: Vec<Arc<dyn Interceptor>>,
    ) -> Self {
        let mut stages: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Timing),
            Arc::new(BearerAuth { tokens }),
            Arc::new(ProxyTagger {
                page_origin: config.page_origin.clone(),
            }),
            Arc::new(ResponseCache {
                cache,
                policy: config.cache.clone(),
                log: config.enable_log,
            }),
        ];
        if config.enable_log {
            stages.push(Arc::new(RequestLogger {
                report_errors: config.environment != Environment::Production,
            }));
        }
        stages.extend(custom);
        Self { stages }
    }

    pub(crate) fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        for stage in &self.stages {
            stage.on_request(ctx)?;
        }
        Ok(())
    }

    pub(crate) fn on_response(&self, ctx: &RequestContext, response: &mut Response) -> Result<()> {
        for stage in &self.stages {
            stage.on_response(ctx, response)?;
        }
        Ok(())
    }

    pub(crate) fn on_error(&self, ctx: &RequestContext, error: &ApiError) {
        for stage in &self.stages {
            stage.on_error(ctx, error);
        }
    }
}
