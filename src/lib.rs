//! `portal-http` is the async API client behind an admin portal front-end.
//!
//! Every call made through [`PortalClient`] runs the same pipeline:
//! - identical in-flight requests are de-duplicated; the newer one wins
//! - safe reads can be served from a TTL cache
//! - transport failures are retried with exponential backoff
//! - cross-origin calls fall back to CORS relays
//! - every failure is normalized into an [`ApiError`]
//!
//! Payloads wrapped in the `{code, message, data}` envelope are unwrapped
//! before they reach the caller.

mod cache;
mod client;
mod config;
mod error;
mod interceptor;
mod proxy;
mod registry;
mod request;
mod response;
mod retry;
mod services;
mod session;
mod transport;

pub use cache::CacheStore;
pub use client::{PortalClient, PortalClientBuilder};
pub use config::{CachePolicy, ClientConfig, Environment};
pub use error::{ApiError, ConfigError, ErrorKind, Failure};
pub use interceptor::{Interceptor, RequestContext};
pub use proxy::{should_use_proxy, ProxyFallback, DEFAULT_RELAYS};
pub use registry::{CancelReason, CancelSignal, InflightRegistry, Ticket};
pub use request::{
    canonical_json, Body, CacheOverride, FormBody, FormPart, Params, Progress, ProgressFn,
    RequestDescriptor, RequestOverrides, ResponseType,
};
pub use response::{Envelope, Payload, Response};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use services::{ProductService, UserService};
pub use session::{MemoryTokenStore, NoopNotifier, Notifier, TokenStore};
pub use transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse};

pub type Result<T> = std::result::Result<T, ApiError>;
