use url::Url;

use crate::error::Failure;
use crate::transport::{Transport, TransportRequest, TransportResponse};

/// Public relays used when a cross-origin call has to be proxied.
pub const DEFAULT_RELAYS: [&str; 3] = [
    "https://cors-anywhere.herokuapp.com/",
    "https://api.allorigins.win/raw?url=",
    "https://corsproxy.io/?",
];

/// Whether requests to `target` must go through a relay.
///
/// Relative paths and same-host targets never do; unparsable URLs or an
/// unknown page origin fall back to a direct call.
pub fn should_use_proxy(target: &str, page_origin: Option<&Url>) -> bool {
    if target.starts_with('/') {
        return false;
    }
    let (Some(origin), Ok(target)) = (page_origin, Url::parse(target)) else {
        return false;
    };
    match (target.host_str(), origin.host_str()) {
        (Some(target_host), Some(origin_host)) => !target_host.eq_ignore_ascii_case(origin_host),
        _ => false,
    }
}

/// Ordered list of relay endpoints tried one after another.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyFallback {
    relays: Vec<String>,
    log: bool,
}

impl Default for ProxyFallback {
    fn default() -> Self {
        Self::new(DEFAULT_RELAYS.iter().map(|relay| relay.to_string()))
    }
}

impl ProxyFallback {
    pub fn new<I, S>(relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            relays: relays.into_iter().map(Into::into).collect(),
            log: true,
        }
    }

    pub(crate) fn with_logging(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// The relay URL carrying `target`.
    pub fn relay_url(relay: &str, target: &str) -> String {
        format!("{relay}{}", urlencoding::encode(target))
    }

    /// Sends `request` through the relays starting at `start`.
    ///
    /// Each relay gets the full request timeout. A non-2xx status or a
    /// transport error moves on to the next relay; once every relay has
    /// failed the last error is reported as a network failure.
    pub async fn fetch(
        &self,
        transport: &dyn Transport,
        request: &TransportRequest,
        start: usize,
    ) -> Result<TransportResponse, Failure> {
        let mut last_error = String::from("no proxy relays configured");

        for relay in self.relays.iter().skip(start) {
            let relayed = request.with_url(Self::relay_url(relay, &request.url));
            let outcome = tokio::time::timeout(request.timeout, transport.send(relayed))
                .await
                .unwrap_or_else(|_| {
                    Err(Failure::timeout(format!(
                        "timeout of {}ms exceeded",
                        request.timeout.as_millis()
                    )))
                });
            let message = match outcome {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => format!("HTTP error! status: {}", response.status),
                Err(Failure::Cancelled(reason)) => return Err(Failure::Cancelled(reason)),
                Err(failure) => failure.message(),
            };
            if self.log {
                tracing::warn!(relay = %relay, error = %message, "proxy relay failed, trying next");
            }
            last_error = message;
        }

        Err(Failure::network(format!("all proxies failed: {last_error}")))
    }
}
