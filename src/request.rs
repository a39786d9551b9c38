use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::retry::RetryPolicy;

/// Ordered query parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params(Vec<(String, Value)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter, keeping insertion order for the query string.
    pub fn push(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Serializes into a query string without the leading `?`.
    ///
    /// `null` values are skipped and arrays repeat their key.
    pub fn to_query_string(&self) -> String {
        let mut pairs = Vec::with_capacity(self.0.len());
        for (key, value) in &self.0 {
            match value {
                Value::Null => {}
                Value::Array(items) => {
                    for item in items {
                        pairs.push(encode_pair(key, item));
                    }
                }
                other => pairs.push(encode_pair(key, other)),
            }
        }
        pairs.join("&")
    }

    /// Canonical form: repeated keys collapse into one array, in order, so
    /// `tag=a&tag=b` and `tag=[a, b]` agree and never lose a value.
    fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.0 {
            match map.get_mut(key) {
                None => {
                    map.insert(key.clone(), value.clone());
                }
                Some(existing) => {
                    if !existing.is_array() {
                        *existing = Value::Array(vec![existing.take()]);
                    }
                    if let Value::Array(items) = existing {
                        match value {
                            Value::Array(more) => items.extend(more.iter().cloned()),
                            other => items.push(other.clone()),
                        }
                    }
                }
            }
        }
        Value::Object(map)
    }
}

fn encode_pair(key: &str, value: &Value) -> String {
    let text = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    format!(
        "{}={}",
        urlencoding::encode(key),
        urlencoding::encode(&text)
    )
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Params {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

/// One part of a multipart upload.
#[derive(Clone, Debug, PartialEq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime: Option<String>,
        content: Bytes,
    },
}

impl FormPart {
    pub fn name(&self) -> &str {
        match self {
            Self::Text { name, .. } | Self::File { name, .. } => name,
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Self::Text { value, .. } => value.len() as u64,
            Self::File { content, .. } => content.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Form-like upload body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FormBody {
    parts: Vec<FormPart>,
}

impl FormBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(FormPart::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(FormPart::File {
            name: name.into(),
            file_name: file_name.into(),
            mime: None,
            content: content.into(),
        });
        self
    }

    /// Sets the MIME type of the most recently added file part.
    pub fn mime(mut self, mime: impl Into<String>) -> Self {
        if let Some(FormPart::File { mime: slot, .. }) = self.parts.last_mut() {
            *slot = Some(mime.into());
        }
        self
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    /// Total payload size across all parts.
    pub fn total_len(&self) -> u64 {
        self.parts.iter().map(FormPart::len).sum()
    }

    fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .parts
            .iter()
            .map(|part| (part.name().to_owned(), Value::from(part.len())))
            .collect();
        Value::Object(map)
    }
}

/// Request payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Body {
    #[default]
    None,
    Json(Value),
    Form(FormBody),
}

impl Body {
    /// Serializes any `Serialize` value as a JSON body.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_value(value).map(Self::Json)
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<FormBody> for Body {
    fn from(form: FormBody) -> Self {
        Self::Form(form)
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Self::None
    }
}

/// Transfer progress reported to upload/download callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub loaded: u64,
    pub total: Option<u64>,
}

impl Progress {
    /// Completion percentage, rounded, when the total is known.
    pub fn percent(&self) -> Option<u8> {
        match self.total {
            Some(0) | None => None,
            Some(total) => {
                let percent = (self.loaded as f64 * 100.0 / total as f64).round();
                Some(percent.clamp(0.0, 100.0) as u8)
            }
        }
    }
}

/// Progress callback.
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// How the response body should be surfaced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseType {
    #[default]
    Json,
    Binary,
}

/// Per-request cache settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheOverride {
    /// Forces caching on or off regardless of the client policy.
    pub enabled: Option<bool>,
    /// TTL for the stored entry.
    pub max_age: Option<Duration>,
}

/// Per-request overrides of the client configuration.
#[derive(Clone, Default)]
pub struct RequestOverrides {
    /// Cancellation key used instead of the fingerprint.
    pub request_id: Option<String>,
    pub retry: Option<RetryPolicy>,
    pub cache: Option<CacheOverride>,
    pub timeout: Option<Duration>,
    pub response_type: ResponseType,
    pub progress: Option<ProgressFn>,
}

impl fmt::Debug for RequestOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOverrides")
            .field("request_id", &self.request_id)
            .field("retry", &self.retry)
            .field("cache", &self.cache)
            .field("timeout", &self.timeout)
            .field("response_type", &self.response_type)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl RequestOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn no_retry(self) -> Self {
        self.retry(RetryPolicy::disabled())
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache.get_or_insert_with(CacheOverride::default).enabled = Some(enabled);
        self
    }

    pub fn cache_max_age(mut self, max_age: Duration) -> Self {
        self.cache.get_or_insert_with(CacheOverride::default).max_age = Some(max_age);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// A single logical API request.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
    pub params: Params,
    pub body: Body,
    pub headers: HeaderMap,
    pub overrides: RequestOverrides,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Params::default(),
            body: Body::None,
            headers: HeaderMap::new(),
            overrides: RequestOverrides::default(),
        }
    }

    pub fn params(mut self, params: impl Into<Params>) -> Self {
        self.params = params.into();
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn overrides(mut self, overrides: RequestOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Deterministic identity: `METHOD:url:params:body` with object keys sorted.
    pub fn fingerprint(&self) -> String {
        let body = match &self.body {
            Body::None => Value::Object(Map::new()),
            Body::Json(value) => value.clone(),
            Body::Form(form) => form.to_json(),
        };
        format!(
            "{}:{}:{}:{}",
            self.method,
            self.url,
            canonical_json(&self.params.to_json()),
            canonical_json(&body)
        )
    }

    /// Key used by the in-flight registry.
    pub fn request_key(&self) -> String {
        self.overrides
            .request_id
            .clone()
            .unwrap_or_else(|| self.fingerprint())
    }
}

/// Serializes JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Joins a request path onto the base URL unless it is already absolute.
pub fn resolve_url(base: &str, path: &str) -> String {
    if url::Url::parse(path).is_ok() || base.is_empty() {
        return path.to_owned();
    }
    if path.is_empty() {
        return base.to_owned();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Appends a query string to `url`.
pub fn append_query(url: &str, params: &Params) -> String {
    let query = params.to_query_string();
    if query.is_empty() {
        return url.to_owned();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{query}")
}

#[cfg(test)]
mod tests {
    use super::{append_query, resolve_url, Body, FormBody, Params, Progress, RequestDescriptor};
    use reqwest::Method;
    use serde_json::json;

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = RequestDescriptor::new(Method::POST, "/users")
            .params([("page", json!(1)), ("limit", json!(10))])
            .body(json!({"name": "kit", "meta": {"b": 2, "a": 1}}));
        let b = RequestDescriptor::new(Method::POST, "/users")
            .params([("limit", json!(10)), ("page", json!(1))])
            .body(json!({"meta": {"a": 1, "b": 2}, "name": "kit"}));

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(
            a.fingerprint(),
            r#"POST:/users:{"limit":10,"page":1}:{"meta":{"a":1,"b":2},"name":"kit"}"#
        );
    }

    #[test]
    fn fingerprint_keeps_repeated_keys() {
        let both = RequestDescriptor::new(Method::GET, "/items")
            .params(Params::new().push("tag", "a").push("tag", "b"));
        let last = RequestDescriptor::new(Method::GET, "/items")
            .params(Params::new().push("tag", "b"));
        let listed = RequestDescriptor::new(Method::GET, "/items")
            .params([("tag", json!(["a", "b"]))]);

        assert_eq!(both.fingerprint(), r#"GET:/items:{"tag":["a","b"]}:{}"#);
        assert_ne!(both.fingerprint(), last.fingerprint());
        assert_eq!(both.fingerprint(), listed.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_method_and_body() {
        let get = RequestDescriptor::new(Method::GET, "/users");
        let delete = RequestDescriptor::new(Method::DELETE, "/users");
        let with_body = RequestDescriptor::new(Method::GET, "/users").body(json!({"x": 1}));

        assert_eq!(get.fingerprint(), "GET:/users:{}:{}");
        assert_ne!(get.fingerprint(), delete.fingerprint());
        assert_ne!(get.fingerprint(), with_body.fingerprint());
    }

    #[test]
    fn request_id_overrides_fingerprint_key() {
        let descriptor = RequestDescriptor::new(Method::GET, "/users")
            .overrides(super::RequestOverrides::new().request_id("get-users"));
        assert_eq!(descriptor.request_key(), "get-users");
    }

    #[test]
    fn query_string_encodes_and_skips_null() {
        let params = Params::new()
            .push("q", "a b&c")
            .push("page", 2)
            .push("skip", serde_json::Value::Null)
            .push("tag", json!(["x", "y"]));
        assert_eq!(params.to_query_string(), "q=a%20b%26c&page=2&tag=x&tag=y");
        assert_eq!(
            append_query("/users?active=true", &params),
            "/users?active=true&q=a%20b%26c&page=2&tag=x&tag=y"
        );
        assert_eq!(append_query("/users", &Params::new()), "/users");
    }

    #[test]
    fn resolve_joins_relative_paths_only() {
        assert_eq!(resolve_url("/api", "/users"), "/api/users");
        assert_eq!(resolve_url("https://api.test/", "users"), "https://api.test/users");
        assert_eq!(
            resolve_url("https://api.test", "https://other.test/x"),
            "https://other.test/x"
        );
        assert_eq!(resolve_url("", "/users"), "/users");
    }

    #[test]
    fn form_body_reports_size() {
        let form = FormBody::new()
            .text("title", "report")
            .file("file", "a.txt", b"hello".to_vec())
            .mime("text/plain");
        assert_eq!(form.total_len(), 11);
        assert!(matches!(Body::from(form), Body::Form(_)));
    }

    #[test]
    fn progress_percent_rounds() {
        let progress = Progress {
            loaded: 1,
            total: Some(3),
        };
        assert_eq!(progress.percent(), Some(33));
        assert_eq!(
            Progress {
                loaded: 5,
                total: None
            }
            .percent(),
            None
        );
    }
}
