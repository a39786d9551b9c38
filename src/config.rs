use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use url::Url;

use crate::error::ConfigError;
use crate::proxy::DEFAULT_RELAYS;
use crate::retry::RetryPolicy;

/// Deployment stage the client runs in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(ConfigError::InvalidValue {
                name: "PORTAL_API_ENV",
                value: value.to_owned(),
            }),
        }
    }
}

/// Response cache settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    pub enabled: bool,
    /// Default TTL of a cached response.
    pub max_age: Duration,
    /// Path prefixes that are never cached.
    pub exclude: Vec<String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age: Duration::from_secs(5 * 60),
            exclude: [
                "/auth/login",
                "/auth/logout",
                "/auth/register",
                "/users",
                "/api/users",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        }
    }
}

impl CachePolicy {
    pub fn enabled(max_age: Duration) -> Self {
        Self {
            enabled: true,
            max_age,
            ..Self::default()
        }
    }

    pub fn with_exclude<I, S>(mut self, exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = exclude.into_iter().map(Into::into).collect();
        self
    }

    /// Matches whole path segments: `/users` excludes `/users/7` but not `/usersettings`.
    pub fn is_excluded(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        self.exclude.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            if prefix.is_empty() {
                return true;
            }
            match path.strip_prefix(prefix) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            }
        })
    }
}

/// Client-wide settings, fixed once the client is built.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Prefix for relative request paths.
    pub base_url: String,
    pub timeout: Duration,
    /// Headers sent with every request.
    pub headers: HeaderMap,
    pub retry: RetryPolicy,
    pub cache: CachePolicy,
    /// Relays tried in order for cross-origin requests.
    pub proxy_relays: Vec<String>,
    /// Origin of the hosting page; relative URLs resolve against it and
    /// requests to other hosts go through the relays.
    pub page_origin: Option<Url>,
    pub environment: Environment,
    pub enable_log: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        Self {
            base_url: "/api".to_owned(),
            timeout: Duration::from_millis(30_000),
            headers,
            retry: RetryPolicy::default(),
            cache: CachePolicy::default(),
            proxy_relays: DEFAULT_RELAYS.iter().map(|relay| relay.to_string()).collect(),
            page_origin: None,
            environment: Environment::Development,
            enable_log: true,
        }
    }
}

impl ClientConfig {
    /// Defaults for `environment`.
    ///
    /// Development talks to the relative `/api` prefix served next to the
    /// page; the other stages need an absolute `base_url`.
    pub fn for_environment(environment: Environment, base_url: impl Into<String>) -> Self {
        let base_url = match environment {
            Environment::Development => "/api".to_owned(),
            Environment::Test | Environment::Production => base_url.into(),
        };
        Self {
            base_url,
            environment,
            ..Self::default()
        }
    }

    /// Builds a configuration from environment variables.
    ///
    /// Reads (all optional):
    /// - `PORTAL_API_ENV`: `development`, `test` or `production`
    /// - `PORTAL_API_BASE_URL`
    /// - `PORTAL_API_TIMEOUT_MS`
    /// - `PORTAL_API_LOG`: `true/false/1/0`
    /// - `PORTAL_API_PAGE_ORIGIN`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let environment = match read("PORTAL_API_ENV") {
            Some(value) => value.parse()?,
            None => Environment::default(),
        };
        let mut config = Self {
            environment,
            ..Self::default()
        };

        if let Some(base_url) = read("PORTAL_API_BASE_URL") {
            config.base_url = base_url.trim().to_owned();
        }
        if let Some(timeout) = read("PORTAL_API_TIMEOUT_MS") {
            let millis = timeout
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "PORTAL_API_TIMEOUT_MS",
                    value: timeout.clone(),
                })?;
            config.timeout = Duration::from_millis(millis);
        }
        if let Some(log) = read("PORTAL_API_LOG") {
            config.enable_log = match log.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "PORTAL_API_LOG",
                        value: log,
                    })
                }
            };
        }
        if let Some(origin) = read("PORTAL_API_PAGE_ORIGIN") {
            config = config.with_page_origin(&origin)?;
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds or replaces a default header.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ConfigError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConfigError::InvalidHeader(name.to_owned()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ConfigError::InvalidHeader(name.as_str().to_owned()))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_proxy_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxy_relays = relays.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_page_origin(mut self, origin: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(origin).map_err(|source| ConfigError::InvalidUrl {
            value: origin.to_owned(),
            source,
        })?;
        self.page_origin = Some(parsed);
        Ok(self)
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_logging(mut self, enable_log: bool) -> Self {
        self.enable_log = enable_log;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{CachePolicy, ClientConfig, Environment};
    use crate::error::ConfigError;
    use std::collections::HashMap;
    use std::time::Duration;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(30_000));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(2_000));
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.max_age, Duration::from_secs(300));
        assert_eq!(config.proxy_relays.len(), 3);
        assert_eq!(
            config.headers.get("content-type").map(|v| v.as_bytes()),
            Some(&b"application/json"[..])
        );
    }

    #[test]
    fn exclusion_matches_whole_segments() {
        let policy = CachePolicy::enabled(Duration::from_secs(1)).with_exclude(["/users", "/auth/"]);
        assert!(policy.is_excluded("/users"));
        assert!(policy.is_excluded("/users/7"));
        assert!(policy.is_excluded("/users?page=1"));
        assert!(policy.is_excluded("/auth/login"));
        assert!(!policy.is_excluded("/usersettings"));
        assert!(!policy.is_excluded("/products"));
    }

    #[test]
    fn from_lookup_reads_all_variables() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("PORTAL_API_ENV", "production"),
            ("PORTAL_API_BASE_URL", "https://api.example.com/api"),
            ("PORTAL_API_TIMEOUT_MS", "5000"),
            ("PORTAL_API_LOG", "off"),
            ("PORTAL_API_PAGE_ORIGIN", "https://admin.example.com"),
        ]))
        .expect("config must parse");

        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.base_url, "https://api.example.com/api");
        assert_eq!(config.timeout, Duration::from_millis(5_000));
        assert!(!config.enable_log);
        assert_eq!(
            config.page_origin.as_ref().and_then(|url| url.host_str()),
            Some("admin.example.com")
        );
    }

    #[test]
    fn from_lookup_rejects_bad_values() {
        let err = ClientConfig::from_lookup(lookup(&[("PORTAL_API_TIMEOUT_MS", "soon")]))
            .expect_err("timeout must be numeric");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "PORTAL_API_TIMEOUT_MS",
                ..
            }
        ));

        let err = ClientConfig::from_lookup(lookup(&[("PORTAL_API_ENV", "staging")]))
            .expect_err("unknown environment");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn development_ignores_absolute_base() {
        let dev = ClientConfig::for_environment(Environment::Development, "https://x.test");
        let prod = ClientConfig::for_environment(Environment::Production, "https://x.test/api");
        assert_eq!(dev.base_url, "/api");
        assert_eq!(prod.base_url, "https://x.test/api");
    }

    #[test]
    fn invalid_header_is_rejected() {
        assert!(ClientConfig::default().with_header("bad header", "x").is_err());
        let config = ClientConfig::default()
            .with_header("X-Custom-Header", "CustomValue")
            .expect("valid header");
        assert!(config.headers.contains_key("x-custom-header"));
    }
}
