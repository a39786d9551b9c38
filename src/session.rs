use std::fmt;

use parking_lot::RwLock;

use crate::error::ApiError;

/// Persisted session credential used for bearer authentication.
pub trait TokenStore: Send + Sync {
    fn token(&self) -> Option<String>;
    fn set_token(&self, token: Option<String>);
}

/// In-process token store.
#[derive(Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }
}

impl fmt::Debug for MemoryTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.token.read().is_some() {
            "<redacted>"
        } else {
            "<none>"
        };
        f.debug_struct("MemoryTokenStore")
            .field("token", &state)
            .finish()
    }
}

impl TokenStore for MemoryTokenStore {
    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.write() = token.filter(|value| !value.trim().is_empty());
    }
}

/// Receives every terminal request failure that should reach the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, error: &ApiError);
}

impl<F> Notifier for F
where
    F: Fn(&ApiError) + Send + Sync,
{
    fn notify(&self, error: &ApiError) {
        self(error)
    }
}

/// Notifier that drops every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _error: &ApiError) {}
}

/// Formats a token as an `Authorization` header value.
///
/// If the token is missing the `Bearer ` prefix, it is added.
pub(crate) fn bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::{bearer_authorization, MemoryTokenStore, Notifier, TokenStore};
    use crate::error::{ApiError, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn bearer_adds_prefix_when_missing() {
        assert_eq!(bearer_authorization("abc123"), "Bearer abc123");
    }

    #[test]
    fn bearer_keeps_existing_prefix() {
        assert_eq!(bearer_authorization("bEaReR abc123"), "bEaReR abc123");
    }

    #[test]
    fn memory_store_round_trip_and_blank_clears() {
        let store = MemoryTokenStore::new();
        assert_eq!(store.token(), None);
        store.set_token(Some("t-1".to_owned()));
        assert_eq!(store.token().as_deref(), Some("t-1"));
        store.set_token(Some("  ".to_owned()));
        assert_eq!(store.token(), None);
    }

    #[test]
    fn debug_redacts_token() {
        let store = MemoryTokenStore::with_token("secret-token");
        let debug = format!("{store:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn closures_are_notifiers() {
        let calls = AtomicUsize::new(0);
        let notifier = |_: &ApiError| {
            calls.fetch_add(1, Ordering::SeqCst);
        };
        notifier.notify(&ApiError::new(ErrorKind::Network, "offline"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
