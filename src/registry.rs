use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Why an in-flight request was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// A newer request with the same key replaced this one.
    Superseded,
    /// The caller asked for cancellation.
    Explicit,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superseded => f.write_str("request superseded by a newer identical request"),
            Self::Explicit => f.write_str("request cancelled"),
        }
    }
}

/// Identifies one registration so a finished request only removes its own entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket(u64);

/// Receiving side of an in-flight entry.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelSignal {
    /// Returns the reason if cancellation has already been signalled.
    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the request is cancelled.
    ///
    /// Never resolves if the registry entry is dropped without cancelling.
    pub async fn cancelled(&mut self) -> CancelReason {
        let observed = self.rx.wait_for(Option::is_some).await.map(|r| *r).ok();
        match observed.flatten().or_else(|| self.reason()) {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

struct Entry {
    ticket: Ticket,
    tx: watch::Sender<Option<CancelReason>>,
}

/// Maps a request key to its cancelable in-flight operation.
///
/// At most one entry exists per key; registering a key again cancels the
/// previous holder.
#[derive(Clone, Default)]
pub struct InflightRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_ticket: Arc<AtomicU64>,
}

impl fmt::Debug for InflightRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightRegistry")
            .field("in_flight", &self.len())
            .finish()
    }
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key`, superseding any request already holding it.
    pub fn register(&self, key: &str) -> (Ticket, CancelSignal) {
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = watch::channel(None);

        let previous = self
            .entries
            .lock()
            .insert(key.to_owned(), Entry { ticket, tx });
        if let Some(previous) = previous {
            previous.tx.send_replace(Some(CancelReason::Superseded));
        }

        (ticket, CancelSignal { rx })
    }

    /// Removes the entry for `key` if it still belongs to `ticket`.
    pub fn release(&self, key: &str, ticket: Ticket) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.ticket == ticket => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Cancels the request registered under `key`.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.entries.lock().remove(key);
        match removed {
            Some(entry) => {
                entry.tx.send_replace(Some(CancelReason::Explicit));
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight request and returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.tx.send_replace(Some(CancelReason::Explicit));
        }
        drained.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{CancelReason, InflightRegistry};

    #[test]
    fn second_registration_supersedes_first() {
        let registry = InflightRegistry::new();
        let (first, first_signal) = registry.register("GET:/users:{}:{}");
        let (second, second_signal) = registry.register("GET:/users:{}:{}");

        assert_eq!(first_signal.reason(), Some(CancelReason::Superseded));
        assert!(!second_signal.is_cancelled());
        assert_eq!(registry.len(), 1);

        assert!(!registry.release("GET:/users:{}:{}", first));
        assert!(registry.contains("GET:/users:{}:{}"));
        assert!(registry.release("GET:/users:{}:{}", second));
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_by_key_and_cancel_all() {
        let registry = InflightRegistry::new();
        let (_, a) = registry.register("a");
        let (_, b) = registry.register("b");
        let (_, c) = registry.register("c");

        assert!(registry.cancel("a"));
        assert!(!registry.cancel("a"));
        assert_eq!(a.reason(), Some(CancelReason::Explicit));
        assert!(!b.is_cancelled());

        assert_eq!(registry.cancel_all(), 2);
        assert_eq!(b.reason(), Some(CancelReason::Explicit));
        assert_eq!(c.reason(), Some(CancelReason::Explicit));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancelled_future_wakes_waiter() {
        let registry = InflightRegistry::new();
        let (_, mut signal) = registry.register("key");

        let waiter = tokio::spawn(async move { signal.cancelled().await });
        tokio::task::yield_now().await;
        registry.cancel("key");

        assert_eq!(waiter.await.expect("waiter must join"), CancelReason::Explicit);
    }
}
