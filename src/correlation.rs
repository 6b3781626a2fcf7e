//! Correlation table: request id to pending result slot.
//!
//! The gateway answers asynchronously, tagged with the numeric id the
//! request was sent with. Callers register an entry, send the request with
//! the entry's id, then [`Pending::wait`] on it. The event router resolves
//! entries as replies arrive.
//!
//! An entry stays in the table until its [`Pending`] handle is dropped, so
//! an id is never handed out again while someone may still be waiting on
//! it. Resolving an id that is unknown or already fulfilled is a logged
//! no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::{ProxyError, Result};

/// What a request expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Exactly one value; the first `resolve` completes the entry.
    Scalar,
    /// One message carrying the whole list.
    List,
    /// Values accumulate until an explicit end marker.
    Stream,
}

type Slot<T> = oneshot::Sender<Result<Vec<T>>>;

struct Entry<T> {
    shape: Shape,
    items: Vec<T>,
    /// `None` once fulfilled.
    tx: Option<Slot<T>>,
    created_at: Instant,
}

struct Inner<T> {
    entries: HashMap<i32, Entry<T>>,
    next_id: i32,
}

pub struct CorrelationTable<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for CorrelationTable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Table whose first allocated id is `first_id`.
    pub fn starting_at(first_id: i32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                next_id: first_id.max(1),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a fresh id and an empty slot.
    pub fn register(&self, shape: Shape) -> Pending<T> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();

        let mut id = inner.next_id;
        while inner.entries.contains_key(&id) {
            id = next_after(id);
        }
        inner.next_id = next_after(id);
        inner.entries.insert(
            id,
            Entry {
                shape,
                items: Vec::new(),
                tx: Some(tx),
                created_at: Instant::now(),
            },
        );
        drop(inner);

        tracing::trace!(id, ?shape, "registered pending request");
        Pending {
            id,
            rx,
            table: self.clone(),
        }
    }

    /// Deliver one value. Completes `Scalar` and `List` entries; appends to
    /// `Stream` entries.
    pub fn resolve(&self, id: i32, value: T) {
        let mut inner = self.lock();
        let Some(entry) = live_entry(&mut inner, id) else {
            tracing::debug!(id, "dropping value for unknown or fulfilled request");
            return;
        };
        entry.items.push(value);
        if entry.shape != Shape::Stream {
            fulfill(entry, None);
        }
    }

    /// Deliver a batch of values and complete the entry.
    pub fn resolve_list(&self, id: i32, values: Vec<T>) {
        let mut inner = self.lock();
        let Some(entry) = live_entry(&mut inner, id) else {
            tracing::debug!(id, "dropping list for unknown or fulfilled request");
            return;
        };
        entry.items.extend(values);
        fulfill(entry, None);
    }

    /// Complete the entry with whatever has accumulated so far.
    pub fn complete(&self, id: i32) {
        let mut inner = self.lock();
        match live_entry(&mut inner, id) {
            Some(entry) => fulfill(entry, None),
            None => tracing::debug!(id, "end marker for unknown or fulfilled request"),
        }
    }

    pub fn fail(&self, id: i32, err: ProxyError) {
        let mut inner = self.lock();
        match live_entry(&mut inner, id) {
            Some(entry) => fulfill(entry, Some(err)),
            None => tracing::debug!(id, %err, "failure for unknown or fulfilled request"),
        }
    }

    /// Fail every outstanding entry. Returns how many were failed.
    pub fn fail_all(&self, err: ProxyError) -> usize {
        let mut inner = self.lock();
        let mut failed = 0;
        for entry in inner.entries.values_mut().filter(|e| e.tx.is_some()) {
            fulfill(entry, Some(err.clone()));
            failed += 1;
        }
        failed
    }

    /// True while `id` is registered and not yet fulfilled.
    pub fn is_pending(&self, id: i32) -> bool {
        self.lock()
            .entries
            .get(&id)
            .is_some_and(|e| e.tx.is_some())
    }

    /// Ids of every entry still waiting for data.
    pub fn pending_ids(&self) -> Vec<i32> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, e)| e.tx.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, id: i32) {
        if let Some(entry) = self.lock().entries.remove(&id) {
            tracing::trace!(
                id,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                fulfilled = entry.tx.is_none(),
                "evicted pending request"
            );
        }
    }
}

fn next_after(id: i32) -> i32 {
    if id == i32::MAX {
        1
    } else {
        id + 1
    }
}

fn live_entry<T>(inner: &mut Inner<T>, id: i32) -> Option<&mut Entry<T>> {
    inner.entries.get_mut(&id).filter(|e| e.tx.is_some())
}

fn fulfill<T>(entry: &mut Entry<T>, err: Option<ProxyError>) {
    let Some(tx) = entry.tx.take() else {
        return;
    };
    let outcome = match err {
        Some(err) => Err(err),
        None => Ok(std::mem::take(&mut entry.items)),
    };
    // The waiter may already have given up.
    let _ = tx.send(outcome);
}

// ============================================================================
// Pending
// ============================================================================

/// Handle to a registered request. Dropping it evicts the entry.
pub struct Pending<T> {
    id: i32,
    rx: oneshot::Receiver<Result<Vec<T>>>,
    table: CorrelationTable<T>,
}

impl<T> Pending<T> {
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Wait for the entry to be fulfilled, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Vec<T>> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProxyError::ConnectionLost),
            Err(_) => {
                tracing::debug!(id = self.id, ?timeout, "pending request timed out");
                Err(ProxyError::Timeout(timeout))
            }
        }
    }

    /// Like [`Pending::wait`] for `Scalar` entries: the single value.
    pub async fn wait_one(self, timeout: Duration) -> Result<T> {
        let id = self.id;
        self.wait(timeout)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProxyError::Protocol(format!("request {id} completed without a value")))
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        self.table.evict(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn scalar_resolves_with_first_value() {
        let table = CorrelationTable::new();
        let pending = table.register(Shape::Scalar);
        table.resolve(pending.id(), 42);
        table.resolve(pending.id(), 43);
        assert_eq!(pending.wait(WAIT).await.unwrap(), vec![42]);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn stream_accumulates_until_complete() {
        let table = CorrelationTable::new();
        let pending = table.register(Shape::Stream);
        let id = pending.id();
        table.resolve(id, "a");
        table.resolve(id, "b");
        assert!(table.is_pending(id));
        table.complete(id);
        assert!(!table.is_pending(id));
        assert_eq!(pending.wait(WAIT).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn ids_are_unique_while_outstanding() {
        let table = CorrelationTable::<i32>::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                (0..64).map(|_| table.register(Shape::Scalar)).collect::<Vec<_>>()
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let ids: HashSet<i32> = all.iter().map(Pending::id).collect();
        assert_eq!(ids.len(), all.len());
        assert_eq!(table.len(), all.len());
    }

    #[test]
    fn wrapped_ids_skip_live_entries() {
        let table = CorrelationTable::<i32>::starting_at(i32::MAX);
        let a = table.register(Shape::Scalar);
        assert_eq!(a.id(), i32::MAX);
        let b = table.register(Shape::Scalar);
        assert_eq!(b.id(), 1);
        let c = table.register(Shape::Scalar);
        assert_eq!(c.id(), 2);

        // Next candidate is 3; force wrap onto live ids.
        let table = CorrelationTable::<i32>::starting_at(1);
        let first = table.register(Shape::Scalar);
        table.lock().next_id = first.id();
        let second = table.register(Shape::Scalar);
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn timeout_evicts_and_late_resolve_is_noop() {
        let table = CorrelationTable::new();
        let pending = table.register(Shape::Scalar);
        let id = pending.id();
        let err = pending.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(_)));
        assert!(table.is_empty());
        table.resolve(id, 1);
        table.complete(id);
        table.fail(id, ProxyError::ConnectionLost);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn abandoned_wait_evicts_and_late_values_are_dropped() {
        let table = CorrelationTable::<i32>::new();
        let pending = table.register(Shape::Stream);
        let id = pending.id();
        table.resolve(id, 1);

        let waiter = tokio::spawn(pending.wait(Duration::from_secs(60)));
        tokio::task::yield_now().await;
        assert!(table.is_pending(id));
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert!(table.is_empty());

        table.resolve(id, 2);
        table.complete(id);
        assert!(!table.is_pending(id));
        assert!(table.is_empty());

        // Later registrations are unaffected.
        let fresh = table.register(Shape::Scalar);
        table.resolve(fresh.id(), 3);
        assert_eq!(fresh.wait(WAIT).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn fail_all_fails_each_outstanding_entry_once() {
        let table = CorrelationTable::<u8>::new();
        let done = table.register(Shape::Scalar);
        table.resolve(done.id(), 1);
        let waiting: Vec<_> = (0..5).map(|_| table.register(Shape::Stream)).collect();

        assert_eq!(table.fail_all(ProxyError::ConnectionLost), 5);
        assert_eq!(table.fail_all(ProxyError::ConnectionLost), 0);

        for p in waiting {
            assert!(matches!(p.wait(WAIT).await, Err(ProxyError::ConnectionLost)));
        }
        assert_eq!(done.wait(WAIT).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn dropped_table_reports_connection_lost() {
        let table = CorrelationTable::<u8>::new();
        let pending = table.register(Shape::Scalar);
        // Removing the entry drops the sender without sending.
        table.lock().entries.clear();
        assert!(matches!(pending.wait(WAIT).await, Err(ProxyError::ConnectionLost)));
    }
}
