//! Duplicate suppression for concurrent async work
//!
//! [`SingleFlight`] runs at most one operation per key at a time. The first
//! caller for a key (the leader) spawns the work onto the runtime; every
//! caller that arrives before it finishes awaits the same shared result.
//!
//! Work runs on its own task, so a caller being cancelled never aborts the
//! flight: followers still receive the result and side effects inside the
//! work (cache writes) still happen.

use std::{collections::HashMap, future::Future, hash::Hash, sync::Arc};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use thiserror::Error;

type Flight<V> = Shared<BoxFuture<'static, Result<V, FlightError>>>;
type FlightMap<K, V> = Arc<Mutex<HashMap<K, Flight<V>>>>;

/// The spawned work did not produce a value
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("in-flight task failed: {0}")]
pub struct FlightError(String);

/// Coalesces concurrent work by key
pub struct SingleFlight<K, V> {
    flights: FlightMap<K, V>,
}

impl<K, V> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            flights: Arc::default(),
        }
    }
}

/// Removes the flight from the map when the spawned task ends, panics included
struct FlightGuard<K: Eq + Hash, V> {
    flights: FlightMap<K, V>,
    key: Option<K>,
}

impl<K: Eq + Hash, V> Drop for FlightGuard<K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.flights.lock().remove(&key);
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty group
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the flight already running for it.
    ///
    /// `work` is only invoked by the leader. Returns the value and whether
    /// this caller was the leader. Must be called inside a Tokio runtime.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<(V, bool), FlightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (flight, leader) = {
            let mut flights = self.flights.lock();
            if let Some(existing) = flights.get(&key) {
                (existing.clone(), false)
            } else {
                // The guard can only take the lock after this insert completes
                let guard = FlightGuard {
                    flights: Arc::clone(&self.flights),
                    key: Some(key.clone()),
                };
                let fut = work();
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    fut.await
                });
                let flight = async move { handle.await.map_err(|e| FlightError(e.to_string())) }
                    .boxed()
                    .shared();
                flights.insert(key, flight.clone());
                (flight, true)
            }
        };

        flight.await.map(|value| (value, leader))
    }

    /// Number of flights currently running
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_calls_share_one_execution() {
        let group: SingleFlight<String, usize> = SingleFlight::new();
        let executions = Arc::new(AtomicUsize::new(0));

        let calls = (0..10).map(|_| {
            let group = group.clone();
            let executions = Arc::clone(&executions);
            async move {
                group
                    .run("key".to_string(), move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }
        });

        let results = futures::future::join_all(calls).await;
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap().0 == 42));
        assert_eq!(results.iter().filter(|r| r.as_ref().unwrap().1).count(), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_run_independently() {
        let group: SingleFlight<u32, u32> = SingleFlight::new();
        let (a, b) = tokio::join!(
            group.run(1, || async { 10 }),
            group.run(2, || async { 20 })
        );
        assert_eq!(a.unwrap(), (10, true));
        assert_eq!(b.unwrap(), (20, true));
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let group: SingleFlight<&'static str, usize> = SingleFlight::new();
        let executions = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let executions = Arc::clone(&executions);
            group
                .run("key", move || async move { executions.fetch_add(1, Ordering::SeqCst) })
                .await
                .unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_abort_flight() {
        let group: SingleFlight<&'static str, usize> = SingleFlight::new();
        let completed = Arc::new(AtomicUsize::new(0));

        let leader = {
            let group = group.clone();
            let completed = Arc::clone(&completed);
            tokio::spawn(async move {
                group
                    .run("key", move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        7
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let follower = group.run("key", || async { 0 }).await.unwrap();
        assert_eq!(follower, (7, false));
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    fn group_should_fail() -> bool {
        true
    }

    #[tokio::test]
    async fn test_panicking_work_reports_error_and_clears_key() {
        let group: SingleFlight<&'static str, usize> = SingleFlight::new();
        let result = group
            .run("key", || async {
                if group_should_fail() {
                    panic!("boom");
                }
                0
            })
            .await;
        assert!(result.is_err());
        assert_eq!(group.in_flight(), 0);

        let retry = group.run("key", || async { 1 }).await.unwrap();
        assert_eq!(retry, (1, true));
    }
}
