//! Per-key deduplication of in-progress async work.
//!
//! The first caller for a key spawns the work; later callers for the same key
//! await a clone of the same shared future. The map's shard lock is held only
//! while looking up or inserting the entry, never while the work runs, so
//! unrelated keys never wait on each other.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

type Flight<T> = Shared<BoxFuture<'static, Option<T>>>;

/// The spawned work panicked or was aborted before producing a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlightAborted;

pub struct SingleFlight<K, T>
where
    K: Eq + Hash,
{
    in_flight: Arc<DashMap<K, Flight<T>>>,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
        }
    }
}

/// Removes the key when the spawned work finishes, including by panic.
struct Landing<K: Eq + Hash, T> {
    in_flight: Arc<DashMap<K, Flight<T>>>,
    key: Option<K>,
}

impl<K: Eq + Hash, T> Drop for Landing<K, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.in_flight.remove(&key);
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the flight for `key`, starting it with `work` if none is running.
    ///
    /// The work runs on its own task: dropping the returned future stops this
    /// caller from waiting but never cancels the work for the other waiters.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<T, FlightAborted>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let landing = Landing {
                    in_flight: Arc::clone(&self.in_flight),
                    key: Some(key),
                };
                let fut = work();
                let handle = tokio::spawn(async move {
                    let _landing = landing;
                    fut.await
                });
                let flight = async move { handle.await.ok() }.boxed().shared();
                entry.insert(flight.clone());
                flight
            }
        };

        flight.await.ok_or(FlightAborted)
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_run() {
        let flights: Arc<SingleFlight<&'static str, usize>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flights = Arc::clone(&flights);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                flights
                    .run("key", move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        runs.fetch_add(1, Ordering::SeqCst) + 1
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(1));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight(&"key"));
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();
        let (a, b) = tokio::join!(
            flights.run(1, || async { 10 }),
            flights.run(2, || async { 20 })
        );
        assert_eq!(a, Ok(10));
        assert_eq!(b, Ok(20));
    }

    #[tokio::test]
    async fn test_new_flight_after_completion() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();
        assert_eq!(flights.run(1, || async { 1 }).await, Ok(1));
        assert_eq!(flights.run(1, || async { 2 }).await, Ok(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_waiter_does_not_cancel_work() {
        let flights: Arc<SingleFlight<u32, u32>> = Arc::new(SingleFlight::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let started = {
            let finished = Arc::clone(&finished);
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .run(7, move || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        42
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        started.abort();

        // A second waiter joins the same flight and still gets the result
        assert_eq!(flights.run(7, || async { 0 }).await, Ok(42));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    fn flights_should_panic() -> bool {
        true
    }

    #[tokio::test]
    async fn test_panicking_work_reports_aborted() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();
        let result = flights
            .run(1, || async {
                if flights_should_panic() {
                    panic!("boom");
                }
                1
            })
            .await;
        assert_eq!(result, Err(FlightAborted));
        assert!(!flights.is_in_flight(&1));
    }
}
