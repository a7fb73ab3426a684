//! Collapses concurrent identical loads into a single execution.
//!
//! When many tasks miss the cache for the same key at the same time, each of them would
//! normally invoke the origin loader or fire a request towards the owning peer. For a popular
//! key this turns a single cache miss into a thundering herd. A [SingleFlight] therefore keeps
//! an index of the calls which are currently in flight: the first task to arrive for a key
//! becomes the leader and actually executes the load, everyone arriving while the call is still
//! running simply attaches to it and receives the very same result (or error).
//!
//! Once a call has completed, it is removed from the index. A task arriving afterwards starts a
//! fresh execution - especially, a failed call never poisons its key.
//!
//! # Examples
//! ```
//! # use ganymede::flight::SingleFlight;
//! # use std::sync::Arc;
//! # use std::sync::atomic::{AtomicUsize, Ordering};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let flight = Arc::new(SingleFlight::new());
//! let executions = Arc::new(AtomicUsize::new(0));
//!
//! let mut tasks = Vec::new();
//! for _ in 0..2 {
//!     let flight = flight.clone();
//!     let executions = executions.clone();
//!     tasks.push(tokio::spawn(async move {
//!         flight
//!             .execute("Tom", async move {
//!                 let _ = executions.fetch_add(1, Ordering::SeqCst);
//!                 tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!                 Ok("bar".to_owned())
//!             })
//!             .await
//!     }));
//! }
//!
//! for task in tasks {
//!     assert_eq!(task.await.unwrap().unwrap(), "bar");
//! }
//!
//! // Both callers observed the value, yet the task ran only once...
//! assert_eq!(executions.load(Ordering::SeqCst), 1);
//! # }
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

/// Represents one in-flight (or just completed) call.
///
/// The error is wrapped into an **Arc** so that the outcome is cloneable, which is required
/// to share one future among all attached callers.
type Call<T> = Shared<BoxFuture<'static, Result<T, Arc<anyhow::Error>>>>;

/// Maintains the calls which are currently in flight, indexed by their key.
///
/// The index itself is guarded by a mutex which is only held while looking up or registering a
/// call - never while the underlying task runs. The task itself executes outside of all locks
/// and may therefore block or suspend arbitrarily.
pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    calls: Mutex<HashMap<String, Call<T>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new instance without any calls in flight.
    pub fn new() -> Self {
        SingleFlight {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Executes the given task, unless a call for the given key is already in flight.
    ///
    /// In the latter case the task is dropped and the caller attaches to the in-flight call,
    /// receiving exactly the result the leading caller receives. Once the call has completed,
    /// it is removed from the index so that a later invocation for the same key starts over.
    ///
    /// Errors are shared among all attached callers but never kept beyond the lifetime of the
    /// call itself.
    pub async fn execute<F>(&self, key: &str, task: F) -> Result<T, Arc<anyhow::Error>>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            match calls.get(key) {
                Some(call) => call.clone(),
                None => {
                    let call = task.map(|outcome| outcome.map_err(Arc::new)).boxed().shared();
                    let _ = calls.insert(key.to_owned(), call.clone());
                    call
                }
            }
        };

        let outcome = call.clone().await;

        // Whoever observes the completion first removes the call from the index. The removal
        // is guarded by identity, so a fresh call which has been registered for the same key
        // in the meantime is never thrown out by a slow waiter.
        {
            let mut calls = self.calls.lock().unwrap();
            if calls.get(key).map(|current| current.ptr_eq(&call)) == Some(true) {
                let _ = calls.remove(key);
            }
        }

        outcome
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        SingleFlight::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::flight::SingleFlight;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    #[test]
    fn concurrent_calls_share_one_execution() {
        crate::testing::test_async(async {
            let flight = Arc::new(SingleFlight::new());
            let executions = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for _ in 0..8 {
                let flight = flight.clone();
                let executions = executions.clone();
                tasks.push(tokio::spawn(async move {
                    flight
                        .execute("Tom", async move {
                            let _ = executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(25)).await;
                            Ok("bar".to_owned())
                        })
                        .await
                }));
            }

            for task in tasks {
                assert_eq!(task.await.unwrap().unwrap(), "bar");
            }

            assert_eq!(executions.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn errors_are_shared_but_not_cached() {
        crate::testing::test_async(async {
            let flight = Arc::new(SingleFlight::<String>::new());
            let executions = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for _ in 0..4 {
                let flight = flight.clone();
                let executions = executions.clone();
                tasks.push(tokio::spawn(async move {
                    flight
                        .execute("Tom", async move {
                            let _ = executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(25)).await;
                            Err(anyhow::anyhow!("The origin is unreachable."))
                        })
                        .await
                }));
            }

            // All concurrent callers observe the very same error...
            for task in tasks {
                let outcome = task.await.unwrap();
                assert_eq!(
                    outcome.unwrap_err().to_string(),
                    "The origin is unreachable."
                );
            }
            assert_eq!(executions.load(Ordering::SeqCst), 1);

            // ...but the error is gone along with the call: a later invocation starts over and
            // may well succeed.
            let result = flight
                .execute("Tom", async move { Ok("fresh".to_owned()) })
                .await;
            assert_eq!(result.unwrap(), "fresh");
        });
    }

    #[test]
    fn sequential_calls_execute_independently() {
        crate::testing::test_async(async {
            let flight = SingleFlight::new();
            let executions = Arc::new(AtomicUsize::new(0));

            for _ in 0..3 {
                let executions = executions.clone();
                let result = flight
                    .execute("Tom", async move {
                        let _ = executions.fetch_add(1, Ordering::SeqCst);
                        Ok(42)
                    })
                    .await;
                assert_eq!(result.unwrap(), 42);
            }

            // Each call had completed before the next one arrived, therefore no sharing
            // took place...
            assert_eq!(executions.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        crate::testing::test_async(async {
            let flight = Arc::new(SingleFlight::new());
            let executions = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for key in ["Tom", "Jack", "Sam"] {
                let flight = flight.clone();
                let executions = executions.clone();
                tasks.push(tokio::spawn(async move {
                    flight
                        .execute(key, async move {
                            let _ = executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(key.to_owned())
                        })
                        .await
                }));
            }

            for task in tasks {
                let _ = task.await.unwrap().unwrap();
            }

            assert_eq!(executions.load(Ordering::SeqCst), 3);
        });
    }
}
