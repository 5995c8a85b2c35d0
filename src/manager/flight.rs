use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("in-flight operation was aborted")]
pub struct FlightAborted;

pub type Flight<T> = Shared<BoxFuture<'static, Result<T, FlightAborted>>>;

/// At most one operation per key at a time. Callers arriving while one runs get a handle to the
/// same result.
///
/// The work runs on its own task, so dropping every handle does not cancel it. The entry is
/// removed as soon as the work finishes, whatever its outcome: nothing is remembered between
/// flights and a failure never blocks the next attempt.
pub struct SingleFlight<K, T> {
    in_flight: Arc<Mutex<HashMap<K, Flight<T>>>>,
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

struct RemoveOnDrop<K: Eq + Hash, T> {
    in_flight: Arc<Mutex<HashMap<K, Flight<T>>>>,
    key: K,
}

impl<K: Eq + Hash, T> Drop for RemoveOnDrop<K, T> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
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

    pub fn join<F>(&self, key: K, work: F) -> Flight<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let flight = async move { receiver.await.map_err(|_| FlightAborted) }
            .boxed()
            .shared();
        {
            let mut in_flight = self.in_flight.lock();
            if let Some(running) = in_flight.get(&key) {
                return running.clone();
            }
            in_flight.insert(key.clone(), flight.clone());
        }
        let guard = RemoveOnDrop {
            in_flight: self.in_flight.clone(),
            key,
        };
        tokio::spawn(async move {
            let result = work.await;
            // Waiters must find the entry gone once they see the result
            drop(guard);
            let _ = sender.send(result);
        });
        flight
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
