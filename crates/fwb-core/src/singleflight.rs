use std::{
    collections::HashMap,
    future::Future,
    sync::Mutex,
};

use futures_util::future::{BoxFuture, FutureExt, Shared};

type Inflight<T> = Mutex<HashMap<String, Shared<BoxFuture<'static, T>>>>;

/// Collapses concurrent calls for the same key into one execution.
///
/// The first caller for a key runs the work; callers arriving while it is
/// in flight await the same shared future and receive a clone of its output.
/// The entry is dropped once the work completes, so a later call runs again.
pub struct SingleFlight<T: Clone> {
    inflight: Inflight<T>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.get(key) {
                Some(existing) => {
                    tracing::debug!("joining in-flight work for {key}");
                    existing.clone()
                }
                None => {
                    let fut = work().boxed().shared();
                    inflight.insert(key.to_string(), fut.clone());
                    fut
                }
            }
        };

        let mut settle = Settle {
            inflight: &self.inflight,
            key,
            shared: shared.clone(),
            done: false,
        };
        let output = shared.await;
        settle.done = true;
        output
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Drops the map entry once the shared work has finished or panicked.
///
/// A caller cancelled mid-flight leaves the entry for the remaining waiters.
struct Settle<'a, T: Clone> {
    inflight: &'a Inflight<T>,
    key: &'a str,
    shared: Shared<BoxFuture<'static, T>>,
    done: bool,
}

impl<T: Clone> Drop for Settle<'_, T> {
    fn drop(&mut self) {
        if !self.done && !std::thread::panicking() {
            return;
        }
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if inflight
            .get(self.key)
            .is_some_and(|current| current.ptr_eq(&self.shared))
        {
            inflight.remove(self.key);
        }
    }
}
