//! Request coalescing for the bootstrap critical section.
//!
//! The first caller starts the work; callers arriving while it is in flight
//! await the same shared future and observe the identical outcome. The slot is
//! cleared once the flight completes, so the next call starts a new one.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

struct Flight<T: Clone> {
    id: u64,
    future: Shared<BoxFuture<'static, T>>,
}

/// Single-flight guard producing values of type `T`.
pub struct SingleFlight<T: Clone> {
    slot: Mutex<Option<Flight<T>>>,
    next_id: AtomicU64,
    started: AtomicU64,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
            started: AtomicU64::new(0),
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

    /// Run `make()` unless a flight is already in progress, in which case
    /// attach to it. `make` is only invoked by the caller that starts a flight.
    pub async fn run<F, Fut>(&self, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (id, future) = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(flight) => (flight.id, flight.future.clone()),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    self.started.fetch_add(1, Ordering::Relaxed);
                    let future = make().boxed().shared();
                    *slot = Some(Flight {
                        id,
                        future: future.clone(),
                    });
                    (id, future)
                }
            }
        };

        self.finish(id, future).await
    }

    /// Wait for any flight in progress, then start a new one running
    /// `make()`. Callers arriving afterwards attach to this flight.
    pub async fn run_after<F, Fut>(&self, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        // Not polled until installed
        let own = make().boxed().shared();
        loop {
            let (id, future, owned) = {
                let mut slot = self.slot.lock();
                match slot.as_ref() {
                    Some(flight) => (flight.id, flight.future.clone(), false),
                    None => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        self.started.fetch_add(1, Ordering::Relaxed);
                        *slot = Some(Flight {
                            id,
                            future: own.clone(),
                        });
                        (id, own.clone(), true)
                    }
                }
            };

            let output = self.finish(id, future).await;
            if owned {
                return output;
            }
        }
    }

    async fn finish(&self, id: u64, future: Shared<BoxFuture<'static, T>>) -> T {
        let output = future.await;
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|flight| flight.id == id) {
            *slot = None;
        }
        output
    }

    /// Whether a flight is currently in progress.
    pub fn in_flight(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Number of flights started since construction.
    pub fn flights_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}
