use std::{
    future::Future,
    sync::{Mutex, MutexGuard},
};

use futures::future::{BoxFuture, FutureExt, Shared};

type InFlight<T> = Shared<BoxFuture<'static, T>>;

/// Latch around an async operation: while one run is in flight, later
/// callers await the same run and receive a clone of its result instead of
/// starting a second one.
pub struct SingleFlight<T: Clone> {
    slot: Mutex<Option<InFlight<T>>>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|running| running.peek().is_none())
    }

    /// Joins the in-flight run or starts a new one.
    pub async fn run<F, Fut>(&self, start: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        match self.run_if(|| true, start).await {
            Some(output) => output,
            None => unreachable!("admission closure always admits"),
        }
    }

    /// Joins the in-flight run if there is one. Otherwise asks `admit`
    /// whether a new run may start; `None` means it was refused. The check and
    /// the start happen under one lock, so two callers can never both start.
    pub async fn run_if<A, F, Fut>(&self, admit: A, start: F) -> Option<T>
    where
        A: FnOnce() -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let running = {
            let mut slot = self.lock();
            match slot.as_ref() {
                Some(running) if running.peek().is_none() => running.clone(),
                _ => {
                    if !admit() {
                        return None;
                    }
                    let running = start().boxed().shared();
                    *slot = Some(running.clone());
                    running
                }
            }
        };

        let output = running.await;
        let mut slot = self.lock();
        if slot
            .as_ref()
            .is_some_and(|finished| finished.peek().is_some())
        {
            *slot = None;
        }
        Some(output)
    }

    fn lock(&self) -> MutexGuard<'_, Option<InFlight<T>>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
