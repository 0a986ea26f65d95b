//! Per-key request coalescing.
//!
//! [`Flight::run`] guarantees that, for any one key, at most one instance of
//! the supplied future executes at a time; every caller that overlaps that
//! execution receives a clone of the same outcome. Callers arriving after
//! the outcome has been published and the entry retired start a fresh
//! execution. The cache uses this to collapse thundering-herd loads of a
//! missing key into a single loader or peer round trip.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Coalesces concurrent executions keyed by string.
///
/// `T` is the shared outcome, typically a `Result` with a cloneable error.
pub struct Flight<T> {
    inflight: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Waiter(watch::Receiver<Option<T>>),
}

/// Retires the in-flight entry when the leader finishes or is cancelled.
struct Retire<'a, T> {
    flight: &'a Flight<T>,
    key: &'a str,
}

impl<T> Drop for Retire<'_, T> {
    fn drop(&mut self) {
        self.flight.inflight.lock().remove(self.key);
    }
}

impl<T: Clone> Flight<T> {
    pub fn new() -> Self {
        Self { inflight: Mutex::new(HashMap::new()) }
    }

    /// Runs `f` unless an execution for `key` is already in flight, in which
    /// case the in-flight outcome is awaited and returned instead.
    ///
    /// The in-flight entry is published before it is retired, so a waiter
    /// holding the channel can never miss the value. If a leader is dropped
    /// mid-execution its entry is retired unpublished and waiters re-enter
    /// the race for a fresh execution.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut f = Some(f);
        loop {
            let role = {
                let mut inflight = self.inflight.lock();
                match inflight.get(key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(key.to_string(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Waiter(mut rx) => {
                    if let Ok(published) = rx.wait_for(Option::is_some).await {
                        if let Some(outcome) = (*published).clone() {
                            return outcome;
                        }
                    }
                    // Leader vanished without publishing; race for a fresh run.
                }
                Role::Leader(tx) => {
                    let _retire = Retire { flight: self, key };
                    let run = f.take();
                    debug_assert!(run.is_some(), "leader role is entered once");
                    let Some(run) = run else { continue };
                    let outcome = run().await;
                    let _ = tx.send(Some(outcome.clone()));
                    return outcome;
                }
            }
        }
    }
}

impl<T: Clone> Default for Flight<T> {
    fn default() -> Self {
        Self::new()
    }
}
