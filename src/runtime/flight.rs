//! At most one in-flight execution per key; concurrent callers share its
//! outcome.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::eval::Context;

const POLL: Duration = Duration::from_millis(50);

struct Call<V> {
    outcome: Mutex<Option<Result<V>>>,
    done: Condvar,
}

impl<V: Clone> Call<V> {
    fn new() -> Self {
        Call {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn finish(&self, outcome: Result<V>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    /// Block until the leader finishes, giving up if `ctx` is cancelled.
    fn wait(&self, ctx: &Context) -> Result<V> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            ctx.check()?;
            self.done.wait_for(&mut outcome, POLL);
        }
    }
}

pub struct Flights<K, V> {
    calls: Mutex<HashMap<K, Arc<Call<V>>>>,
}

impl<K, V> Default for Flights<K, V> {
    fn default() -> Self {
        Flights {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

/// Completes the call and clears the slot even if the leader unwinds.
struct Leader<'a, K: Eq + Hash, V: Clone> {
    flights: &'a Flights<K, V>,
    key: &'a K,
    call: Arc<Call<V>>,
    finished: bool,
}

impl<K: Eq + Hash, V: Clone> Leader<'_, K, V> {
    /// The slot is cleared before waiters wake so a retrying waiter starts
    /// a fresh call.
    fn complete(mut self, outcome: Result<V>) {
        self.flights.calls.lock().remove(self.key);
        self.call.finish(outcome);
        self.finished = true;
    }
}

impl<K: Eq + Hash, V: Clone> Drop for Leader<'_, K, V> {
    fn drop(&mut self) {
        if !self.finished {
            self.flights.calls.lock().remove(self.key);
            self.call
                .finish(Err(Error::message("execution abandoned by its leader")));
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Flights<K, V> {
    fn join(&self, key: &K) -> (Arc<Call<V>>, bool) {
        let mut calls = self.calls.lock();
        match calls.get(key) {
            Some(call) => (call.clone(), false),
            None => {
                let call = Arc::new(Call::new());
                calls.insert(key.clone(), call.clone());
                (call, true)
            }
        }
    }

    /// Run `work` unless a call for `key` is already in flight, in which case
    /// wait for that call's outcome instead. A waiter whose own context is
    /// still live does not inherit a cancelled leader's interruption; it
    /// joins or leads a new call.
    pub fn run(&self, ctx: &Context, key: &K, work: impl FnOnce() -> Result<V>) -> Result<V> {
        let call = loop {
            let (call, leading) = self.join(key);
            if leading {
                break call;
            }
            match call.wait(ctx) {
                Err(err) if err.is_interrupted() && ctx.check().is_ok() => {
                    debug!("leader was interrupted; retrying");
                }
                outcome => return outcome,
            }
        };
        let leader = Leader {
            flights: self,
            key,
            call,
            finished: false,
        };
        let outcome = work();
        leader.complete(outcome.clone());
        outcome
    }

    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn concurrent_callers_share_one_execution() {
        let flights: Arc<Flights<String, i64>> = Arc::new(Flights::default());
        let executions = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flights = flights.clone();
                let executions = executions.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    flights.run(&Context::new(), &"key".to_string(), || {
                        executions.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(200));
                        Ok(42)
                    })
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[test]
    fn failures_are_shared_and_not_retained() {
        let flights: Flights<u8, i64> = Flights::default();
        let err = flights
            .run(&Context::new(), &1, || Err(Error::message("boom")))
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(flights.run(&Context::new(), &1, || Ok(7)).unwrap(), 7);
    }

    #[test]
    fn waiters_honour_their_own_cancellation() {
        let flights: Arc<Flights<u8, i64>> = Arc::new(Flights::default());
        let started = Arc::new(Barrier::new(2));
        let leader = {
            let flights = flights.clone();
            let started = started.clone();
            thread::spawn(move || {
                flights.run(&Context::new(), &1, || {
                    started.wait();
                    thread::sleep(Duration::from_millis(500));
                    Ok(1)
                })
            })
        };
        started.wait();
        let ctx = Context::new();
        ctx.cancel_token().cancel();
        let err = flights.run(&ctx, &1, || Ok(2)).unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(leader.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn live_waiters_retry_after_an_interrupted_leader() {
        let flights: Arc<Flights<u8, i64>> = Arc::new(Flights::default());
        let started = Arc::new(Barrier::new(2));
        let leader_ctx = Context::new();
        let leader = {
            let flights = flights.clone();
            let started = started.clone();
            let cancel = leader_ctx.cancel_token().clone();
            thread::spawn(move || {
                let ctx = Context::new().with_cancel(cancel);
                flights.run(&ctx, &1, || {
                    started.wait();
                    while ctx.check().is_ok() {
                        thread::sleep(Duration::from_millis(5));
                    }
                    ctx.check().map(|()| 0)
                })
            })
        };
        started.wait();
        let waiter = {
            let flights = flights.clone();
            thread::spawn(move || flights.run(&Context::new(), &1, || Ok(2)))
        };
        thread::sleep(Duration::from_millis(100));
        leader_ctx.cancel_token().cancel();
        assert!(leader.join().unwrap().unwrap_err().is_interrupted());
        assert_eq!(waiter.join().unwrap().unwrap(), 2);
        assert_eq!(flights.in_flight(), 0);
    }
}
