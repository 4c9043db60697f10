//! Platform dispatch, single-flight execution and the in-memory result cache.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, info_span};

use super::flight::Flights;
use super::{RunResult, Runtime};
use crate::cid::Cid;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::eval::Context;
use crate::path::ThunkPath;
use crate::thunk::{ImageRef, Platform, Thunk};

pub struct PoolEntry {
    /// `None` accepts every thunk.
    pub platform: Option<Platform>,
    pub runtime: Arc<dyn Runtime>,
}

impl PoolEntry {
    /// An unconstrained entry matches everything. A constrained one matches
    /// thunks for the same OS, on any arch unless it names one.
    pub fn matches(&self, platform: Option<&Platform>) -> bool {
        let Some(constraint) = &self.platform else {
            return true;
        };
        let Some(platform) = platform else {
            return false;
        };
        constraint.os == platform.os
            && match &constraint.arch {
                None => true,
                Some(arch) => platform.arch.as_ref() == Some(arch),
            }
    }
}

pub struct Pool {
    entries: Vec<PoolEntry>,
    flights: Flights<Cid, Arc<RunResult>>,
    results: DashMap<Cid, Arc<RunResult>>,
}

impl Pool {
    /// Open every configured backend, in priority order.
    pub fn new(config: &Config) -> Result<Pool> {
        let mut entries = Vec::with_capacity(config.runtimes.len());
        for runtime in &config.runtimes {
            debug!(runtime = %runtime.runtime, platform = ?runtime.platform, "opening runtime");
            entries.push(PoolEntry {
                platform: runtime.platform.clone(),
                runtime: super::open(runtime)?,
            });
        }
        Ok(Pool::from_entries(entries))
    }

    pub fn from_entries(entries: Vec<PoolEntry>) -> Pool {
        Pool {
            entries,
            flights: Flights::default(),
            results: DashMap::new(),
        }
    }

    /// First runtime whose constraint accepts `platform`.
    pub fn select(&self, platform: Option<&Platform>) -> Result<&Arc<dyn Runtime>> {
        self.entries
            .iter()
            .find(|entry| entry.matches(platform))
            .map(|entry| &entry.runtime)
            .ok_or_else(|| Error::NoRuntime {
                platform: platform.cloned(),
            })
    }

    fn select_for(&self, thunk: &Thunk) -> Result<&Arc<dyn Runtime>> {
        self.select(thunk.target_platform().as_ref())
    }

    /// Run `thunk` at most once per identity for the pool's lifetime. A
    /// non-zero exit becomes [`Error::Exit`] and is not cached.
    pub fn execute(&self, ctx: &Context, thunk: &Thunk) -> Result<Arc<RunResult>> {
        let result = self.dispatch(ctx, thunk)?;
        if !result.success() {
            return Err(Error::Exit {
                code: result.exit_code,
                thunk: thunk.hash()?.to_hex(),
            });
        }
        Ok(result)
    }

    /// Like [`Pool::execute`], but a non-zero exit comes back as a result
    /// carrying its output.
    pub fn dispatch(&self, ctx: &Context, thunk: &Thunk) -> Result<Arc<RunResult>> {
        ctx.check()?;
        let cid = thunk.hash()?;
        if let Some(hit) = self.results.get(&cid) {
            debug!(thunk = %cid.short(), "result cache hit");
            return Ok(hit.clone());
        }
        let runtime = self.select_for(thunk)?;
        self.flights.run(ctx, &cid, || {
            if let Some(hit) = self.results.get(&cid) {
                return Ok(hit.clone());
            }
            let span = info_span!("run", thunk = %cid.short(), runtime = runtime.name());
            let _enter = span.enter();
            info!(cmd = %thunk.cmd().to_value(), "running");
            let result = Arc::new(runtime.run(ctx, thunk)?);
            if result.success() {
                self.results.insert(cid, result.clone());
            } else {
                info!(code = result.exit_code, "failed");
            }
            Ok(result)
        })
    }
}

impl Runtime for Pool {
    fn name(&self) -> &str {
        "pool"
    }

    fn run(&self, ctx: &Context, thunk: &Thunk) -> Result<RunResult> {
        self.execute(ctx, thunk).map(|result| (*result).clone())
    }

    fn read(&self, ctx: &Context, path: &ThunkPath) -> Result<Vec<u8>> {
        self.execute(ctx, &path.thunk)?;
        self.select_for(&path.thunk)?.read(ctx, path)
    }

    fn resolve(&self, ctx: &Context, image: &ImageRef) -> Result<ImageRef> {
        self.select(None)?.resolve(ctx, image)
    }

    fn export(&self, ctx: &Context, path: &ThunkPath, dest: &Path) -> Result<()> {
        self.execute(ctx, &path.thunk)?;
        self.select_for(&path.thunk)?.export(ctx, path, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::FileOrDir;
    use crate::runtime::testing::FakeRuntime;
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Duration;

    fn entry(platform: Option<Platform>, runtime: Arc<FakeRuntime>) -> PoolEntry {
        PoolEntry { platform, runtime }
    }

    #[test]
    fn selects_the_first_matching_entry() -> Result<()> {
        let arm = Arc::new(FakeRuntime::new("arm"));
        let linux = Arc::new(FakeRuntime::new("linux"));
        let pool = Pool::from_entries(vec![
            entry(Some(Platform::new("linux", Some("arm64"))), arm),
            entry(Some(Platform::new("linux", None)), linux),
        ]);
        let arm_platform = Platform::new("linux", Some("arm64"));
        assert_eq!(pool.select(Some(&arm_platform))?.name(), "arm");
        let amd = Platform::new("linux", Some("amd64"));
        assert_eq!(pool.select(Some(&amd))?.name(), "linux");
        assert_eq!(pool.select(Some(&Platform::linux()))?.name(), "linux");
        let err = pool.select(Some(&Platform::new("windows", None))).err();
        assert!(matches!(err, Some(Error::NoRuntime { .. })));
        assert!(pool.select(None).is_err());
        Ok(())
    }

    #[test]
    fn unconstrained_entries_accept_anything() -> Result<()> {
        let any = Arc::new(FakeRuntime::new("any"));
        let pool = Pool::from_entries(vec![entry(None, any)]);
        assert_eq!(pool.select(None)?.name(), "any");
        assert_eq!(pool.select(Some(&Platform::new("darwin", None)))?.name(), "any");
        Ok(())
    }

    #[test]
    fn caches_successful_results_by_identity() -> Result<()> {
        let fake = Arc::new(FakeRuntime::new("fake"));
        let pool = Pool::from_entries(vec![entry(None, fake.clone())]);
        let ctx = Context::new();
        let first = pool.run(&ctx, &Thunk::command("true"))?;
        let second = pool.run(&ctx, &Thunk::command("true").with_label("note", "x"))?;
        assert_eq!(first, second);
        assert_eq!(fake.runs(), 1);
        Ok(())
    }

    #[test]
    fn non_zero_exit_is_an_uncached_error() {
        let mut failing = FakeRuntime::new("fake");
        failing.exit_code = 3;
        let failing = Arc::new(failing);
        let pool = Pool::from_entries(vec![entry(None, failing.clone())]);
        let ctx = Context::new();
        for _ in 0..2 {
            match pool.run(&ctx, &Thunk::command("false")) {
                Err(Error::Exit { code, .. }) => assert_eq!(code, 3),
                other => panic!("expected exit error, got {other:?}"),
            }
        }
        assert_eq!(failing.runs(), 2);
    }

    #[test]
    fn concurrent_runs_execute_once() {
        let mut slow = FakeRuntime::new("slow");
        slow.delay = Duration::from_millis(200);
        let slow = Arc::new(slow);
        let pool = Arc::new(Pool::from_entries(vec![entry(None, slow.clone())]));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || pool.run(&Context::new(), &Thunk::command("sleep")))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(slow.runs(), 1);
    }

    #[test]
    fn cancelled_contexts_do_not_dispatch() {
        let fake = Arc::new(FakeRuntime::new("fake"));
        let pool = Pool::from_entries(vec![entry(None, fake.clone())]);
        let ctx = Context::new();
        ctx.cancel_token().cancel();
        let err = pool.run(&ctx, &Thunk::command("true")).unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(fake.runs(), 0);
    }

    #[test]
    fn waiters_outlive_a_cancelled_leader() {
        let mut slow = FakeRuntime::new("slow");
        slow.delay = Duration::from_millis(300);
        let slow = Arc::new(slow);
        let pool = Arc::new(Pool::from_entries(vec![entry(None, slow.clone())]));
        let leader_ctx = Context::new();
        let leader = {
            let pool = pool.clone();
            let cancel = leader_ctx.cancel_token().clone();
            thread::spawn(move || {
                pool.run(&Context::new().with_cancel(cancel), &Thunk::command("sleep"))
            })
        };
        thread::sleep(Duration::from_millis(50));
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.run(&Context::new(), &Thunk::command("sleep")))
        };
        thread::sleep(Duration::from_millis(50));
        leader_ctx.cancel_token().cancel();
        assert!(leader.join().unwrap().unwrap_err().is_interrupted());
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(slow.runs(), 2);
    }

    #[test]
    fn dispatch_returns_failures_with_their_output() -> Result<()> {
        let mut failing = FakeRuntime::new("fake");
        failing.exit_code = 2;
        let pool = Pool::from_entries(vec![entry(None, Arc::new(failing))]);
        let result = pool.dispatch(&Context::new(), &Thunk::command("false"))?;
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stdout, b"fake:.false\n".to_vec());
        Ok(())
    }

    #[test]
    fn reads_run_the_thunk_first() -> Result<()> {
        let fake = Arc::new(FakeRuntime::new("fake"));
        fake.files.lock().insert("out/a.txt".to_string(), b"hello".to_vec());
        let pool = Pool::from_entries(vec![entry(None, fake.clone())]);
        let path = ThunkPath::new(Arc::new(Thunk::command("make")), FileOrDir::parse("out/a.txt"));
        assert_eq!(pool.read(&Context::new(), &path)?, b"hello".to_vec());
        assert_eq!(fake.runs(), 1);
        Ok(())
    }
}
