//! Runs thunks as host processes in per-thunk work directories.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, symlink};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{self, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::flight::Flights;
use super::shim::{self, OUTPUT_ENV, ShimCommand, ShimIo};
use super::{PathMapper, RunResult, Runtime, arg_string, env_string, stdin_bytes};
use crate::cid::Cid;
use crate::config;
use crate::error::{Error, Result};
use crate::eval::Context;
use crate::path::{HostPath, ThunkPath, resolve_within};
use crate::store::{self, StoredResult};
use crate::thunk::{MountSource, Thunk, ThunkCmd, ThunkImage};

const NAME: &str = "local";

static STAGING: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Work directories and the result store live here.
    pub data: Option<PathBuf>,
    /// External shim binary; commands run in-process when unset.
    pub helper: Option<PathBuf>,
}

pub struct LocalRuntime {
    root: PathBuf,
    helper: Option<PathBuf>,
    store: Mutex<Connection>,
    flights: Flights<Cid, RunResult>,
}

fn store_error(err: anyhow::Error) -> Error {
    Error::runtime(NAME, format!("{err:#}"))
}

impl LocalRuntime {
    pub fn new(config: LocalConfig) -> Result<Self> {
        let root = config.data.unwrap_or_else(config::data_dir);
        fs::create_dir_all(root.join("thunks"))?;
        let store = store::open_store(&root.join("kiln.db")).map_err(store_error)?;
        Ok(LocalRuntime {
            root,
            helper: config.helper,
            store: Mutex::new(store),
            flights: Flights::default(),
        })
    }

    fn thunk_dir(&self, cid: &Cid) -> PathBuf {
        self.root.join("thunks").join(cid.to_hex())
    }

    fn work_dir(&self, cid: &Cid) -> PathBuf {
        self.thunk_dir(cid).join("work")
    }

    /// Host location of a path inside a thunk's output.
    fn output_path(&self, path: &ThunkPath) -> Result<PathBuf> {
        resolve_within(&self.work_dir(&path.thunk.hash()?), path.path.path())
    }

    /// Fresh directory a run builds into before it is moved into place.
    fn staging_dir(&self, cid: &Cid) -> PathBuf {
        let n = STAGING.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("thunks")
            .join(format!("{}.{}.{n}", cid.to_hex(), process::id()))
    }

    /// A recorded result whose outputs are still on disk and whose stored
    /// thunk encodes the same as `thunk`.
    fn cached(&self, thunk: &Thunk, cid: &Cid) -> Result<Option<RunResult>> {
        let conn = self.store.lock();
        let Some(stored) = store::get_result(&conn, cid).map_err(store_error)? else {
            return Ok(None);
        };
        let dir = self.thunk_dir(cid);
        let recorded = store::load_thunk_cbor(&conn, cid).map_err(store_error)?;
        let stale = if !dir.join("work").is_dir() {
            warn!(thunk = %cid.short(), "result recorded but outputs are gone");
            true
        } else if recorded.as_deref() != Some(thunk.canonical()?.as_slice()) {
            warn!(thunk = %cid.short(), "recorded thunk does not match; rebuilding");
            true
        } else {
            false
        };
        if stale {
            store::forget_result(&conn, cid).map_err(store_error)?;
            return Ok(None);
        }
        Ok(Some(RunResult {
            exit_code: stored.exit_code,
            stdout: fs::read(dir.join("stdout")).unwrap_or_default(),
            stderr: fs::read(dir.join("stderr")).unwrap_or_default(),
            outputs: stored.outputs,
        }))
    }

    /// Run a thunk this one depends on, which must succeed.
    fn run_input(&self, ctx: &Context, input: &Thunk) -> Result<()> {
        let result = self.run(ctx, input)?;
        if !result.success() {
            return Err(Error::Exit {
                code: result.exit_code,
                thunk: input.name()?,
            });
        }
        Ok(())
    }

    fn prepare(&self, ctx: &Context, thunk: &Thunk, work: &Path) -> Result<Vec<PathBuf>> {
        match thunk.image() {
            Some(ThunkImage::Thunk(parent)) => copy_tree(&self.work_dir(&parent.hash()?), work)?,
            Some(ThunkImage::Ref(image)) => {
                return Err(Error::runtime(
                    NAME,
                    format!("cannot run container image {image}; configure a docker runtime"),
                ));
            }
            None => fs::create_dir_all(work)?,
        }

        let mut secrets = Vec::new();
        for mount in thunk.mounts() {
            ctx.check()?;
            let target = resolve_within(work, mount.target.path())?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            match &mount.source {
                MountSource::Thunk(tp) => copy_tree(&self.output_path(tp)?, &target)?,
                MountSource::Host(host) => copy_tree(&host.resolve()?, &target)?,
                MountSource::Secret(secret) => {
                    let mut file = OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .mode(0o600)
                        .open(&target)?;
                    file.write_all(secret.reveal())?;
                    secrets.push(target);
                }
            }
        }
        if let Some(dir) = thunk.dir() {
            fs::create_dir_all(resolve_within(work, dir.path())?)?;
        }
        Ok(secrets)
    }

    fn command(&self, thunk: &Thunk, work: &Path) -> Result<ShimCommand> {
        let program = match thunk.cmd() {
            ThunkCmd::Command(cmd) => cmd.name.clone(),
            ThunkCmd::File(file) if file.is_absolute() => file.path.clone(),
            ThunkCmd::File(file) => resolve_within(work, &file.path)?.display().to_string(),
            ThunkCmd::Thunk(tp) => self.output_path(tp)?.display().to_string(),
            ThunkCmd::Host(host) => host.resolve()?.display().to_string(),
        };
        let mut args = vec![program];
        for arg in thunk.args() {
            args.push(arg_string(arg, self)?);
        }
        let env = thunk
            .env()
            .iter()
            .map(|(name, value)| Ok(format!("{name}={}", env_string(value, self)?)))
            .collect::<Result<Vec<_>>>()?;
        let dir = match thunk.dir() {
            Some(dir) => resolve_within(work, dir.path())?,
            None => work.to_path_buf(),
        };
        Ok(ShimCommand {
            args,
            stdin: stdin_bytes(thunk.stdin())?,
            env,
            dir: Some(dir.display().to_string()),
        })
    }

    fn exec(&self, ctx: &Context, cmd_path: &Path, dir: &Path) -> Result<i32> {
        let stdout = dir.join("stdout");
        let stderr = dir.join("stderr");
        let work = dir.join("work");
        let Some(helper) = &self.helper else {
            let streams = ShimIo {
                stdout: Some(stdout),
                stderr: Some(stderr),
                process_group: true,
                root: Some(work),
            };
            return shim::run(ctx, cmd_path, &streams);
        };
        let mut child = Command::new(helper)
            .arg("run")
            .arg(cmd_path)
            .current_dir(&work)
            .env(OUTPUT_ENV, &stdout)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(fs::File::create(&stderr)?)
            .process_group(0)
            .spawn()
            .map_err(|err| Error::unavailable(NAME, format!("helper {}: {err}", helper.display())))?;
        Ok(shim::exit_code(shim::wait_cancellable(ctx, &mut child, true)?))
    }

    /// Run `thunk` in `dir`, a directory no other run uses.
    fn execute(&self, ctx: &Context, thunk: &Thunk, dir: &Path) -> Result<RunResult> {
        let work = dir.join("work");
        fs::create_dir_all(dir)?;

        let secrets = self.prepare(ctx, thunk, &work)?;
        let cmd_path = dir.join("cmd.json");
        let code = self
            .command(thunk, &work)
            .and_then(|cmd| cmd.write(&cmd_path))
            .and_then(|()| self.exec(ctx, &cmd_path, dir));
        for secret in &secrets {
            if let Err(err) = fs::remove_file(secret) {
                warn!(path = %secret.display(), %err, "removing mounted secret");
            }
        }
        let code = code?;
        if code == 0 {
            for parent in secrets.iter().filter_map(|secret| secret.parent()) {
                shim::set_epoch(parent)?;
            }
        }

        let result = RunResult {
            exit_code: code,
            stdout: fs::read(dir.join("stdout")).unwrap_or_default(),
            stderr: fs::read(dir.join("stderr")).unwrap_or_default(),
            outputs: if code == 0 { list_outputs(&work)? } else { Vec::new() },
        };
        Ok(result)
    }

    /// Build `thunk` in a staging directory and move it into place. Failed
    /// runs leave nothing behind.
    fn build(&self, ctx: &Context, thunk: &Thunk, cid: &Cid) -> Result<RunResult> {
        let staging = self.staging_dir(cid);
        let result = match self.execute(ctx, thunk, &staging) {
            Ok(result) if result.success() => result,
            outcome => {
                if let Err(err) = fs::remove_dir_all(&staging) {
                    warn!(%err, staging = %staging.display(), "removing staging dir");
                }
                return outcome;
            }
        };

        let dir = self.thunk_dir(cid);
        if let Err(err) = fs::rename(&staging, &dir) {
            let built = dir.join("work").is_dir();
            fs::remove_dir_all(&staging)?;
            if !built {
                return Err(err.into());
            }
            debug!(thunk = %cid.short(), "already built elsewhere; keeping it");
        }

        let conn = self.store.lock();
        store::put_thunk(&conn, cid, &thunk.canonical()?).map_err(store_error)?;
        store::put_result(
            &conn,
            cid,
            &StoredResult {
                exit_code: result.exit_code,
                outputs: result.outputs.clone(),
            },
        )
        .map_err(store_error)?;
        Ok(result)
    }
}

/// Top-level entries of a work directory, sorted; directories end in `/`.
fn list_outputs(work: &Path) -> Result<Vec<String>> {
    let mut outputs = Vec::new();
    for entry in fs::read_dir(work)? {
        let entry = entry?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            name.push('/');
        }
        outputs.push(name);
    }
    outputs.sort();
    Ok(outputs)
}

/// Copy a file, symlink or directory tree to `dest`.
fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        symlink(fs::read_link(src)?, dest)?;
    } else if meta.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dest)?;
    }
    Ok(())
}

impl PathMapper for LocalRuntime {
    fn thunk_path(&self, path: &ThunkPath) -> Result<String> {
        Ok(self.output_path(path)?.display().to_string())
    }

    fn host_path(&self, path: &HostPath) -> Result<String> {
        Ok(path.resolve()?.display().to_string())
    }
}

impl Runtime for LocalRuntime {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&self, ctx: &Context, thunk: &Thunk) -> Result<RunResult> {
        ctx.check()?;
        let cid = thunk.hash()?;
        if let Some(result) = self.cached(thunk, &cid)? {
            debug!(thunk = %cid.short(), "using stored result");
            return Ok(result);
        }
        self.flights.run(ctx, &cid, || {
            if let Some(result) = self.cached(thunk, &cid)? {
                return Ok(result);
            }
            for input in thunk.inputs() {
                self.run_input(ctx, &input)?;
            }
            info!(thunk = %cid.short(), cmd = %thunk.cmd(), "running locally");
            self.build(ctx, thunk, &cid)
        })
    }

    fn read(&self, ctx: &Context, path: &ThunkPath) -> Result<Vec<u8>> {
        self.run_input(ctx, &path.thunk)?;
        Ok(fs::read(self.output_path(path)?)?)
    }

    fn export(&self, ctx: &Context, path: &ThunkPath, dest: &Path) -> Result<()> {
        self.run_input(ctx, &path.thunk)?;
        let src = self.output_path(path)?;
        if !src.is_dir() {
            return Err(Error::runtime(NAME, format!("{path} is not a directory")));
        }
        copy_tree(&src, dest)
    }
}
