//! The command contract shared by the local backend and the `kiln-shim`
//! helper: read a one-shot JSON command file, run it, propagate its exit
//! code and normalise timestamps of what it produced.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::eval::Context;

/// Names the file receiving the command's stdout.
pub const OUTPUT_ENV: &str = "_KILN_OUTPUT";

/// 1985-10-26T08:15:00Z, the modification time of everything a run leaves.
pub const EPOCH: i64 = 499_162_500;

const POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimCommand {
    pub args: Vec<String>,
    #[serde(default, with = "serde_bytes")]
    pub stdin: Vec<u8>,
    /// `NAME=VALUE` entries added to the inherited environment.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub dir: Option<String>,
}

impl ShimCommand {
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self).map_err(|err| Error::Wire(err.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Read the command file and delete it before anything runs.
    pub fn take(path: &Path) -> Result<ShimCommand> {
        let payload = fs::read(path)?;
        let cmd = serde_json::from_slice(&payload)
            .map_err(|err| Error::Wire(format!("{}: {err}", path.display())))?;
        fs::remove_file(path)?;
        Ok(cmd)
    }

    fn env_pairs(&self) -> Result<Vec<(&str, &str)>> {
        self.env
            .iter()
            .map(|entry| {
                entry
                    .split_once('=')
                    .ok_or_else(|| Error::Wire(format!("malformed env: {entry}")))
            })
            .collect()
    }
}

/// Where the command's output goes and how it is isolated.
#[derive(Clone, Debug, Default)]
pub struct ShimIo {
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    /// Run in a fresh process group so cancellation reaches descendants.
    pub process_group: bool,
    /// Tree whose timestamps are normalised after a successful run; the
    /// current directory when unset.
    pub root: Option<PathBuf>,
}

fn output(path: &Option<PathBuf>) -> Result<Stdio> {
    Ok(match path {
        Some(path) => Stdio::from(File::create(path)?),
        None => Stdio::inherit(),
    })
}

/// Run the command file at `cmd_path`, returning the command's exit code.
pub fn run(ctx: &Context, cmd_path: &Path, streams: &ShimIo) -> Result<i32> {
    let cmd = ShimCommand::take(cmd_path)?;
    let Some((bin, argv)) = cmd.args.split_first() else {
        return Err(Error::Wire("empty command".to_string()));
    };

    let mut command = Command::new(bin);
    command
        .args(argv)
        .env_remove(OUTPUT_ENV)
        .envs(cmd.env_pairs()?)
        .stdin(Stdio::piped())
        .stdout(output(&streams.stdout)?)
        .stderr(output(&streams.stderr)?);
    if let Some(dir) = &cmd.dir {
        command.current_dir(dir);
    }
    if streams.process_group {
        command.process_group(0);
    }

    debug!(args = ?cmd.args, dir = ?cmd.dir, "spawning");
    let mut child = command
        .spawn()
        .map_err(|err| Error::runtime("shim", format!("spawn {bin}: {err}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        let bytes = cmd.stdin.clone();
        thread::spawn(move || {
            if let Err(err) = stdin.write_all(&bytes) {
                if err.kind() != io::ErrorKind::BrokenPipe {
                    warn!(%err, "writing stdin");
                }
            }
        });
    }

    let code = exit_code(wait_cancellable(ctx, &mut child, streams.process_group)?);
    if code == 0 {
        let root = match &streams.root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };
        normalize_times(&root)?;
    }
    Ok(code)
}

/// Wait for `child`, killing it (or its whole group) on cancellation.
pub fn wait_cancellable(ctx: &Context, child: &mut Child, group: bool) -> Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if let Err(err) = ctx.check() {
            kill(child, group);
            if let Err(err) = child.wait() {
                warn!(%err, "reaping killed command");
            }
            return Err(err);
        }
        thread::sleep(POLL);
    }
}

fn kill(child: &Child, group: bool) {
    let pid = child.id() as libc::pid_t;
    let target = if group { -pid } else { pid };
    unsafe {
        libc::kill(target, libc::SIGKILL);
    }
}

/// Exit status as a shell reports it: signals become 128 + signo.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Set the access and modification times of everything under `root` to
/// [`EPOCH`], without following symlinks and without crossing into other
/// filesystems mounted below it.
pub fn normalize_times(root: &Path) -> Result<()> {
    let root_dev = fs::symlink_metadata(root)?.dev();
    let mut pending = vec![root.to_path_buf()];
    let mut changed = 0usize;
    while let Some(path) = pending.pop() {
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            if meta.dev() != root_dev {
                debug!(path = %path.display(), "skipping mount point");
                continue;
            }
            for entry in fs::read_dir(&path)? {
                pending.push(entry?.path());
            }
        }
        if meta.mtime() != EPOCH {
            set_epoch(&path)?;
            changed += 1;
        }
    }
    debug!(root = %root.display(), changed, "normalised timestamps");
    Ok(())
}

/// Set one path's times to [`EPOCH`] without following symlinks.
pub fn set_epoch(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::runtime("shim", format!("path contains NUL: {}", path.display())))?;
    let time = libc::timespec {
        tv_sec: EPOCH as libc::time_t,
        tv_nsec: 0,
    };
    let times = [time, time];
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    fn sh(script: &str, dir: &Path) -> ShimCommand {
        ShimCommand {
            args: vec!["sh".into(), "-c".into(), script.into()],
            stdin: Vec::new(),
            env: Vec::new(),
            dir: Some(dir.display().to_string()),
        }
    }

    fn io_in(dir: &Path) -> ShimIo {
        ShimIo {
            stdout: Some(dir.join("stdout")),
            stderr: Some(dir.join("stderr")),
            process_group: true,
            root: Some(dir.to_path_buf()),
        }
    }

    #[test]
    fn runs_and_captures_output() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let work = tmp.path().join("work");
        fs::create_dir(&work)?;
        let cmd_path = tmp.path().join("cmd.json");
        let mut cmd = sh("cat; printf %s \"$GREETING\" >&2; echo made > out.txt", &work);
        cmd.stdin = b"from stdin\n".to_vec();
        cmd.env = vec!["GREETING=hello".into()];
        cmd.write(&cmd_path)?;

        let code = run(&Context::new(), &cmd_path, &io_in(tmp.path()))?;
        assert_eq!(code, 0);
        assert!(!cmd_path.exists());
        assert_eq!(fs::read_to_string(tmp.path().join("stdout"))?, "from stdin\n");
        assert_eq!(fs::read_to_string(tmp.path().join("stderr"))?, "hello");
        let meta = fs::symlink_metadata(work.join("out.txt"))?;
        assert_eq!(meta.mtime(), EPOCH);
        assert_eq!(fs::symlink_metadata(&work)?.mtime(), EPOCH);
        Ok(())
    }

    #[test]
    fn normalises_the_whole_root_not_just_the_command_dir() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let sub = tmp.path().join("sub");
        fs::create_dir(&sub)?;
        let cmd_path = tmp.path().join("cmd.json");
        sh("echo hi > ../top.txt; mkdir ../side", &sub).write(&cmd_path)?;
        assert_eq!(run(&Context::new(), &cmd_path, &io_in(tmp.path()))?, 0);
        for path in ["top.txt", "side", "sub", "stdout"] {
            let meta = fs::symlink_metadata(tmp.path().join(path))?;
            assert_eq!(meta.mtime(), EPOCH, "{path}");
        }
        assert_eq!(fs::symlink_metadata(tmp.path())?.mtime(), EPOCH);
        Ok(())
    }

    #[test]
    fn propagates_exit_codes_without_normalising() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cmd_path = tmp.path().join("cmd.json");
        sh("touch left.txt; exit 3", tmp.path()).write(&cmd_path)?;
        let code = run(&Context::new(), &cmd_path, &io_in(tmp.path()))?;
        assert_eq!(code, 3);
        assert_ne!(fs::symlink_metadata(tmp.path().join("left.txt"))?.mtime(), EPOCH);
        Ok(())
    }

    #[test]
    fn hides_the_output_variable() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cmd_path = tmp.path().join("cmd.json");
        sh("printf %s \"${_KILN_OUTPUT:-unset}\"", tmp.path()).write(&cmd_path)?;
        run(&Context::new(), &cmd_path, &io_in(tmp.path()))?;
        assert_eq!(fs::read_to_string(tmp.path().join("stdout"))?, "unset");
        Ok(())
    }

    #[test]
    fn cancellation_kills_the_process_group() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cmd_path = tmp.path().join("cmd.json");
        sh("sleep 30 & sleep 30", tmp.path()).write(&cmd_path)?;
        let ctx = Context::new();
        let token = ctx.cancel_token().clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            token.cancel();
        });
        let started = Instant::now();
        let err = run(&ctx, &cmd_path, &io_in(tmp.path())).unwrap_err();
        assert!(err.is_interrupted());
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn rejects_malformed_commands() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cmd_path = tmp.path().join("cmd.json");
        let mut cmd = sh("true", tmp.path());
        cmd.env = vec!["NOEQUALS".into()];
        cmd.write(&cmd_path)?;
        assert!(matches!(
            run(&Context::new(), &cmd_path, &io_in(tmp.path())),
            Err(Error::Wire(_))
        ));
        ShimCommand::default().write(&cmd_path)?;
        assert!(run(&Context::new(), &cmd_path, &io_in(tmp.path())).is_err());
        Ok(())
    }

    #[test]
    fn signals_map_to_shell_codes() {
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code(ExitStatus::from_raw(2 << 8)), 2);
    }
}
