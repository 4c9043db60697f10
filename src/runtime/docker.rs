//! Runs thunks in containers through a Docker-compatible CLI.
//!
//! Each thunk runs in a container named after its identity and is committed
//! as `kiln:<hash>`, so thunks built on it start from its outputs and reads
//! copy files back out with `cp`.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::flight::Flights;
use super::shim::{exit_code, wait_cancellable};
use super::{PathMapper, RunResult, Runtime, arg_string, stdin_bytes};
use crate::cid::Cid;
use crate::error::{Error, Result};
use crate::eval::Context;
use crate::path::{self, HostPath, ThunkPath, resolve_within};
use crate::thunk::{ImageRef, MountSource, Thunk, ThunkCmd, ThunkImage};
use crate::value::Value;

/// Where the command runs inside the container.
pub const WORK_DIR: &str = "/kiln/work";
const INPUTS_DIR: &str = "/kiln/inputs";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// CLI to invoke; defaults to the runtime kind (`docker` or `podman`).
    pub binary: Option<String>,
    /// Host directory for staging inputs; defaults to the system temp dir.
    pub staging: Option<PathBuf>,
}

pub struct DockerRuntime {
    kind: String,
    binary: String,
    staging: PathBuf,
    flights: Flights<Cid, RunResult>,
}

pub fn container_name(cid: &Cid) -> String {
    format!("kiln-{}", cid.to_hex())
}

pub fn image_tag(cid: &Cid) -> String {
    format!("kiln:{}", cid.to_hex())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Volume {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// An environment variable; secrets carry no value and are passed through
/// the CLI's own environment so they never appear in its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: Option<String>,
}

/// Everything needed to start one container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerPlan {
    pub name: String,
    pub image: String,
    pub platform: Option<String>,
    pub workdir: String,
    pub volumes: Vec<Volume>,
    pub env: Vec<EnvVar>,
    pub program: String,
    pub args: Vec<String>,
}

/// CLI arguments for `docker run` of a plan.
pub fn run_args(plan: &ContainerPlan) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--name".to_string(),
        plan.name.clone(),
        "-i".to_string(),
        "-w".to_string(),
        plan.workdir.clone(),
    ];
    if let Some(platform) = &plan.platform {
        args.push("--platform".to_string());
        args.push(platform.clone());
    }
    for volume in &plan.volumes {
        args.push("-v".to_string());
        let mut spec = format!("{}:{}", volume.source, volume.target);
        if volume.read_only {
            spec.push_str(":ro");
        }
        args.push(spec);
    }
    for var in &plan.env {
        args.push("-e".to_string());
        args.push(match &var.value {
            Some(value) => format!("{}={value}", var.name),
            None => var.name.clone(),
        });
    }
    args.push("--entrypoint".to_string());
    args.push(plan.program.clone());
    args.push(plan.image.clone());
    args.extend(plan.args.iter().cloned());
    args
}

/// `repo@sha256:...` as printed by `image inspect`.
pub fn parse_digest(image: &ImageRef, inspected: &str) -> Option<ImageRef> {
    let (_, digest) = inspected.trim().split_once('@')?;
    if digest.is_empty() {
        return None;
    }
    Some(ImageRef {
        digest: Some(digest.to_string()),
        ..image.clone()
    })
}

/// Maps paths into the container, remembering host directories to mount.
#[derive(Default)]
struct Planner {
    hosts: RefCell<BTreeSet<String>>,
}

impl PathMapper for Planner {
    fn thunk_path(&self, path: &ThunkPath) -> Result<String> {
        Ok(path::clean(&format!(
            "{INPUTS_DIR}/{}/{}",
            path.thunk.name()?,
            path.path.path()
        )))
    }

    fn host_path(&self, path: &HostPath) -> Result<String> {
        self.hosts.borrow_mut().insert(path.context_dir.clone());
        Ok(path.resolve()?.display().to_string())
    }
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(err) = pipe.read_to_end(&mut buf) {
                warn!(%err, read = buf.len(), "draining container output");
            }
        }
        buf
    })
}

fn joined(handle: JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

impl DockerRuntime {
    pub fn new(kind: &str, config: DockerConfig) -> Self {
        DockerRuntime {
            kind: kind.to_string(),
            binary: config.binary.unwrap_or_else(|| kind.to_string()),
            staging: config.staging.unwrap_or_else(std::env::temp_dir),
            flights: Flights::default(),
        }
    }

    /// Run a CLI command, failing on a non-zero exit.
    fn cli(&self, ctx: &Context, args: &[String]) -> Result<Vec<u8>> {
        debug!(binary = %self.binary, ?args, "invoking");
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Error::unavailable(&self.kind, format!("{}: {err}", self.binary)))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = wait_cancellable(ctx, &mut child, false)?;
        let (stdout, stderr) = (joined(stdout), joined(stderr));
        if !status.success() {
            return Err(Error::runtime(
                &self.kind,
                format!(
                    "{} {}: {}",
                    self.binary,
                    args.first().map(String::as_str).unwrap_or_default(),
                    String::from_utf8_lossy(&stderr).trim()
                ),
            ));
        }
        Ok(stdout)
    }

    fn remove_container(&self, name: &str) {
        let rm = [String::from("rm"), String::from("-f"), name.to_string()];
        if let Err(err) = self.cli(&Context::new(), &rm) {
            debug!(%err, container = name, "removing container");
        }
    }

    /// Copy `inner` (relative to the work dir) out of a committed thunk.
    fn copy_out(&self, ctx: &Context, cid: &Cid, inner: &str, dest: &Path) -> Result<()> {
        let source = resolve_within(Path::new(WORK_DIR), inner)?;
        let name = format!("kiln-cp-{}", cid.short());
        self.remove_container(&name);
        self.cli(
            ctx,
            &[
                "create".into(),
                "--name".into(),
                name.clone(),
                image_tag(cid),
                "true".into(),
            ],
        )?;
        let copied = self.cli(
            ctx,
            &[
                "cp".into(),
                format!("{name}:{}", source.display()),
                dest.display().to_string(),
            ],
        );
        self.remove_container(&name);
        copied.map(|_| ())
    }

    /// Make sure an input's committed image exists, running it if not.
    fn run_input(&self, ctx: &Context, input: &Thunk) -> Result<()> {
        let tag = image_tag(&input.hash()?);
        if self.cli(ctx, &["image".into(), "inspect".into(), tag]).is_ok() {
            return Ok(());
        }
        let result = self.run(ctx, input)?;
        if !result.success() {
            return Err(Error::Exit {
                code: result.exit_code,
                thunk: input.name()?,
            });
        }
        Ok(())
    }

    /// Stage inputs and mounts under `staging` and describe the container.
    fn plan(&self, ctx: &Context, thunk: &Thunk, cid: &Cid, staging: &Path) -> Result<ContainerPlan> {
        let image = match thunk.image() {
            Some(ThunkImage::Ref(image)) => image.to_string(),
            Some(ThunkImage::Thunk(parent)) => image_tag(&parent.hash()?),
            None => {
                return Err(Error::runtime(&self.kind, format!("thunk {} has no image", cid.short())));
            }
        };

        let mut volumes = Vec::new();
        for input in thunk.inputs() {
            let input_cid = input.hash()?;
            let dest = staging.join("inputs").join(input_cid.to_hex());
            fs::create_dir_all(dest.parent().unwrap_or(staging))?;
            self.copy_out(ctx, &input_cid, ".", &dest)?;
            volumes.push(Volume {
                source: dest.display().to_string(),
                target: format!("{INPUTS_DIR}/{}", input_cid.to_hex()),
                read_only: true,
            });
        }

        for (i, mount) in thunk.mounts().iter().enumerate() {
            let target = resolve_within(Path::new(WORK_DIR), mount.target.path())?;
            let source = match &mount.source {
                MountSource::Thunk(tp) => {
                    let staged = staging.join("inputs").join(tp.thunk.name()?);
                    resolve_within(&staged, tp.path.path())?.display().to_string()
                }
                MountSource::Host(host) => host.resolve()?.display().to_string(),
                MountSource::Secret(secret) => {
                    let file = staging.join(format!("secret-{i}"));
                    let mut out = OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .mode(0o600)
                        .open(&file)?;
                    out.write_all(secret.reveal())?;
                    file.display().to_string()
                }
            };
            volumes.push(Volume {
                source,
                target: target.display().to_string(),
                read_only: !matches!(mount.source, MountSource::Thunk(_)),
            });
        }

        let planner = Planner::default();
        let program = match thunk.cmd() {
            ThunkCmd::Command(cmd) => cmd.name.clone(),
            ThunkCmd::File(file) => file.to_string(),
            ThunkCmd::Thunk(tp) => planner.thunk_path(tp)?,
            ThunkCmd::Host(host) => planner.host_path(host)?,
        };
        let args = thunk
            .args()
            .iter()
            .map(|arg| arg_string(arg, &planner))
            .collect::<Result<Vec<_>>>()?;
        let env = thunk
            .env()
            .iter()
            .map(|(name, value)| {
                Ok(EnvVar {
                    name: name.clone(),
                    value: match value.inner() {
                        Value::Secret(_) => None,
                        _ => Some(arg_string(value, &planner)?),
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        for host in planner.hosts.into_inner() {
            volumes.push(Volume {
                source: host.clone(),
                target: host,
                read_only: true,
            });
        }

        let workdir = match thunk.dir() {
            Some(dir) => resolve_within(Path::new(WORK_DIR), dir.path())?.display().to_string(),
            None => WORK_DIR.to_string(),
        };
        Ok(ContainerPlan {
            name: container_name(cid),
            image,
            platform: thunk
                .target_platform()
                .filter(|platform| platform.arch.is_some())
                .map(|platform| platform.to_string()),
            workdir,
            volumes,
            env,
            program,
            args,
        })
    }

    fn execute(&self, ctx: &Context, thunk: &Thunk, cid: &Cid, staging: &Path) -> Result<RunResult> {
        let plan = self.plan(ctx, thunk, cid, staging)?;
        self.remove_container(&plan.name);

        let mut command = Command::new(&self.binary);
        command
            .args(run_args(&plan))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in thunk.env() {
            if let Value::Secret(secret) = value.inner() {
                command.env(name, String::from_utf8_lossy(secret.reveal()).into_owned());
            }
        }
        let mut child = command
            .spawn()
            .map_err(|err| Error::unavailable(&self.kind, format!("{}: {err}", self.binary)))?;
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = stdin_bytes(thunk.stdin())?;
            thread::spawn(move || {
                if let Err(err) = stdin.write_all(&bytes) {
                    if err.kind() != io::ErrorKind::BrokenPipe {
                        warn!(%err, "writing container stdin");
                    }
                }
            });
        }
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = match wait_cancellable(ctx, &mut child, false) {
            Ok(status) => status,
            Err(err) => {
                self.remove_container(&plan.name);
                return Err(err);
            }
        };
        let mut result = RunResult {
            exit_code: exit_code(status),
            stdout: joined(stdout),
            stderr: joined(stderr),
            outputs: Vec::new(),
        };

        if result.success() {
            self.cli(ctx, &["commit".into(), plan.name.clone(), image_tag(cid)])?;
            let out = staging.join("outputs");
            self.cli(
                ctx,
                &[
                    "cp".into(),
                    format!("{}:{WORK_DIR}/.", plan.name),
                    out.display().to_string(),
                ],
            )?;
            result.outputs = fs::read_dir(&out)?
                .map(|entry| {
                    let entry = entry?;
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type()?.is_dir() {
                        name.push('/');
                    }
                    Ok(name)
                })
                .collect::<std::io::Result<Vec<_>>>()?;
            result.outputs.sort();
        }
        self.remove_container(&plan.name);
        Ok(result)
    }
}

impl Runtime for DockerRuntime {
    fn name(&self) -> &str {
        &self.kind
    }

    fn run(&self, ctx: &Context, thunk: &Thunk) -> Result<RunResult> {
        ctx.check()?;
        let cid = thunk.hash()?;
        self.flights.run(ctx, &cid, || {
            for input in thunk.inputs() {
                self.run_input(ctx, &input)?;
            }
            info!(thunk = %cid.short(), image = ?thunk.image(), "running in container");
            let staging = self.staging.join(container_name(&cid));
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
            }
            fs::create_dir_all(&staging)?;
            let result = self.execute(ctx, thunk, &cid, &staging);
            if let Err(err) = fs::remove_dir_all(&staging) {
                warn!(%err, staging = %staging.display(), "removing staging dir");
            }
            result
        })
    }

    fn read(&self, ctx: &Context, path: &ThunkPath) -> Result<Vec<u8>> {
        let cid = path.thunk.hash()?;
        let dest = self.staging.join(format!("kiln-read-{}", cid.short()));
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        fs::create_dir_all(&dest)?;
        let file = dest.join("file");
        let copied = self
            .copy_out(ctx, &cid, path.path.path(), &file)
            .and_then(|()| Ok(fs::read(&file)?));
        if let Err(err) = fs::remove_dir_all(&dest) {
            warn!(%err, dest = %dest.display(), "removing read staging dir");
        }
        copied
    }

    fn resolve(&self, ctx: &Context, image: &ImageRef) -> Result<ImageRef> {
        if image.digest.is_some() {
            return Ok(image.clone());
        }
        let inspect = |ctx: &Context| {
            self.cli(
                ctx,
                &[
                    "image".into(),
                    "inspect".into(),
                    "--format".into(),
                    "{{index .RepoDigests 0}}".into(),
                    image.to_string(),
                ],
            )
        };
        let out = match inspect(ctx) {
            Ok(out) => out,
            Err(_) => {
                self.cli(ctx, &["pull".into(), image.to_string()])?;
                inspect(ctx)?
            }
        };
        parse_digest(image, &String::from_utf8_lossy(&out))
            .ok_or_else(|| Error::runtime(&self.kind, format!("no digest for {image}")))
    }

    fn export(&self, ctx: &Context, path: &ThunkPath, dest: &Path) -> Result<()> {
        let cid = path.thunk.hash()?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        self.copy_out(ctx, &cid, path.path.path(), dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::FileOrDir;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn builds_run_arguments() {
        let plan = ContainerPlan {
            name: "kiln-abc".into(),
            image: "alpine:3.19".into(),
            platform: Some("linux/arm64".into()),
            workdir: WORK_DIR.into(),
            volumes: vec![Volume {
                source: "/tmp/in".into(),
                target: "/kiln/work/in".into(),
                read_only: true,
            }],
            env: vec![
                EnvVar {
                    name: "MODE".into(),
                    value: Some("release".into()),
                },
                EnvVar {
                    name: "TOKEN".into(),
                    value: None,
                },
            ],
            program: "make".into(),
            args: vec!["all".into()],
        };
        assert_eq!(
            run_args(&plan),
            [
                "run", "--name", "kiln-abc", "-i", "-w", "/kiln/work", "--platform", "linux/arm64",
                "-v", "/tmp/in:/kiln/work/in:ro", "-e", "MODE=release", "-e", "TOKEN",
                "--entrypoint", "make", "alpine:3.19", "all",
            ]
            .map(String::from)
            .to_vec()
        );
    }

    #[test]
    fn thunk_paths_map_into_the_inputs_dir() -> Result<()> {
        let thunk = Arc::new(Thunk::command("make"));
        let planner = Planner::default();
        let path = ThunkPath::new(thunk.clone(), FileOrDir::parse("dist/app"));
        assert_eq!(
            planner.thunk_path(&path)?,
            format!("/kiln/inputs/{}/dist/app", thunk.name()?)
        );
        Ok(())
    }

    #[test]
    fn host_paths_are_recorded_for_mounting() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let context = dir.path().display().to_string();
        let planner = Planner::default();
        let host = HostPath::new(context.clone(), FileOrDir::parse("src/"));
        assert_eq!(planner.host_path(&host)?, format!("{context}/src"));
        assert!(planner.hosts.borrow().contains(&context));
        Ok(())
    }

    #[test]
    fn digests_come_from_inspect_output() {
        let image = ImageRef::parse("alpine:3.19");
        let pinned = parse_digest(&image, "alpine@sha256:abcd\n");
        assert_eq!(pinned.and_then(|i| i.digest), Some("sha256:abcd".to_string()));
        assert_eq!(parse_digest(&image, "<no value>"), None);
    }

    struct Truncated(Option<&'static [u8]>);

    impl Read for Truncated {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.take() {
                Some(bytes) => {
                    buf[..bytes.len()].copy_from_slice(bytes);
                    Ok(bytes.len())
                }
                None => Err(io::Error::other("pipe closed")),
            }
        }
    }

    #[test]
    fn drained_output_keeps_what_arrived_before_an_error() {
        assert_eq!(joined(drain(Some(Truncated(Some(b"partial"))))), b"partial".to_vec());
        assert_eq!(joined(drain(None::<Truncated>)), Vec::<u8>::new());
    }

    #[test]
    fn names_derive_from_identity() -> Result<()> {
        let cid = Thunk::command("true").hash()?;
        assert_eq!(container_name(&cid), format!("kiln-{}", cid.to_hex()));
        assert_eq!(image_tag(&cid), format!("kiln:{}", cid.to_hex()));
        Ok(())
    }
}
