//! Execution backends and the pool that dispatches thunks between them.

pub mod docker;
pub mod flight;
pub mod graph;
pub mod local;
pub mod pool;
pub mod remote;
pub mod server;
pub mod shim;

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::eval::Context;
use crate::path::{HostPath, ThunkPath};
use crate::thunk::{ImageRef, Thunk};
use crate::value::Value;

pub use pool::Pool;

/// What every execution backend provides.
pub trait Runtime: Send + Sync {
    fn name(&self) -> &str;

    /// Execute `thunk`. A non-zero exit is a normal result at this level.
    fn run(&self, ctx: &Context, thunk: &Thunk) -> Result<RunResult>;

    /// Read a file out of a previous run's output directory.
    fn read(&self, ctx: &Context, path: &ThunkPath) -> Result<Vec<u8>>;

    /// Pin an image reference to a digest.
    fn resolve(&self, _ctx: &Context, image: &ImageRef) -> Result<ImageRef> {
        Ok(image.clone())
    }

    /// Copy a directory out of a previous run onto the host.
    fn export(&self, _ctx: &Context, _path: &ThunkPath, _dest: &Path) -> Result<()> {
        Err(Error::Unsupported {
            runtime: self.name().to_string(),
            operation: "export",
        })
    }
}

/// Outcome of running a thunk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub exit_code: i32,
    #[serde(with = "serde_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub stderr: Vec<u8>,
    /// Top-level entries of the output directory; directories end in `/`.
    pub outputs: Vec<String>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Construct the backend named by `config.runtime`.
pub fn open(config: &RuntimeConfig) -> Result<Arc<dyn Runtime>> {
    let settings = &config.config;
    Ok(match config.runtime.as_str() {
        "local" => Arc::new(local::LocalRuntime::new(backend_config(settings)?)?),
        "docker" | "podman" => Arc::new(docker::DockerRuntime::new(
            &config.runtime,
            backend_config(settings)?,
        )),
        "remote" => Arc::new(remote::RemoteRuntime::new(backend_config(settings)?)),
        "graph" => {
            let graph: graph::GraphConfig = backend_config(settings)?;
            let inner = open(&RuntimeConfig {
                platform: config.platform.clone(),
                runtime: graph.runtime.clone(),
                config: graph.config.clone(),
            })?;
            Arc::new(graph::GraphRuntime::new(inner))
        }
        other => {
            return Err(Error::runtime(other, "unknown runtime kind"));
        }
    })
}

/// Decode a backend's settings; `null` means all defaults.
pub fn backend_config<T: DeserializeOwned + Default>(settings: &serde_json::Value) -> Result<T> {
    if settings.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(settings.clone()).map_err(|err| Error::Wire(format!("runtime config: {err}")))
}

/// How a backend names paths that live in its own output directories or on
/// the host, when they appear in arguments and environment values.
pub(crate) trait PathMapper {
    fn thunk_path(&self, path: &ThunkPath) -> Result<String>;
    fn host_path(&self, path: &HostPath) -> Result<String>;
}

/// Render one argument. Strings go through verbatim; structured values are
/// passed as JSON.
pub(crate) fn arg_string(value: &Value, paths: &dyn PathMapper) -> Result<String> {
    Ok(match value.inner() {
        Value::Str(s) => s.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Symbol(sym) | Value::Keyword(sym) => sym.as_str().to_string(),
        Value::File(file) => file.to_string(),
        Value::Dir(dir) => dir.to_string(),
        Value::Command(cmd) => cmd.name.clone(),
        Value::Thunk(thunk) => paths.thunk_path(&ThunkPath::new(
            thunk.clone(),
            crate::path::FileOrDir::Dir(crate::path::DirPath::root()),
        ))?,
        Value::ThunkPath(tp) => paths.thunk_path(tp)?,
        Value::Host(host) => paths.host_path(host)?,
        Value::Secret(_) => return Err(Error::Encode { value: value.clone() }),
        other => other.to_json()?,
    })
}

/// Environment values may carry secrets, which are revealed here and
/// nowhere else.
pub(crate) fn env_string(value: &Value, paths: &dyn PathMapper) -> Result<String> {
    match value.inner() {
        Value::Secret(secret) => Ok(String::from_utf8_lossy(secret.reveal()).into_owned()),
        _ => arg_string(value, paths),
    }
}

/// Stdin values as newline-delimited JSON.
pub(crate) fn stdin_bytes(values: &[Value]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for value in values {
        out.extend_from_slice(value.to_json()?.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{DirPath, FileOrDir};
    use crate::secret::Secret;
    use pretty_assertions::assert_eq;

    struct Mapper;

    impl PathMapper for Mapper {
        fn thunk_path(&self, path: &ThunkPath) -> Result<String> {
            Ok(format!("/outputs/{}/{}", path.thunk.name()?, path.path.path()))
        }

        fn host_path(&self, path: &HostPath) -> Result<String> {
            Ok(format!("/host/{}", path.path.path()))
        }
    }

    #[test]
    fn renders_arguments() -> Result<()> {
        assert_eq!(arg_string(&Value::string("a b"), &Mapper)?, "a b");
        assert_eq!(arg_string(&Value::Int(-3), &Mapper)?, "-3");
        assert_eq!(arg_string(&Value::Dir(DirPath::new("src")), &Mapper)?, "./src/");
        assert_eq!(
            arg_string(&Value::list([Value::Int(1), Value::string("x")]), &Mapper)?,
            r#"[1,"x"]"#
        );
        let host = Value::Host(HostPath::new("/ctx", FileOrDir::parse("data/")));
        assert_eq!(arg_string(&host, &Mapper)?, "/host/data");
        Ok(())
    }

    #[test]
    fn secrets_only_reach_the_environment() -> Result<()> {
        let secret = Value::Secret(Secret::new("token", "hunter2"));
        assert!(matches!(arg_string(&secret, &Mapper), Err(Error::Encode { .. })));
        assert_eq!(env_string(&secret, &Mapper)?, "hunter2");
        Ok(())
    }

    #[test]
    fn stdin_is_json_lines() -> Result<()> {
        let bytes = stdin_bytes(&[Value::Int(1), Value::string("two")])?;
        assert_eq!(String::from_utf8_lossy(&bytes), "1\n\"two\"\n");
        Ok(())
    }

    #[test]
    fn unknown_backends_are_rejected() {
        let config = RuntimeConfig {
            platform: None,
            runtime: "carrier-pigeon".to_string(),
            config: serde_json::Value::Null,
        };
        assert!(open(&config).is_err());
    }
}
