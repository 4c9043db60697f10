//! HTTP client for a runtime exposed by [`super::server`].
//!
//! `POST /run` carries a CBOR [`RunRequest`]; the response body is a stream
//! of CBOR [`Frame`]s ending in `Exit` or `Error`. `POST /read?path=` takes
//! the same request and answers with the file's raw bytes.

use std::io::Read;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::{debug, info};

use super::{RunResult, Runtime};
use crate::error::{Error, Result};
use crate::eval::Context;
use crate::path::ThunkPath;
use crate::thunk::Thunk;

pub const CBOR: &str = "application/cbor";

const POLL: Duration = Duration::from_millis(50);

/// Characters escaped in the `path` query parameter.
pub const QUERY_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'>')
    .add(b'=')
    .add(b'?')
    .add(b'{')
    .add(b'}');

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecretPayload {
    pub name: String,
    pub value: ByteBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Canonical thunk encoding.
    pub thunk: ByteBuf,
    /// Values for every secret the thunk references by name.
    pub secrets: Vec<SecretPayload>,
}

impl RunRequest {
    pub fn new(thunk: &Thunk) -> Result<Self> {
        Ok(RunRequest {
            thunk: ByteBuf::from(thunk.canonical()?),
            secrets: thunk
                .secrets()
                .into_iter()
                .map(|secret| SecretPayload {
                    name: secret.name().to_string(),
                    value: ByteBuf::from(secret.reveal().to_vec()),
                })
                .collect(),
        })
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|err| Error::Wire(err.to_string()))
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        serde_cbor::from_slice(bytes).map_err(|err| Error::Wire(err.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Stdout(ByteBuf),
    Stderr(ByteBuf),
    Exit { code: i32, outputs: Vec<String> },
    Error { message: String },
}

impl Frame {
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|err| Error::Wire(err.to_string()))
    }
}

/// Fold a frame stream into a result.
pub fn collect_frames(runtime: &str, reader: impl Read) -> Result<RunResult> {
    let mut result = RunResult::default();
    let frames = serde_cbor::Deserializer::from_reader(reader).into_iter::<Frame>();
    for frame in frames {
        match frame.map_err(|err| Error::unavailable(runtime, format!("reading frames: {err}")))? {
            Frame::Stdout(bytes) => result.stdout.extend_from_slice(&bytes),
            Frame::Stderr(bytes) => result.stderr.extend_from_slice(&bytes),
            Frame::Exit { code, outputs } => {
                result.exit_code = code;
                result.outputs = outputs;
                return Ok(result);
            }
            Frame::Error { message } => return Err(Error::runtime(runtime, message)),
        }
    }
    Err(Error::unavailable(runtime, "response ended before exit status"))
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    /// Connect timeout in seconds.
    pub connect_timeout: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            url: "http://127.0.0.1:6455".to_string(),
            connect_timeout: 10,
        }
    }
}

pub struct RemoteRuntime {
    url: String,
    agent: ureq::Agent,
}

impl RemoteRuntime {
    pub fn new(config: RemoteConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config.connect_timeout))
            .build();
        RemoteRuntime {
            url: config.url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn post(&self, endpoint: &str, body: Vec<u8>) -> Result<ureq::Response> {
        let url = format!("{}{endpoint}", self.url);
        debug!(%url, bytes = body.len(), "posting");
        self.agent
            .post(&url)
            .set("Content-Type", CBOR)
            .send_bytes(&body)
            .map_err(|err| match err {
                ureq::Error::Status(code, response) => {
                    let message = response.into_string().unwrap_or_default();
                    Error::runtime(&self.url, format!("{code}: {}", message.trim()))
                }
                ureq::Error::Transport(transport) => {
                    Error::unavailable(&self.url, transport.to_string())
                }
            })
    }

    /// Do `call` on a worker thread so the caller can give up when cancelled.
    fn cancellable<T: Send + 'static>(
        &self,
        ctx: &Context,
        call: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(call());
        });
        loop {
            match rx.recv_timeout(POLL) {
                Ok(outcome) => return outcome,
                Err(mpsc::RecvTimeoutError::Timeout) => ctx.check()?,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::unavailable(&self.url, "request worker vanished"));
                }
            }
        }
    }

    fn worker(&self) -> RemoteRuntime {
        RemoteRuntime {
            url: self.url.clone(),
            agent: self.agent.clone(),
        }
    }
}

impl Runtime for RemoteRuntime {
    fn name(&self) -> &str {
        &self.url
    }

    fn run(&self, ctx: &Context, thunk: &Thunk) -> Result<RunResult> {
        let body = RunRequest::new(thunk)?.to_cbor()?;
        info!(thunk = %thunk.hash()?.short(), url = %self.url, "running remotely");
        let worker = self.worker();
        self.cancellable(ctx, move || {
            let response = worker.post("/run", body)?;
            collect_frames(&worker.url, response.into_reader())
        })
    }

    fn read(&self, ctx: &Context, path: &ThunkPath) -> Result<Vec<u8>> {
        let body = RunRequest::new(&path.thunk)?.to_cbor()?;
        let endpoint = format!("/read?path={}", utf8_percent_encode(path.path.path(), QUERY_ENCODE));
        let worker = self.worker();
        self.cancellable(ctx, move || {
            let response = worker.post(&endpoint, body)?;
            let mut bytes = Vec::new();
            response
                .into_reader()
                .read_to_end(&mut bytes)
                .map_err(|err| Error::unavailable(&worker.url, err.to_string()))?;
            Ok(bytes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::Secret;
    use crate::value::Value;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn stream(frames: &[Frame]) -> Vec<u8> {
        frames
            .iter()
            .flat_map(|frame| frame.to_cbor().unwrap())
            .collect()
    }

    #[test]
    fn folds_frames_into_a_result() -> Result<()> {
        let bytes = stream(&[
            Frame::Stdout(ByteBuf::from(b"hel".to_vec())),
            Frame::Stderr(ByteBuf::from(b"warn".to_vec())),
            Frame::Stdout(ByteBuf::from(b"lo".to_vec())),
            Frame::Exit {
                code: 2,
                outputs: vec!["out/".into()],
            },
        ]);
        let result = collect_frames("test", bytes.as_slice())?;
        assert_eq!(result.stdout, b"hello".to_vec());
        assert_eq!(result.stderr, b"warn".to_vec());
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.outputs, vec!["out/".to_string()]);
        Ok(())
    }

    #[test]
    fn error_frames_and_truncation_are_distinct() {
        let failed = stream(&[Frame::Error {
            message: "disk full".into(),
        }]);
        assert!(matches!(
            collect_frames("test", failed.as_slice()),
            Err(Error::Runtime { .. })
        ));
        let truncated = stream(&[Frame::Stdout(ByteBuf::from(b"partial".to_vec()))]);
        assert!(matches!(
            collect_frames("test", truncated.as_slice()),
            Err(Error::Unavailable { .. })
        ));
    }

    #[test]
    fn requests_carry_secret_values_by_name() -> Result<()> {
        let thunk = Thunk::command("deploy").with_env(BTreeMap::from([(
            "TOKEN".to_string(),
            Value::Secret(Secret::new("token", "hunter2")),
        )]));
        let request = RunRequest::from_cbor(&RunRequest::new(&thunk)?.to_cbor()?)?;
        assert_eq!(request.thunk.as_slice(), thunk.canonical()?.as_slice());
        assert_eq!(request.secrets.len(), 1);
        assert_eq!(request.secrets[0].name, "token");
        assert_eq!(request.secrets[0].value.as_slice(), b"hunter2");
        Ok(())
    }

    #[test]
    fn unreachable_servers_are_unavailable() {
        let remote = RemoteRuntime::new(RemoteConfig {
            url: "http://127.0.0.1:9".to_string(),
            connect_timeout: 2,
        });
        let err = remote.run(&Context::new(), &Thunk::command("true")).unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }), "{err}");
    }

    #[test]
    fn read_paths_are_escaped() {
        let encoded = utf8_percent_encode("dir/a b&c.txt", QUERY_ENCODE).to_string();
        assert_eq!(encoded, "dir/a%20b%26c.txt");
    }
}
