//! Expose a runtime over HTTP for [`super::remote::RemoteRuntime`] clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use anyhow::{Context as _, anyhow};
use percent_encoding::percent_decode_str;
use serde_bytes::ByteBuf;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use super::Runtime;
use super::pool::Pool;
use super::remote::{CBOR, Frame, RunRequest};
use crate::canon;
use crate::error::Result;
use crate::eval::Context;
use crate::path::{FileOrDir, ThunkPath};
use crate::secret::Secret;
use crate::thunk::Thunk;

type Reply = Response<std::io::Cursor<Vec<u8>>>;

pub fn bind(listen: &str) -> anyhow::Result<Server> {
    Server::http(listen).map_err(|err| anyhow!("failed to bind {listen}: {err}"))
}

/// Answer requests until the server is dropped, one thread per request.
pub fn serve(server: Server, pool: Arc<Pool>) {
    if let Some(addr) = server.server_addr().to_ip() {
        info!(%addr, "serving");
    }
    for request in server.incoming_requests() {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            if let Err(err) = handle_request(&pool, request) {
                warn!("error handling request: {err:#}");
            }
        });
    }
}

fn handle_request(pool: &Pool, mut request: Request) -> anyhow::Result<()> {
    if *request.method() != Method::Post {
        let response = text_response(405, "Only POST supported");
        request.respond(response)?;
        return Ok(());
    }

    let mut body = Vec::new();
    request
        .as_reader()
        .read_to_end(&mut body)
        .context("reading request body")?;
    let url = request.url().to_string();
    let (path, query) = split_query(&url);
    debug!(path, bytes = body.len(), "request");

    let response = match path {
        "/run" => match decode_request(&body) {
            Ok(thunk) => cbor_response(run_frames(pool, &thunk)),
            Err(err) => text_response(400, &err.to_string()),
        },
        "/read" => match query.and_then(|q| query_param(q, "path")) {
            Some(file) => match decode_request(&body) {
                Ok(thunk) => read_file(pool, thunk, &file),
                Err(err) => text_response(400, &err.to_string()),
            },
            None => text_response(400, "missing path"),
        },
        _ => text_response(404, "unrecognised path"),
    };

    request.respond(response)?;
    Ok(())
}

fn decode_request(body: &[u8]) -> Result<Thunk> {
    let request = RunRequest::from_cbor(body)?;
    let secrets: HashMap<String, Secret> = request
        .secrets
        .into_iter()
        .map(|payload| {
            let secret = Secret::new(&payload.name, payload.value.into_vec());
            (payload.name, secret)
        })
        .collect();
    canon::decode_thunk(&request.thunk, &|name| secrets.get(name).cloned())
}

/// Run and encode the outcome as a frame stream. Failed commands still send
/// their output ahead of the exit frame.
fn run_frames(pool: &Pool, thunk: &Thunk) -> Vec<u8> {
    let ctx = Context::new();
    let frames = match pool.dispatch(&ctx, thunk) {
        Ok(result) => {
            info!(code = result.exit_code, "served run");
            vec![
                Frame::Stdout(ByteBuf::from(result.stdout.clone())),
                Frame::Stderr(ByteBuf::from(result.stderr.clone())),
                Frame::Exit {
                    code: result.exit_code,
                    outputs: result.outputs.clone(),
                },
            ]
        }
        Err(err) => {
            warn!(%err, "run failed");
            vec![Frame::Error {
                message: err.to_string(),
            }]
        }
    };
    let mut out = Vec::new();
    for frame in frames {
        match frame.to_cbor() {
            Ok(bytes) => out.extend(bytes),
            Err(err) => warn!(%err, "encoding frame"),
        }
    }
    out
}

fn read_file(pool: &Pool, thunk: Thunk, file: &str) -> Reply {
    let path = ThunkPath::new(Arc::new(thunk), FileOrDir::parse(file));
    match pool.read(&Context::new(), &path) {
        Ok(bytes) => Response::from_data(bytes).with_status_code(StatusCode(200)),
        Err(err) => text_response(500, &err.to_string()),
    }
}

fn cbor_response(body: Vec<u8>) -> Reply {
    with_content_type(Response::from_data(body), CBOR).with_status_code(StatusCode(200))
}

fn text_response(status: u16, body: &str) -> Reply {
    with_content_type(Response::from_string(body), "text/plain").with_status_code(StatusCode(status))
}

fn with_content_type(response: Reply, value: &str) -> Reply {
    match Header::from_bytes(&b"Content-Type"[..], value.as_bytes()) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == name {
                return percent_decode_str(value)
                    .decode_utf8()
                    .ok()
                    .map(|decoded| decoded.into_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::pool::PoolEntry;
    use crate::runtime::remote::{RemoteConfig, RemoteRuntime};
    use crate::runtime::testing::FakeRuntime;
    use crate::value::Value;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn start(runtime: Arc<FakeRuntime>) -> RemoteRuntime {
        let server = bind("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let pool = Pool::from_entries(vec![PoolEntry {
            platform: None,
            runtime,
        }]);
        thread::spawn(move || serve(server, Arc::new(pool)));
        RemoteRuntime::new(RemoteConfig {
            url: format!("http://{addr}"),
            connect_timeout: 5,
        })
    }

    #[test]
    fn runs_round_trip_through_the_server() -> Result<()> {
        let fake = Arc::new(FakeRuntime::new("fake"));
        let remote = start(fake.clone());
        let thunk = Thunk::command("deploy").with_env(BTreeMap::from([(
            "TOKEN".to_string(),
            Value::Secret(Secret::new("token", "hunter2")),
        )]));
        let result = remote.run(&Context::new(), &thunk)?;
        assert_eq!(result.exit_code, 0);
        assert_eq!(fake.runs(), 1);
        assert_eq!(fake.order.lock().clone(), vec![thunk.hash()?.to_hex()]);
        Ok(())
    }

    #[test]
    fn exit_codes_cross_the_wire() -> Result<()> {
        let mut failing = FakeRuntime::new("fake");
        failing.exit_code = 7;
        let remote = start(Arc::new(failing));
        let result = remote.run(&Context::new(), &Thunk::command("false"))?;
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.stdout, b"fake:.false\n".to_vec());
        assert_eq!(result.outputs, vec!["out/".to_string()]);
        Ok(())
    }

    #[test]
    fn reads_files_with_awkward_names() -> Result<()> {
        let fake = Arc::new(FakeRuntime::new("fake"));
        fake.files
            .lock()
            .insert("out/a b&c.txt".to_string(), b"contents".to_vec());
        let remote = start(fake);
        let path = ThunkPath::new(
            Arc::new(Thunk::command("make")),
            FileOrDir::parse("out/a b&c.txt"),
        );
        assert_eq!(remote.read(&Context::new(), &path)?, b"contents".to_vec());
        let missing = ThunkPath::new(Arc::new(Thunk::command("make")), FileOrDir::parse("nope"));
        assert!(matches!(
            remote.read(&Context::new(), &missing),
            Err(Error::Runtime { .. })
        ));
        Ok(())
    }

    #[test]
    fn parses_query_parameters() {
        assert_eq!(query_param("a=1&path=x%20y", "path"), Some("x y".to_string()));
        assert_eq!(query_param("a=1", "path"), None);
        assert_eq!(split_query("/read?path=x"), ("/read", Some("path=x")));
    }
}
