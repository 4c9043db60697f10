//! Canonical CBOR encoding of thunks and the values they carry.
//!
//! Values are `[type, payload..]` arrays; thunks are maps with a fixed key
//! order. Env keys are sorted, mount and argument order is kept, secrets are
//! written by name only and labels are left out.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_cbor::Value as CborValue;

use crate::cbor::{push_array, push_bool, push_i64, push_map, push_null, push_text};
use crate::error::{Error, Result};
use crate::path::{CommandPath, DirPath, FileOrDir, FilePath, HostPath, ThunkPath};
use crate::scope::Scope;
use crate::secret::Secret;
use crate::thunk::{ImageRef, MountSource, Platform, Thunk, ThunkAddr, ThunkCmd, ThunkImage};
use crate::value::Value;

macro_rules! malformed {
    ($($arg:tt)*) => {
        return Err(Error::Wire(format!($($arg)*)))
    };
}

pub fn encode_thunk(thunk: &Thunk) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    push_thunk(&mut buf, thunk)?;
    Ok(buf)
}

fn push_thunk(buf: &mut Vec<u8>, thunk: &Thunk) -> Result<()> {
    push_map(buf, 8);

    push_text(buf, "image");
    match thunk.image() {
        None => push_null(buf),
        Some(ThunkImage::Ref(image)) => {
            push_array(buf, 4);
            push_text(buf, "ref");
            push_text(buf, &image.repository);
            push_opt_text(buf, image.tag.as_deref());
            push_opt_text(buf, image.digest.as_deref());
        }
        Some(ThunkImage::Thunk(parent)) => {
            push_array(buf, 2);
            push_text(buf, "thunk");
            push_thunk(buf, parent)?;
        }
    }

    push_text(buf, "cmd");
    push_value(buf, &thunk.cmd().to_value())?;

    push_text(buf, "args");
    push_values(buf, thunk.args())?;

    push_text(buf, "stdin");
    push_values(buf, thunk.stdin())?;

    push_text(buf, "env");
    push_map(buf, thunk.env().len() as u64);
    for (name, value) in thunk.env() {
        push_text(buf, name);
        push_value(buf, value)?;
    }

    push_text(buf, "dir");
    match thunk.dir() {
        Some(dir) => push_path(buf, dir),
        None => push_null(buf),
    }

    push_text(buf, "mounts");
    push_array(buf, thunk.mounts().len() as u64);
    for mount in thunk.mounts() {
        push_array(buf, 2);
        push_value(buf, &mount.source.to_value())?;
        push_path(buf, &mount.target);
    }

    push_text(buf, "platform");
    match thunk.platform() {
        Some(platform) => {
            push_array(buf, 2);
            push_text(buf, &platform.os);
            push_opt_text(buf, platform.arch.as_deref());
        }
        None => push_null(buf),
    }
    Ok(())
}

fn push_opt_text(buf: &mut Vec<u8>, text: Option<&str>) {
    match text {
        Some(text) => push_text(buf, text),
        None => push_null(buf),
    }
}

fn push_values(buf: &mut Vec<u8>, values: &[Value]) -> Result<()> {
    push_array(buf, values.len() as u64);
    for value in values {
        push_value(buf, value)?;
    }
    Ok(())
}

fn push_path(buf: &mut Vec<u8>, path: &FileOrDir) {
    push_array(buf, 2);
    match path {
        FileOrDir::File(file) => {
            push_text(buf, "file");
            push_text(buf, &file.path);
        }
        FileOrDir::Dir(dir) => {
            push_text(buf, "dir");
            push_text(buf, &dir.path);
        }
    }
}

fn push_tag(buf: &mut Vec<u8>, len: u64, tag: &str) {
    push_array(buf, len);
    push_text(buf, tag);
}

fn push_value(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Null => push_tag(buf, 1, "null"),
        Value::Ignore => push_tag(buf, 1, "ignore"),
        Value::Empty => push_tag(buf, 1, "empty"),
        Value::Bool(b) => {
            push_tag(buf, 2, "bool");
            push_bool(buf, *b);
        }
        Value::Int(n) => {
            push_tag(buf, 2, "int");
            push_i64(buf, *n);
        }
        Value::Str(s) => {
            push_tag(buf, 2, "str");
            push_text(buf, s);
        }
        Value::Symbol(sym) => {
            push_tag(buf, 2, "symbol");
            push_text(buf, sym.as_str());
        }
        Value::Keyword(sym) => {
            push_tag(buf, 2, "keyword");
            push_text(buf, sym.as_str());
        }
        Value::Pair(_) | Value::Cons(_) => {
            let (items, tail) = value.list_parts();
            push_tag(buf, 3, "list");
            push_values(buf, &items)?;
            push_value(buf, &tail)?;
        }
        Value::Scope(scope) => {
            let mut bindings = scope.visible_bindings();
            bindings.sort_by(|(a, _), (b, _)| a.cmp(b));
            push_tag(buf, 2, "scope");
            push_array(buf, bindings.len() as u64);
            for (key, bound) in &bindings {
                push_array(buf, 2);
                push_text(buf, key.as_str());
                push_value(buf, bound)?;
            }
        }
        Value::Thunk(thunk) => {
            push_tag(buf, 2, "thunk");
            push_thunk(buf, thunk)?;
        }
        Value::ThunkPath(tp) => {
            push_tag(buf, 3, "thunk-path");
            push_thunk(buf, &tp.thunk)?;
            push_path(buf, &tp.path);
        }
        Value::ThunkAddr(addr) => {
            push_tag(buf, 4, "thunk-addr");
            push_thunk(buf, &addr.thunk)?;
            push_text(buf, &addr.port);
            push_text(buf, &addr.format);
        }
        Value::File(file) => {
            push_tag(buf, 2, "file");
            push_text(buf, &file.path);
        }
        Value::Dir(dir) => {
            push_tag(buf, 2, "dir");
            push_text(buf, &dir.path);
        }
        Value::Command(cmd) => {
            push_tag(buf, 2, "command");
            push_text(buf, &cmd.name);
        }
        Value::Host(host) => {
            push_tag(buf, 3, "host");
            push_text(buf, &host.context_dir);
            push_path(buf, &host.path);
        }
        Value::Secret(secret) => {
            push_tag(buf, 2, "secret");
            push_text(buf, secret.name());
        }
        Value::Annotated(annotated) => push_value(buf, &annotated.value)?,
        Value::Bind(_)
        | Value::ExtendPath(_)
        | Value::Operative(_)
        | Value::Builtin(_)
        | Value::Applicative(_) => {
            return Err(Error::Encode {
                value: value.clone(),
            });
        }
    }
    Ok(())
}

/// Decode canonical bytes back into a thunk. Secrets are looked up by name.
pub fn decode_thunk(bytes: &[u8], secrets: &dyn Fn(&str) -> Option<Secret>) -> Result<Thunk> {
    let value: CborValue =
        serde_cbor::from_slice(bytes).map_err(|err| Error::Wire(err.to_string()))?;
    Decoder { secrets }.thunk(&value)
}

struct Decoder<'a> {
    secrets: &'a dyn Fn(&str) -> Option<Secret>,
}

fn text(value: &CborValue, what: &str) -> Result<String> {
    match value {
        CborValue::Text(s) => Ok(s.clone()),
        other => malformed!("{what} must be text, found {other:?}"),
    }
}

fn opt_text(value: &CborValue, what: &str) -> Result<Option<String>> {
    match value {
        CborValue::Null => Ok(None),
        other => text(other, what).map(Some),
    }
}

fn array<'v>(value: &'v CborValue, what: &str) -> Result<&'v [CborValue]> {
    match value {
        CborValue::Array(items) => Ok(items),
        other => malformed!("{what} must be an array, found {other:?}"),
    }
}

fn field<'v>(map: &'v BTreeMap<CborValue, CborValue>, key: &str) -> Result<&'v CborValue> {
    match map.get(&CborValue::Text(key.to_string())) {
        Some(value) => Ok(value),
        None => malformed!("thunk is missing `{key}`"),
    }
}

fn nth(items: &[CborValue], n: usize) -> Result<&CborValue> {
    match items.get(n) {
        Some(item) => Ok(item),
        None => malformed!("value is missing payload {n}"),
    }
}

fn path(value: &CborValue) -> Result<FileOrDir> {
    let items = array(value, "path")?;
    if items.len() != 2 {
        malformed!("path must be [kind, path]");
    }
    let path = text(&items[1], "path")?;
    match text(&items[0], "path kind")?.as_str() {
        "file" => Ok(FileOrDir::File(FilePath::new(&path))),
        "dir" => Ok(FileOrDir::Dir(DirPath::new(&path))),
        other => malformed!("unknown path kind `{other}`"),
    }
}

impl Decoder<'_> {
    fn thunk(&self, value: &CborValue) -> Result<Thunk> {
        let map = match value {
            CborValue::Map(map) => map,
            other => malformed!("thunk must be a map, found {other:?}"),
        };

        let cmd = ThunkCmd::from_value(&self.value(field(map, "cmd")?)?)?;
        let mut thunk = Thunk::new(cmd);

        match field(map, "image")? {
            CborValue::Null => {}
            image => {
                let items = array(image, "image")?;
                match (items.first(), items.len()) {
                    (Some(CborValue::Text(tag)), 4) if tag == "ref" => {
                        thunk = thunk.with_image(ThunkImage::Ref(ImageRef {
                            repository: text(&items[1], "repository")?,
                            tag: opt_text(&items[2], "tag")?,
                            digest: opt_text(&items[3], "digest")?,
                        }));
                    }
                    (Some(CborValue::Text(tag)), 2) if tag == "thunk" => {
                        let parent = self.thunk(&items[1])?;
                        thunk = thunk.with_image(ThunkImage::Thunk(Arc::new(parent)));
                    }
                    _ => malformed!("invalid image {image:?}"),
                }
            }
        }

        let args = self.values(field(map, "args")?)?;
        let stdin = self.values(field(map, "stdin")?)?;
        thunk = thunk.with_args(args).with_stdin(stdin);

        let env = match field(map, "env")? {
            CborValue::Map(entries) => {
                let mut env = BTreeMap::new();
                for (key, value) in entries {
                    env.insert(text(key, "env name")?, self.value(value)?);
                }
                env
            }
            other => malformed!("env must be a map, found {other:?}"),
        };
        thunk = thunk.with_env(env);

        match field(map, "dir")? {
            CborValue::Null => {}
            dir => thunk = thunk.with_dir(path(dir)?),
        }

        for mount in array(field(map, "mounts")?, "mounts")? {
            let pair = array(mount, "mount")?;
            if pair.len() != 2 {
                malformed!("mount must be [source, target]");
            }
            let source = MountSource::from_value(&self.value(&pair[0])?)?;
            thunk = thunk.with_mount(source, path(&pair[1])?);
        }

        match field(map, "platform")? {
            CborValue::Null => {}
            platform => {
                let items = array(platform, "platform")?;
                if items.len() != 2 {
                    malformed!("platform must be [os, arch]");
                }
                thunk = thunk.with_platform(Platform {
                    os: text(&items[0], "os")?,
                    arch: opt_text(&items[1], "arch")?,
                });
            }
        }

        Ok(thunk)
    }

    fn values(&self, value: &CborValue) -> Result<Vec<Value>> {
        array(value, "value list")?
            .iter()
            .map(|item| self.value(item))
            .collect()
    }

    fn value(&self, value: &CborValue) -> Result<Value> {
        let items = array(value, "value")?;
        let Some(CborValue::Text(tag)) = items.first() else {
            malformed!("value must start with a type tag, found {value:?}");
        };
        let decoded = match tag.as_str() {
            "null" => Value::Null,
            "ignore" => Value::Ignore,
            "empty" => Value::Empty,
            "bool" => match nth(items, 1)? {
                CborValue::Bool(b) => Value::Bool(*b),
                other => malformed!("bool payload must be bool, found {other:?}"),
            },
            "int" => match nth(items, 1)? {
                CborValue::Integer(n) => match i64::try_from(*n) {
                    Ok(n) => Value::Int(n),
                    Err(_) => malformed!("int payload out of range"),
                },
                other => malformed!("int payload must be integer, found {other:?}"),
            },
            "str" => Value::string(&text(nth(items, 1)?, "str payload")?),
            "symbol" => Value::symbol(&text(nth(items, 1)?, "symbol payload")?),
            "keyword" => Value::keyword(&text(nth(items, 1)?, "keyword payload")?),
            "list" => {
                let elements = self.values(nth(items, 1)?)?;
                let tail = self.value(nth(items, 2)?)?;
                Value::list_with_tail(elements, tail)
            }
            "scope" => {
                let scope = Scope::empty();
                for entry in array(nth(items, 1)?, "scope entries")? {
                    let pair = array(entry, "scope entry")?;
                    if pair.len() != 2 {
                        malformed!("scope entry must be [key, value]");
                    }
                    scope.set(text(&pair[0], "scope key")?.as_str(), self.value(&pair[1])?);
                }
                Value::Scope(scope)
            }
            "thunk" => Value::thunk(self.thunk(nth(items, 1)?)?),
            "thunk-path" => Value::ThunkPath(Arc::new(ThunkPath::new(
                Arc::new(self.thunk(nth(items, 1)?)?),
                path(nth(items, 2)?)?,
            ))),
            "thunk-addr" => Value::ThunkAddr(Arc::new(ThunkAddr {
                thunk: Arc::new(self.thunk(nth(items, 1)?)?),
                port: text(nth(items, 2)?, "port")?,
                format: text(nth(items, 3)?, "format")?,
            })),
            "file" => Value::File(FilePath::new(&text(nth(items, 1)?, "file payload")?)),
            "dir" => Value::Dir(DirPath::new(&text(nth(items, 1)?, "dir payload")?)),
            "command" => Value::Command(CommandPath::new(&text(nth(items, 1)?, "command payload")?)),
            "host" => Value::Host(HostPath::new(
                text(nth(items, 1)?, "host context")?,
                path(nth(items, 2)?)?,
            )),
            "secret" => {
                let name = text(nth(items, 1)?, "secret name")?;
                match (self.secrets)(&name) {
                    Some(secret) => Value::Secret(secret),
                    None => malformed!("secret {name} was not provided"),
                }
            }
            other => malformed!("unknown value type `{other}`"),
        };
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::Cid;

    fn no_secrets(_: &str) -> Option<Secret> {
        None
    }

    fn sample() -> Thunk {
        let base = Thunk::command("make").with_image(ThunkImage::Ref(ImageRef::parse("alpine:3.18")));
        let mut env = BTreeMap::new();
        env.insert("MODE".to_string(), Value::keyword("release"));
        env.insert("DEPTH".to_string(), Value::Int(-3));
        Thunk::command("tar")
            .with_image(ThunkImage::Thunk(Arc::new(base.clone())))
            .with_args(vec![
                Value::string("-c"),
                Value::list([Value::Bool(true), Value::Null]),
                Value::ThunkPath(Arc::new(ThunkPath::new(Arc::new(base), FileOrDir::parse("./out/")))),
            ])
            .with_env(env)
            .with_dir(FileOrDir::parse("./src/"))
            .with_platform(Platform::new("linux", Some("arm64")))
    }

    #[test]
    fn decoding_preserves_identity() -> Result<()> {
        let thunk = sample();
        let bytes = thunk.canonical()?;
        let decoded = decode_thunk(&bytes, &no_secrets)?;
        assert_eq!(decoded.canonical()?, bytes);
        assert_eq!(decoded.hash()?, Cid::compute(&bytes));
        Ok(())
    }

    #[test]
    fn secrets_are_resolved_by_name() -> Result<()> {
        let thunk = Thunk::command("login").with_mount(
            MountSource::Secret(Secret::new("token", "hunter2")),
            FileOrDir::parse("./token"),
        );
        let bytes = thunk.canonical()?;
        assert!(decode_thunk(&bytes, &no_secrets).is_err());
        let decoded = decode_thunk(&bytes, &|name| Some(Secret::new(name, "hunter2")))?;
        match &decoded.mounts()[0].source {
            MountSource::Secret(secret) => assert_eq!(secret.reveal(), b"hunter2"),
            other => panic!("unexpected mount {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn combiners_refuse_encoding() {
        let op = crate::ground::standard()
            .get(&crate::value::Symbol::new("if"))
            .unwrap();
        let thunk = Thunk::command("x").with_args(vec![op]);
        assert!(matches!(thunk.hash(), Err(Error::Encode { .. })));
    }
}
