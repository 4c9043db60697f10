//! Thunks: immutable, content-addressed descriptions of a command to run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::{Deserialize, Serialize as DeriveSerialize};

use crate::canon;
use crate::cid::Cid;
use crate::error::{Error, Result};
use crate::path::{CommandPath, DirPath, FileOrDir, FilePath, HostPath, ThunkPath};
use crate::scope::Scope;
use crate::secret::Secret;
use crate::value::{Symbol, Value};

/// Target operating system and, optionally, architecture.
#[derive(Clone, Debug, PartialEq, Eq, Hash, DeriveSerialize, Deserialize)]
pub struct Platform {
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

impl Platform {
    pub fn new(os: &str, arch: Option<&str>) -> Self {
        Platform {
            os: os.to_string(),
            arch: arch.map(str::to_string),
        }
    }

    pub fn linux() -> Self {
        Platform::new("linux", None)
    }

    /// `os` or `os/arch`.
    pub fn parse(text: &str) -> Self {
        match text.split_once('/') {
            Some((os, arch)) => Platform::new(os, Some(arch)),
            None => Platform::new(text, None),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arch {
            Some(arch) => write!(f, "{}/{}", self.os, arch),
            None => f.write_str(&self.os),
        }
    }
}

/// A reference to a container image, optionally pinned to a digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse `repo[:tag][@digest]`. A colon followed by a slash belongs to a
    /// registry host, not a tag.
    pub fn parse(text: &str) -> Self {
        let (name, digest) = match text.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (text, None),
        };
        let (repository, tag) = match name.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), Some(tag.to_string())),
            _ => (name.to_string(), None),
        };
        ImageRef {
            repository,
            tag,
            digest,
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// The root filesystem a thunk starts from.
#[derive(Clone, Debug)]
pub enum ThunkImage {
    Ref(ImageRef),
    Thunk(Arc<Thunk>),
}

/// What a thunk executes.
#[derive(Clone, Debug)]
pub enum ThunkCmd {
    Command(CommandPath),
    File(FilePath),
    Thunk(ThunkPath),
    Host(HostPath),
}

impl ThunkCmd {
    pub fn from_value(value: &Value) -> Result<Self> {
        match value.inner() {
            Value::Command(cmd) => Ok(ThunkCmd::Command(cmd.clone())),
            Value::File(file) => Ok(ThunkCmd::File(file.clone())),
            Value::ThunkPath(tp) => Ok(ThunkCmd::Thunk((**tp).clone())),
            Value::Host(host) => Ok(ThunkCmd::Host(host.clone())),
            _ => Err(Error::decode(value, "thunk command")),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ThunkCmd::Command(cmd) => Value::Command(cmd.clone()),
            ThunkCmd::File(file) => Value::File(file.clone()),
            ThunkCmd::Thunk(tp) => Value::ThunkPath(Arc::new(tp.clone())),
            ThunkCmd::Host(host) => Value::Host(host.clone()),
        }
    }
}

impl fmt::Display for ThunkCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

#[derive(Clone, Debug)]
pub enum MountSource {
    Thunk(ThunkPath),
    Host(HostPath),
    Secret(Secret),
}

impl MountSource {
    pub fn from_value(value: &Value) -> Result<Self> {
        match value.inner() {
            Value::ThunkPath(tp) => Ok(MountSource::Thunk((**tp).clone())),
            Value::Thunk(thunk) => Ok(MountSource::Thunk(ThunkPath::new(
                thunk.clone(),
                FileOrDir::Dir(DirPath::root()),
            ))),
            Value::Host(host) => Ok(MountSource::Host(host.clone())),
            Value::Secret(secret) => Ok(MountSource::Secret(secret.clone())),
            _ => Err(Error::decode(value, "mount source")),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MountSource::Thunk(tp) => Value::ThunkPath(Arc::new(tp.clone())),
            MountSource::Host(host) => Value::Host(host.clone()),
            MountSource::Secret(secret) => Value::Secret(secret.clone()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ThunkMount {
    pub source: MountSource,
    pub target: FileOrDir,
}

/// A command, its inputs and its environment. Builders return new thunks;
/// the identity hash is computed once per value.
#[derive(Clone)]
pub struct Thunk {
    image: Option<ThunkImage>,
    cmd: ThunkCmd,
    args: Vec<Value>,
    stdin: Vec<Value>,
    env: BTreeMap<String, Value>,
    dir: Option<FileOrDir>,
    mounts: Vec<ThunkMount>,
    platform: Option<Platform>,
    labels: BTreeMap<String, String>,
    hash: OnceCell<Cid>,
}

impl Thunk {
    pub fn new(cmd: ThunkCmd) -> Self {
        Thunk {
            image: None,
            cmd,
            args: Vec::new(),
            stdin: Vec::new(),
            env: BTreeMap::new(),
            dir: None,
            mounts: Vec::new(),
            platform: None,
            labels: BTreeMap::new(),
            hash: OnceCell::new(),
        }
    }

    /// A thunk running a command found on `$PATH`.
    pub fn command(name: &str) -> Self {
        Thunk::new(ThunkCmd::Command(CommandPath::new(name)))
    }

    fn touched(mut self) -> Self {
        self.hash = OnceCell::new();
        self
    }

    pub fn with_image(mut self, image: ThunkImage) -> Self {
        self.image = Some(image);
        self.touched()
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self.touched()
    }

    pub fn with_stdin(mut self, stdin: Vec<Value>) -> Self {
        self.stdin = stdin;
        self.touched()
    }

    pub fn with_env(mut self, env: BTreeMap<String, Value>) -> Self {
        self.env = env;
        self.touched()
    }

    pub fn with_dir(mut self, dir: FileOrDir) -> Self {
        self.dir = Some(dir);
        self.touched()
    }

    /// Append a mount; mount order is part of the identity.
    pub fn with_mount(mut self, source: MountSource, target: FileOrDir) -> Self {
        self.mounts.push(ThunkMount { source, target });
        self.touched()
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self.touched()
    }

    /// Labels never affect identity, so the memoised hash survives.
    pub fn with_label(mut self, name: &str, value: &str) -> Self {
        self.labels.insert(name.to_string(), value.to_string());
        self
    }

    pub fn image(&self) -> Option<&ThunkImage> {
        self.image.as_ref()
    }

    pub fn cmd(&self) -> &ThunkCmd {
        &self.cmd
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn stdin(&self) -> &[Value] {
        &self.stdin
    }

    pub fn env(&self) -> &BTreeMap<String, Value> {
        &self.env
    }

    pub fn dir(&self) -> Option<&FileOrDir> {
        self.dir.as_ref()
    }

    pub fn mounts(&self) -> &[ThunkMount] {
        &self.mounts
    }

    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// The platform this thunk must run on, inherited from a parent image.
    pub fn target_platform(&self) -> Option<Platform> {
        match (&self.platform, &self.image) {
            (Some(platform), _) => Some(platform.clone()),
            (None, Some(ThunkImage::Thunk(parent))) => parent.target_platform(),
            _ => None,
        }
    }

    pub fn canonical(&self) -> Result<Vec<u8>> {
        canon::encode_thunk(self)
    }

    /// SHA-256 of the canonical encoding.
    pub fn hash(&self) -> Result<Cid> {
        self.hash
            .get_or_try_init(|| Ok(Cid::compute(&self.canonical()?)))
            .copied()
    }

    /// Lowercase hex identity.
    pub fn name(&self) -> Result<String> {
        Ok(self.hash()?.to_hex())
    }

    pub fn equal(&self, other: &Thunk) -> bool {
        match (self.hash(), other.hash()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Thunks whose outputs this thunk consumes, in first-use order.
    pub fn inputs(&self) -> Vec<Arc<Thunk>> {
        let mut out: Vec<Arc<Thunk>> = Vec::new();
        let mut push = |thunk: &Arc<Thunk>| {
            if !out.iter().any(|seen| Arc::ptr_eq(seen, thunk) || seen.equal(thunk)) {
                out.push(thunk.clone());
            }
        };
        if let Some(ThunkImage::Thunk(parent)) = &self.image {
            push(parent);
        }
        if let ThunkCmd::Thunk(tp) = &self.cmd {
            push(&tp.thunk);
        }
        let mut found = Vec::new();
        for value in self.args.iter().chain(&self.stdin).chain(self.env.values()) {
            collect_thunks(value, &mut found);
        }
        for thunk in &found {
            push(thunk);
        }
        for mount in &self.mounts {
            if let MountSource::Thunk(tp) = &mount.source {
                push(&tp.thunk);
            }
        }
        out
    }

    /// Every secret reachable from this thunk, including through its inputs.
    pub fn secrets(&self) -> Vec<Secret> {
        let mut out: Vec<Secret> = Vec::new();
        self.collect_secrets(&mut out);
        out
    }

    fn collect_secrets(&self, out: &mut Vec<Secret>) {
        let mut add = |secret: &Secret| {
            if !out.iter().any(|seen| seen.name() == secret.name()) {
                out.push(secret.clone());
            }
        };
        let mut found = Vec::new();
        for value in self.args.iter().chain(&self.stdin).chain(self.env.values()) {
            collect_secrets(value, &mut found);
        }
        for mount in &self.mounts {
            if let MountSource::Secret(secret) = &mount.source {
                found.push(secret.clone());
            }
        }
        for secret in &found {
            add(secret);
        }
        for input in self.inputs() {
            input.collect_secrets(out);
        }
    }

    pub(crate) fn unencodable(&self) -> Option<Value> {
        self.args
            .iter()
            .chain(&self.stdin)
            .chain(self.env.values())
            .find_map(Value::unencodable)
    }
}

fn collect_thunks(value: &Value, out: &mut Vec<Arc<Thunk>>) {
    match value.inner() {
        Value::Thunk(thunk) => out.push(thunk.clone()),
        Value::ThunkPath(tp) => out.push(tp.thunk.clone()),
        Value::Pair(_) | Value::Cons(_) => {
            let (items, tail) = value.list_parts();
            for item in items.iter().chain(std::iter::once(&tail)) {
                collect_thunks(item, out);
            }
        }
        Value::Scope(scope) => {
            for (_, bound) in scope.visible_bindings() {
                collect_thunks(&bound, out);
            }
        }
        _ => {}
    }
}

fn collect_secrets(value: &Value, out: &mut Vec<Secret>) {
    match value.inner() {
        Value::Secret(secret) => out.push(secret.clone()),
        Value::Pair(_) | Value::Cons(_) => {
            let (items, tail) = value.list_parts();
            for item in items.iter().chain(std::iter::once(&tail)) {
                collect_secrets(item, out);
            }
        }
        Value::Scope(scope) => {
            for (_, bound) in scope.visible_bindings() {
                collect_secrets(&bound, out);
            }
        }
        _ => {}
    }
}

impl PartialEq for Thunk {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl fmt::Display for Thunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hash() {
            Ok(hash) => write!(f, "<thunk {}: ({}", hash.short(), self.cmd)?,
            Err(_) => write!(f, "<thunk ?: ({}", self.cmd)?,
        }
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        f.write_str(")>")
    }
}

impl fmt::Debug for Thunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Thunk {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match &self.image {
            Some(ThunkImage::Ref(image)) => map.serialize_entry("image", &image.to_string())?,
            Some(ThunkImage::Thunk(parent)) => map.serialize_entry("image", &**parent)?,
            None => {}
        }
        map.serialize_entry("cmd", &self.cmd.to_value())?;
        if !self.args.is_empty() {
            map.serialize_entry("args", &self.args)?;
        }
        if !self.stdin.is_empty() {
            map.serialize_entry("stdin", &self.stdin)?;
        }
        if !self.env.is_empty() {
            map.serialize_entry("env", &self.env)?;
        }
        if let Some(dir) = &self.dir {
            map.serialize_entry("dir", &dir.to_string())?;
        }
        if !self.mounts.is_empty() {
            let mounts: Vec<BTreeMap<&str, Value>> = self
                .mounts
                .iter()
                .map(|mount| {
                    BTreeMap::from([
                        ("source", mount.source.to_value()),
                        ("target", mount.target.to_value()),
                    ])
                })
                .collect();
            map.serialize_entry("mounts", &mounts)?;
        }
        if let Some(platform) = &self.platform {
            map.serialize_entry("platform", platform)?;
        }
        if !self.labels.is_empty() {
            map.serialize_entry("labels", &self.labels)?;
        }
        map.end()
    }
}

/// A network address served by a thunk, rendered from a format string.
#[derive(Clone, Debug)]
pub struct ThunkAddr {
    pub thunk: Arc<Thunk>,
    pub port: String,
    pub format: String,
}

impl ThunkAddr {
    /// Substitute `$name` and `${name}` from `scope`. Every unbound name is
    /// reported in one aggregate error.
    pub fn render(&self, scope: &Scope) -> Result<String> {
        let chars: Vec<char> = self.format.chars().collect();
        let mut out = String::new();
        let mut errors = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            if chars[i] != '$' {
                out.push(chars[i]);
                i += 1;
                continue;
            }
            let (name, next) = if chars.get(i + 1) == Some(&'{') {
                match chars[i + 2..].iter().position(|c| *c == '}') {
                    Some(len) => (chars[i + 2..i + 2 + len].iter().collect::<String>(), i + 3 + len),
                    None => (String::new(), i + 1),
                }
            } else {
                let len = chars[i + 1..]
                    .iter()
                    .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
                    .count();
                (chars[i + 1..i + 1 + len].iter().collect::<String>(), i + 1 + len)
            };
            if name.is_empty() {
                out.push('$');
                i += 1;
                continue;
            }
            let symbol = Symbol::new(&name);
            match scope.get(&symbol) {
                Some(value) => match value.inner() {
                    Value::Str(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                },
                None => errors.push(Error::Unbound {
                    symbol,
                    scope: scope.clone(),
                }),
            }
            i = next;
        }
        if errors.is_empty() {
            Ok(out)
        } else {
            Err(Error::Aggregate(errors))
        }
    }
}

impl fmt::Display for ThunkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.thunk, self.port)
    }
}
