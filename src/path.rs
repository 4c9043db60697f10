//! Path values: files, directories, commands, host paths and thunk outputs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::thunk::Thunk;
use crate::value::Value;

/// Lexically normalise a slash-separated path. Relative paths never gain a
/// leading `./`; leading `..` components are kept.
pub fn clean(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join `rel` onto `root`, refusing anything that would land outside it.
pub fn resolve_within(root: &Path, rel: &str) -> Result<PathBuf> {
    let cleaned = clean(rel);
    if cleaned.starts_with('/') || cleaned == ".." || cleaned.starts_with("../") {
        return Err(Error::HostPathEscape {
            context_dir: root.display().to_string(),
            attempted: rel.to_string(),
        });
    }
    if cleaned == "." {
        Ok(root.to_path_buf())
    } else {
        Ok(root.join(cleaned))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FilePath {
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DirPath {
    pub path: String,
}

impl FilePath {
    pub fn new(path: &str) -> Self {
        FilePath { path: clean(path) }
    }

    pub fn is_absolute(&self) -> bool {
        self.path.starts_with('/')
    }
}

impl DirPath {
    pub fn new(path: &str) -> Self {
        DirPath { path: clean(path) }
    }

    pub fn root() -> Self {
        DirPath {
            path: ".".to_string(),
        }
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.starts_with('/') || self.path.starts_with("..") {
            f.write_str(&self.path)
        } else {
            write!(f, "./{}", self.path)
        }
    }
}

impl fmt::Display for DirPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path.as_str() {
            "." => f.write_str("./"),
            "/" => f.write_str("/"),
            p if p.starts_with('/') || p.starts_with("..") => write!(f, "{p}/"),
            p => write!(f, "./{p}/"),
        }
    }
}

/// The path part of a host or thunk path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FileOrDir {
    File(FilePath),
    Dir(DirPath),
}

impl FileOrDir {
    /// A trailing slash (or a bare `.`) marks a directory.
    pub fn parse(text: &str) -> Self {
        if text.ends_with('/') || text == "." {
            FileOrDir::Dir(DirPath::new(text))
        } else {
            FileOrDir::File(FilePath::new(text))
        }
    }

    pub fn path(&self) -> &str {
        match self {
            FileOrDir::File(file) => &file.path,
            FileOrDir::Dir(dir) => &dir.path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileOrDir::Dir(_))
    }

    pub fn is_absolute(&self) -> bool {
        self.path().starts_with('/')
    }

    /// Append a relative child. Files cannot be extended.
    pub fn extend(&self, child: &FileOrDir) -> Option<FileOrDir> {
        let FileOrDir::Dir(dir) = self else {
            return None;
        };
        if child.is_absolute() {
            return None;
        }
        let joined = clean(&format!("{}/{}", dir.path, child.path()));
        Some(match child {
            FileOrDir::File(_) => FileOrDir::File(FilePath { path: joined }),
            FileOrDir::Dir(_) => FileOrDir::Dir(DirPath { path: joined }),
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            FileOrDir::File(file) => Value::File(file.clone()),
            FileOrDir::Dir(dir) => Value::Dir(dir.clone()),
        }
    }
}

impl fmt::Display for FileOrDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOrDir::File(file) => file.fmt(f),
            FileOrDir::Dir(dir) => dir.fmt(f),
        }
    }
}

/// A command resolved through `$PATH` at run time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommandPath {
    pub name: String,
}

impl CommandPath {
    pub fn new(name: &str) -> Self {
        CommandPath {
            name: name.to_string(),
        }
    }
}

impl fmt::Display for CommandPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".{}", self.name)
    }
}

/// A path relative to a directory on the invoking host.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostPath {
    pub context_dir: String,
    pub path: FileOrDir,
}

impl HostPath {
    pub fn new(context_dir: impl Into<String>, path: FileOrDir) -> Self {
        HostPath {
            context_dir: context_dir.into(),
            path,
        }
    }

    /// Absolute host location, refusing escapes from the context directory.
    pub fn resolve(&self) -> Result<PathBuf> {
        resolve_within(Path::new(&self.context_dir), self.path.path())
    }
}

impl fmt::Display for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<host: {}>/{}", self.context_dir, self.path.path())
    }
}

/// A file or directory inside the output of a thunk.
#[derive(Clone)]
pub struct ThunkPath {
    pub thunk: Arc<Thunk>,
    pub path: FileOrDir,
}

impl ThunkPath {
    pub fn new(thunk: Arc<Thunk>, path: FileOrDir) -> Self {
        ThunkPath { thunk, path }
    }

    pub fn equal(&self, other: &ThunkPath) -> bool {
        self.path == other.path && self.thunk.equal(&other.thunk)
    }
}

impl fmt::Display for ThunkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.thunk, self.path.path())
    }
}

impl fmt::Debug for ThunkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The reader's `sym/sub/path` form; evaluates its parent and extends it.
#[derive(Clone, Debug)]
pub struct ExtendPath {
    pub parent: Value,
    pub child: FileOrDir,
}

impl fmt::Display for ExtendPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.child.path())
    }
}

/// Extend a path-like value with a relative child path.
pub fn extend(parent: &Value, child: &FileOrDir) -> Result<Value> {
    let failed = || Error::Extend {
        parent: parent.clone(),
        child: child.to_value(),
    };
    match parent.inner() {
        Value::Dir(dir) => FileOrDir::Dir(dir.clone())
            .extend(child)
            .map(|path| path.to_value())
            .ok_or_else(failed),
        Value::Thunk(thunk) => FileOrDir::Dir(DirPath::root())
            .extend(child)
            .map(|path| Value::ThunkPath(Arc::new(ThunkPath::new(thunk.clone(), path))))
            .ok_or_else(failed),
        Value::ThunkPath(tp) => tp
            .path
            .extend(child)
            .map(|path| Value::ThunkPath(Arc::new(ThunkPath::new(tp.thunk.clone(), path))))
            .ok_or_else(failed),
        Value::Host(host) => host
            .path
            .extend(child)
            .map(|path| Value::Host(HostPath::new(host.context_dir.clone(), path)))
            .ok_or_else(failed),
        _ => Err(failed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_normalises() {
        assert_eq!(clean("./a//b/../c"), "a/c");
        assert_eq!(clean("."), ".");
        assert_eq!(clean("../x"), "../x");
        assert_eq!(clean("/a/../../b"), "/b");
        assert_eq!(clean("a/"), "a");
    }

    #[test]
    fn parse_and_render() {
        assert_eq!(FileOrDir::parse("./foo").to_string(), "./foo");
        assert_eq!(FileOrDir::parse("./foo/").to_string(), "./foo/");
        assert_eq!(FileOrDir::parse("/etc/hosts").to_string(), "/etc/hosts");
        assert_eq!(FileOrDir::parse("./").to_string(), "./");
    }

    #[test]
    fn files_cannot_be_extended() {
        let file = Value::File(FilePath::new("a"));
        let err = extend(&file, &FileOrDir::parse("b")).unwrap_err();
        assert!(matches!(err, Error::Extend { .. }));
    }

    #[test]
    fn dirs_extend_into_files_and_dirs() -> Result<()> {
        let dir = Value::Dir(DirPath::new("src"));
        let file = extend(&dir, &FileOrDir::parse("main.rs"))?;
        assert!(matches!(&file, Value::File(f) if f.path == "src/main.rs"));
        let sub = extend(&dir, &FileOrDir::parse("bin/"))?;
        assert!(matches!(&sub, Value::Dir(d) if d.path == "src/bin"));
        Ok(())
    }

    #[test]
    fn host_paths_refuse_escape() {
        let dir = tempfile::tempdir().unwrap();
        let context = dir.path().display().to_string();
        let inside = HostPath::new(context.clone(), FileOrDir::parse("a/b"));
        assert_eq!(inside.resolve().unwrap(), dir.path().join("a/b"));
        let outside = HostPath::new(context, FileOrDir::parse("../secret"));
        assert!(matches!(
            outside.resolve(),
            Err(Error::HostPathEscape { .. })
        ));
    }
}
