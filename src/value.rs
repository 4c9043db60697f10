//! The dynamically-typed value model.

use std::fmt;
use std::mem;
use std::sync::Arc;

use serde::ser::{Error as _, Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::annotated::Annotated;
use crate::combiner::{Applicative, Builtin, Operative};
use crate::error::{Error, Result};
use crate::path::{CommandPath, DirPath, ExtendPath, FilePath, HostPath, ThunkPath};
use crate::scope::Scope;
use crate::secret::Secret;
use crate::thunk::{Thunk, ThunkAddr};

/// An interned-by-value symbol name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: &str) -> Self {
        Symbol(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Symbol::new(name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

/// A list cell.
#[derive(Clone, Debug)]
pub struct Pair {
    pub a: Value,
    pub d: Value,
}

/// Unlink uniquely owned tails one cell at a time so long lists drop in
/// constant stack.
impl Drop for Pair {
    fn drop(&mut self) {
        let mut tail = mem::replace(&mut self.d, Value::Empty);
        loop {
            let cell = match tail {
                Value::Pair(cell) | Value::Cons(cell) => cell,
                _ => return,
            };
            match Arc::try_unwrap(cell) {
                Ok(mut next) => tail = mem::replace(&mut next.d, Value::Empty),
                Err(_) => return,
            }
        }
    }
}

#[derive(Clone)]
pub enum Value {
    Null,
    Ignore,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    Symbol(Symbol),
    Keyword(Symbol),
    Empty,
    /// `( )` cell; evaluates as a combination.
    Pair(Arc<Pair>),
    /// `[ ]` cell; evaluates each element.
    Cons(Arc<Pair>),
    /// `{ }` literal; evaluates to a scope.
    Bind(Arc<[Value]>),
    Scope(Scope),
    Operative(Arc<Operative>),
    Builtin(Arc<Builtin>),
    Applicative(Arc<Applicative>),
    Thunk(Arc<Thunk>),
    ThunkPath(Arc<ThunkPath>),
    ThunkAddr(Arc<ThunkAddr>),
    File(FilePath),
    Dir(DirPath),
    Command(CommandPath),
    Host(HostPath),
    ExtendPath(Arc<ExtendPath>),
    Secret(Secret),
    Annotated(Arc<Annotated>),
}

impl Value {
    pub fn string(text: &str) -> Value {
        Value::Str(Arc::from(text))
    }

    pub fn symbol(name: &str) -> Value {
        Value::Symbol(Symbol::new(name))
    }

    pub fn keyword(name: &str) -> Value {
        Value::Keyword(Symbol::new(name))
    }

    pub fn pair(a: Value, d: Value) -> Value {
        Value::Pair(Arc::new(Pair { a, d }))
    }

    pub fn thunk(thunk: Thunk) -> Value {
        Value::Thunk(Arc::new(thunk))
    }

    /// A proper list built from `items`.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Value {
        Value::list_with_tail(items, Value::Empty)
    }

    pub fn list_with_tail(items: impl IntoIterator<Item = Value>, tail: Value) -> Value {
        let items: Vec<Value> = items.into_iter().collect();
        items
            .into_iter()
            .rev()
            .fold(tail, |d, a| Value::Pair(Arc::new(Pair { a, d })))
    }

    pub fn cons_with_tail(items: impl IntoIterator<Item = Value>, tail: Value) -> Value {
        let items: Vec<Value> = items.into_iter().collect();
        items
            .into_iter()
            .rev()
            .fold(tail, |d, a| Value::Cons(Arc::new(Pair { a, d })))
    }

    /// Strip any annotation layers.
    pub fn inner(&self) -> &Value {
        let mut value = self;
        while let Value::Annotated(annotated) = value {
            value = &annotated.value;
        }
        value
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Ignore => "ignore",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Keyword(_) => "keyword",
            Value::Empty => "empty list",
            Value::Pair(_) => "pair",
            Value::Cons(_) => "cons",
            Value::Bind(_) => "bind",
            Value::Scope(_) => "scope",
            Value::Operative(_) => "operative",
            Value::Builtin(_) => "builtin",
            Value::Applicative(_) => "applicative",
            Value::Thunk(_) => "thunk",
            Value::ThunkPath(_) => "thunk path",
            Value::ThunkAddr(_) => "thunk addr",
            Value::File(_) => "file path",
            Value::Dir(_) => "dir path",
            Value::Command(_) => "command path",
            Value::Host(_) => "host path",
            Value::ExtendPath(_) => "extend path",
            Value::Secret(_) => "secret",
            Value::Annotated(annotated) => annotated.value.kind(),
        }
    }

    /// `false` and `null` are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self.inner(), Value::Bool(false) | Value::Null)
    }

    pub fn is_combiner(&self) -> bool {
        matches!(
            self.inner(),
            Value::Operative(_) | Value::Builtin(_) | Value::Applicative(_)
        )
    }

    /// Elements of a list and whatever terminates it (`Empty` for proper lists).
    pub fn list_parts(&self) -> (Vec<Value>, Value) {
        let mut items = Vec::new();
        let mut cur = self.inner().clone();
        loop {
            match cur {
                Value::Pair(cell) | Value::Cons(cell) => {
                    items.push(cell.a.clone());
                    cur = cell.d.inner().clone();
                }
                tail => return (items, tail),
            }
        }
    }

    /// Elements of a proper list.
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        let (items, tail) = self.list_parts();
        match tail {
            Value::Empty => Ok(items),
            _ => Err(Error::decode(self, "list")),
        }
    }

    pub fn equal(&self, other: &Value) -> bool {
        match (self.inner(), other.inner()) {
            (Value::Null, Value::Null)
            | (Value::Ignore, Value::Ignore)
            | (Value::Empty, Value::Empty) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            (
                a @ (Value::Pair(_) | Value::Cons(_)),
                b @ (Value::Pair(_) | Value::Cons(_)),
            ) => {
                let (xs, xt) = a.list_parts();
                let (ys, yt) = b.list_parts();
                xs.len() == ys.len()
                    && xs.iter().zip(ys.iter()).all(|(x, y)| x.equal(y))
                    && xt.equal(&yt)
            }
            (Value::Bind(a), Value::Bind(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equal(y))
            }
            (Value::Scope(a), Value::Scope(b)) => a.equal(b),
            (Value::Operative(a), Value::Operative(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => Arc::ptr_eq(a, b),
            (Value::Applicative(a), Value::Applicative(b)) => a.underlying.equal(&b.underlying),
            (Value::Thunk(a), Value::Thunk(b)) => a.equal(b),
            (Value::ThunkPath(a), Value::ThunkPath(b)) => a.equal(b),
            (Value::ThunkAddr(a), Value::ThunkAddr(b)) => {
                a.port == b.port && a.format == b.format && a.thunk.equal(&b.thunk)
            }
            (Value::File(a), Value::File(b)) => a == b,
            (Value::Dir(a), Value::Dir(b)) => a == b,
            (Value::Command(a), Value::Command(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => a == b,
            (Value::ExtendPath(a), Value::ExtendPath(b)) => {
                a.child == b.child && a.parent.equal(&b.parent)
            }
            (Value::Secret(a), Value::Secret(b)) => a == b,
            _ => false,
        }
    }

    /// Serialize as JSON, reporting the first value that refuses encoding.
    pub fn to_json(&self) -> Result<String> {
        if let Some(bad) = self.unencodable() {
            return Err(Error::Encode { value: bad });
        }
        serde_json::to_string(self).map_err(|_| Error::Encode {
            value: self.clone(),
        })
    }

    pub(crate) fn unencodable(&self) -> Option<Value> {
        match self {
            Value::Annotated(_)
            | Value::Operative(_)
            | Value::Builtin(_)
            | Value::Applicative(_)
            | Value::Bind(_)
            | Value::ExtendPath(_)
            | Value::Ignore => Some(self.clone()),
            Value::Pair(_) | Value::Cons(_) => {
                let (items, tail) = self.list_parts();
                if !matches!(tail, Value::Empty) {
                    return Some(self.clone());
                }
                items.iter().find_map(Value::unencodable)
            }
            Value::Scope(scope) => scope
                .visible_bindings()
                .iter()
                .find_map(|(_, value)| value.unencodable()),
            Value::Thunk(thunk) => thunk.unencodable(),
            Value::ThunkPath(tp) => tp.thunk.unencodable(),
            Value::ThunkAddr(addr) => addr.thunk.unencodable(),
            _ => None,
        }
    }

    /// Convert decoded JSON into values; objects become scopes.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::string(&n.to_string()),
            },
            serde_json::Value::String(s) => Value::string(&s),
            serde_json::Value::Array(items) => {
                Value::list(items.into_iter().map(Value::from_json))
            }
            serde_json::Value::Object(fields) => {
                let scope = Scope::empty();
                for (key, value) in fields {
                    scope.set(key.as_str(), Value::from_json(value));
                }
                Value::Scope(scope)
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    f.write_str("\"")?;
    for ch in text.chars() {
        match ch {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            other => write!(f, "{other}")?,
        }
    }
    f.write_str("\"")
}

fn write_cells(f: &mut fmt::Formatter<'_>, open: &str, close: &str, first: &Arc<Pair>) -> fmt::Result {
    f.write_str(open)?;
    let mut cell = first;
    loop {
        write!(f, "{}", cell.a)?;
        match &cell.d {
            Value::Pair(next) | Value::Cons(next) => {
                f.write_str(" ")?;
                cell = next;
            }
            Value::Empty => break,
            tail => {
                write!(f, " & {tail}")?;
                break;
            }
        }
    }
    f.write_str(close)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Ignore => f.write_str("_"),
            Value::Bool(true) => f.write_str("#t"),
            Value::Bool(false) => f.write_str("#f"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write_quoted(f, s),
            Value::Symbol(sym) => write!(f, "{sym}"),
            Value::Keyword(sym) => write!(f, ":{sym}"),
            Value::Empty => f.write_str("()"),
            Value::Pair(cell) => write_cells(f, "(", ")", cell),
            Value::Cons(cell) => write_cells(f, "[", "]", cell),
            Value::Bind(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("}")
            }
            Value::Scope(scope) => write!(f, "{scope}"),
            Value::Operative(op) => write!(f, "<op: {}>", op.name),
            Value::Builtin(builtin) => write!(f, "<builtin: {}>", builtin.name),
            Value::Applicative(app) => match app.underlying.inner() {
                Value::Operative(op) => write!(f, "<fn: {}>", op.name),
                Value::Builtin(builtin) => write!(f, "<fn: {}>", builtin.name),
                other => write!(f, "<fn: {other}>"),
            },
            Value::Thunk(thunk) => write!(f, "{thunk}"),
            Value::ThunkPath(tp) => write!(f, "{tp}"),
            Value::ThunkAddr(addr) => write!(f, "{addr}"),
            Value::File(file) => write!(f, "{file}"),
            Value::Dir(dir) => write!(f, "{dir}"),
            Value::Command(cmd) => write!(f, "{cmd}"),
            Value::Host(host) => write!(f, "{host}"),
            Value::ExtendPath(ext) => write!(f, "{ext}"),
            Value::Secret(secret) => write!(f, "{secret}"),
            Value::Annotated(annotated) => write!(f, "{}", annotated.value),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Symbol(sym) | Value::Keyword(sym) => serializer.serialize_str(sym.as_str()),
            Value::Empty => serializer.serialize_seq(Some(0))?.end(),
            Value::Pair(_) | Value::Cons(_) => {
                let items = self.to_vec().map_err(S::Error::custom)?;
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in &items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Scope(scope) => {
                let bindings = scope.visible_bindings();
                let mut map = serializer.serialize_map(Some(bindings.len()))?;
                for (key, value) in &bindings {
                    map.serialize_entry(key.as_str(), value)?;
                }
                map.end()
            }
            Value::Thunk(thunk) => thunk.serialize(serializer),
            Value::ThunkPath(tp) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("thunk", &*tp.thunk)?;
                map.serialize_entry("path", &tp.path.to_string())?;
                map.end()
            }
            Value::ThunkAddr(addr) => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("thunk", &*addr.thunk)?;
                map.serialize_entry("port", &addr.port)?;
                map.serialize_entry("format", &addr.format)?;
                map.end()
            }
            Value::File(file) => single_entry(serializer, "file", &file.to_string()),
            Value::Dir(dir) => single_entry(serializer, "dir", &dir.to_string()),
            Value::Command(cmd) => single_entry(serializer, "command", &cmd.name),
            Value::Host(host) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("host", &host.context_dir)?;
                map.serialize_entry("path", &host.path.to_string())?;
                map.end()
            }
            Value::Secret(secret) => secret.serialize(serializer),
            other => Err(S::Error::custom(Error::Encode {
                value: other.clone(),
            })),
        }
    }
}

fn single_entry<S: Serializer>(
    serializer: S,
    key: &str,
    value: &str,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(1))?;
    map.serialize_entry(key, value)?;
    map.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotated::Range;
    use pretty_assertions::assert_eq;

    #[test]
    fn long_lists_drop_without_recursion() {
        let list = Value::list((0..1_000_000).map(Value::Int));
        drop(list);

        let shared = Value::list((0..1_000_000).map(Value::Int));
        let Value::Pair(head) = &shared else {
            panic!("expected a pair");
        };
        let rest = head.d.clone();
        drop(shared);
        assert_eq!(rest.to_vec().map(|items| items.len()).ok(), Some(999_999));
    }

    #[test]
    fn lists_render_with_rest() {
        let list = Value::list([Value::Int(1), Value::string("two"), Value::keyword("three")]);
        assert_eq!(list.to_string(), r#"(1 "two" :three)"#);
        let improper = Value::list_with_tail([Value::Int(1)], Value::symbol("rest"));
        assert_eq!(improper.to_string(), "(1 & rest)");
        let cons = Value::cons_with_tail([Value::Int(1), Value::Int(2)], Value::Empty);
        assert_eq!(cons.to_string(), "[1 2]");
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(Value::string("a\"b\n").to_string(), r#""a\"b\n""#);
    }

    #[test]
    fn equality_sees_through_annotations() {
        let plain = Value::Int(5);
        let wrapped = Value::Annotated(Arc::new(Annotated::new(Value::Int(5), Range::default())));
        assert!(plain.equal(&wrapped));
        assert!(Value::list([Value::Int(1)]).equal(&Value::cons_with_tail([Value::Int(1)], Value::Empty)));
        assert!(!Value::Int(1).equal(&Value::string("1")));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::Empty.is_truthy());
    }

    #[test]
    fn json_encoding() -> Result<()> {
        let scope = Scope::empty();
        scope.set("a", Value::Int(1));
        scope.set("b", Value::list([Value::Bool(true), Value::Null]));
        assert_eq!(Value::Scope(scope).to_json()?, r#"{"a":1,"b":[true,null]}"#);
        Ok(())
    }

    #[test]
    fn annotated_values_refuse_json() {
        let wrapped = Value::Annotated(Arc::new(Annotated::new(Value::Int(5), Range::default())));
        let err = Value::list([wrapped]).to_json().unwrap_err();
        assert!(matches!(err, Error::Encode { .. }));
    }

    #[test]
    fn secrets_in_json_are_redacted() -> Result<()> {
        let secret = Value::Secret(Secret::new("token", "hunter2"));
        let json = Value::list([secret]).to_json()?;
        assert!(!json.contains("hunter2"));
        assert!(json.contains(r#""secret":"token""#));
        Ok(())
    }

    #[test]
    fn json_objects_become_scopes() {
        let json: serde_json::Value = serde_json::from_str(r#"{"x": [1, "y"]}"#).unwrap();
        let Value::Scope(scope) = Value::from_json(json) else {
            panic!("expected scope");
        };
        let x = scope.get(&Symbol::new("x")).unwrap();
        assert_eq!(x, Value::list([Value::Int(1), Value::string("y")]));
    }
}
