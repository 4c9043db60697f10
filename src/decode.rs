//! Viewing values as concrete Rust types.

use std::sync::Arc;

use crate::annotated::Annotated;
use crate::combiner::{Applicative, Operative};
use crate::error::{Error, Result};
use crate::path::{CommandPath, DirPath, FileOrDir, FilePath, HostPath, ThunkPath};
use crate::scope::Scope;
use crate::secret::Secret;
use crate::thunk::{Thunk, ThunkAddr};
use crate::value::{Symbol, Value};

/// A shape a [`Value`] can be viewed as.
///
/// `from_value` sees the value exactly as given, annotation included, and
/// returns `None` when the shape does not match.
pub trait FromValue: Sized {
    const NAME: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

impl Value {
    /// Decode into `T`, looking through annotations unless `T` wants them.
    pub fn decode<T: FromValue>(&self) -> Result<T> {
        let mut cur = self;
        loop {
            if let Some(out) = T::from_value(cur) {
                return Ok(out);
            }
            match cur {
                Value::Annotated(annotated) => cur = &annotated.value,
                _ => return Err(Error::decode(self, T::NAME)),
            }
        }
    }

    /// A name given as a symbol, keyword or string.
    pub fn decode_name(&self) -> Result<String> {
        match self.inner() {
            Value::Symbol(sym) | Value::Keyword(sym) => Ok(sym.as_str().to_string()),
            Value::Str(s) => Ok(s.to_string()),
            _ => Err(Error::decode(self, "name")),
        }
    }
}

impl FromValue for Value {
    const NAME: &'static str = "value";

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for i64 {
    const NAME: &'static str = "int";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl FromValue for bool {
    const NAME: &'static str = "bool";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromValue for String {
    const NAME: &'static str = "string";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(s.to_string()),
            _ => None,
        }
    }
}

impl FromValue for Symbol {
    const NAME: &'static str = "symbol";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Symbol(sym) => Some(sym.clone()),
            _ => None,
        }
    }
}

impl FromValue for Scope {
    const NAME: &'static str = "scope";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Scope(scope) => Some(scope.clone()),
            _ => None,
        }
    }
}

impl FromValue for Arc<Thunk> {
    const NAME: &'static str = "thunk";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Thunk(thunk) => Some(thunk.clone()),
            _ => None,
        }
    }
}

impl FromValue for Arc<ThunkPath> {
    const NAME: &'static str = "thunk path";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::ThunkPath(tp) => Some(tp.clone()),
            _ => None,
        }
    }
}

impl FromValue for Arc<ThunkAddr> {
    const NAME: &'static str = "thunk addr";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::ThunkAddr(addr) => Some(addr.clone()),
            _ => None,
        }
    }
}

impl FromValue for FilePath {
    const NAME: &'static str = "file path";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::File(file) => Some(file.clone()),
            _ => None,
        }
    }
}

impl FromValue for DirPath {
    const NAME: &'static str = "dir path";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Dir(dir) => Some(dir.clone()),
            _ => None,
        }
    }
}

impl FromValue for FileOrDir {
    const NAME: &'static str = "file or dir path";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::File(file) => Some(FileOrDir::File(file.clone())),
            Value::Dir(dir) => Some(FileOrDir::Dir(dir.clone())),
            _ => None,
        }
    }
}

impl FromValue for CommandPath {
    const NAME: &'static str = "command path";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Command(cmd) => Some(cmd.clone()),
            _ => None,
        }
    }
}

impl FromValue for HostPath {
    const NAME: &'static str = "host path";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Host(host) => Some(host.clone()),
            _ => None,
        }
    }
}

impl FromValue for Secret {
    const NAME: &'static str = "secret";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Secret(secret) => Some(secret.clone()),
            _ => None,
        }
    }
}

impl FromValue for Arc<Annotated> {
    const NAME: &'static str = "annotated";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Annotated(annotated) => Some(annotated.clone()),
            _ => None,
        }
    }
}

impl FromValue for Arc<Applicative> {
    const NAME: &'static str = "applicative";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Applicative(app) => Some(app.clone()),
            _ => None,
        }
    }
}

impl FromValue for Arc<Operative> {
    const NAME: &'static str = "operative";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Operative(op) => Some(op.clone()),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const NAME: &'static str = T::NAME;

    fn from_value(value: &Value) -> Option<Self> {
        match value.inner() {
            Value::Null => Some(None),
            _ => value.decode::<T>().ok().map(Some),
        }
    }
}

/// All-or-nothing: every element must decode.
impl<T: FromValue> FromValue for Vec<T> {
    const NAME: &'static str = "list";

    fn from_value(value: &Value) -> Option<Self> {
        value
            .to_vec()
            .ok()?
            .iter()
            .map(|item| item.decode::<T>().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotated::Range;

    #[test]
    fn decode_reports_destination() {
        let err = Value::string("x").decode::<i64>().unwrap_err();
        assert_eq!(err.to_string(), r#"cannot decode "x" (string) into int"#);
    }

    #[test]
    fn annotations_are_transparent() -> Result<()> {
        let wrapped = Value::Annotated(Arc::new(Annotated::new(Value::Int(3), Range::default())));
        assert_eq!(wrapped.decode::<i64>()?, 3);
        assert!(wrapped.decode::<Arc<Annotated>>().is_ok());
        Ok(())
    }

    #[test]
    fn lists_decode_all_or_nothing() -> Result<()> {
        let ints = Value::list([Value::Int(1), Value::Int(2)]);
        assert_eq!(ints.decode::<Vec<i64>>()?, vec![1, 2]);
        let mixed = Value::list([Value::Int(1), Value::string("2")]);
        assert!(mixed.decode::<Vec<i64>>().is_err());
        assert_eq!(Value::Empty.decode::<Vec<i64>>()?, Vec::<i64>::new());
        Ok(())
    }

    #[test]
    fn optional_values() -> Result<()> {
        assert_eq!(Value::Null.decode::<Option<i64>>()?, None);
        assert_eq!(Value::Int(4).decode::<Option<i64>>()?, Some(4));
        Ok(())
    }
}
