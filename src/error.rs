//! Error taxonomy for evaluation and thunk execution, plus terminal rendering.

use std::io::{self, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::annotated::Range;
use crate::eval::Trace;
use crate::scope::Scope;
use crate::suggest;
use crate::thunk::Platform;
use crate::value::{Symbol, Value};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the evaluator or a runtime can produce.
///
/// Errors are cloneable so that one failed execution can be delivered to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("cannot decode {value} ({kind}) into {destination}", kind = .value.kind())]
    Decode {
        value: Value,
        destination: &'static str,
    },

    #[error("unbound symbol: {symbol}")]
    Unbound { symbol: Symbol, scope: Scope },

    #[error("{}", arity_message(.name, *.need, *.variadic, *.have))]
    Arity {
        name: String,
        need: usize,
        variadic: bool,
        have: usize,
    },

    #[error("bind: need {need}, have {have}")]
    BindMismatch { need: Value, have: Value },

    #[error("bind: cannot bind to {have}")]
    CannotBind { have: Value },

    #[error("cannot encode {kind}: {value}", kind = .value.kind())]
    Encode { value: Value },

    #[error(
        "cannot extend path {parent} ({pk}) with {child} ({ck})",
        pk = .parent.kind(),
        ck = .child.kind()
    )]
    Extend { parent: Value, child: Value },

    #[error("{}", structured_message(.message, .fields))]
    Structured { message: String, fields: Scope },

    #[error("{range}: {message}")]
    Read { message: String, range: Range },

    #[error("attempted to escape {context_dir} by opening {attempted}")]
    HostPathEscape {
        context_dir: String,
        attempted: String,
    },

    #[error("interrupted")]
    Interrupted,

    #[error("no runtime for platform {}", platform_label(.platform))]
    NoRuntime { platform: Option<Platform> },

    #[error("{runtime} runtime unavailable: {message}")]
    Unavailable { runtime: String, message: String },

    #[error("thunk {thunk} exited with status {code}")]
    Exit { code: i32, thunk: String },

    #[error("{runtime} runtime does not support {operation}")]
    Unsupported {
        runtime: String,
        operation: &'static str,
    },

    #[error("{runtime}: {message}")]
    Runtime { runtime: String, message: String },

    #[error("malformed wire data: {0}")]
    Wire(String),

    #[error("{}", aggregate_message(.0))]
    Aggregate(Vec<Error>),

    #[error(transparent)]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    pub fn decode(value: &Value, destination: &'static str) -> Self {
        Error::Decode {
            value: value.clone(),
            destination,
        }
    }

    pub fn runtime(runtime: &str, message: impl Into<String>) -> Self {
        Error::Runtime {
            runtime: runtime.to_string(),
            message: message.into(),
        }
    }

    pub fn unavailable(runtime: &str, message: impl Into<String>) -> Self {
        Error::Unavailable {
            runtime: runtime.to_string(),
            message: message.into(),
        }
    }

    /// A user-raised error with no fields.
    pub fn message(message: impl Into<String>) -> Self {
        Error::Structured {
            message: message.into(),
            fields: Scope::empty(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

fn arity_message(name: &str, need: usize, variadic: bool, have: usize) -> String {
    if variadic {
        format!("{name} arity: need at least {need} arguments, given {have}")
    } else {
        format!("{name} arity: need {need} arguments, given {have}")
    }
}

fn structured_message(message: &str, fields: &Scope) -> String {
    if fields.is_empty() {
        message.to_string()
    } else {
        format!("{message}; fields: {fields}")
    }
}

fn platform_label(platform: &Option<Platform>) -> String {
    match platform {
        Some(platform) => platform.to_string(),
        None => "(none)".to_string(),
    }
}

fn aggregate_message(errors: &[Error]) -> String {
    let mut out = format!("{} errors occurred:", errors.len());
    for err in errors {
        out.push_str("\n\t* ");
        out.push_str(&err.to_string());
    }
    out
}

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const FAINT: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// Colourised, human-oriented rendering of an error.
pub trait NiceError {
    fn nice_error(&self, w: &mut dyn Write) -> io::Result<()>;
}

impl NiceError for Error {
    fn nice_error(&self, w: &mut dyn Write) -> io::Result<()> {
        match self {
            Error::Unbound { symbol, scope } => {
                writeln!(w, "{RED}{self}{RESET}")?;
                let similar = suggest::similar_bindings(symbol, scope);
                if similar.is_empty() {
                    return Ok(());
                }
                writeln!(w)?;
                writeln!(w, "similar bindings:")?;
                writeln!(w)?;
                for (name, score) in &similar {
                    if *score > 0.8 {
                        writeln!(w, "* {BOLD}{name}{RESET}")?;
                    } else if *score < 0.6 {
                        writeln!(w, "* {FAINT}{name}{RESET}")?;
                    } else {
                        writeln!(w, "* {name}")?;
                    }
                }
                writeln!(w)?;
                writeln!(w, "did you mean {BOLD}{}{RESET}, perchance?", similar[0].0)
            }
            Error::Structured { message, fields } => {
                writeln!(w, "{RED}{message}{RESET}")?;
                let bindings = fields.bindings();
                if bindings.is_empty() {
                    return Ok(());
                }
                writeln!(w)?;
                for (key, value) in bindings {
                    writeln!(w, "{YELLOW}:{key}{RESET} {value}")?;
                }
                Ok(())
            }
            Error::Arity {
                name,
                need,
                variadic,
                have,
            } => {
                writeln!(w, "{RED}{self}{RESET}")?;
                writeln!(w)?;
                let at_least = if *variadic { "at least " } else { "" };
                writeln!(
                    w,
                    "{name} takes {at_least}{need} argument{}, but {have} {} supplied",
                    if *need == 1 { "" } else { "s" },
                    if *have == 1 { "was" } else { "were" },
                )
            }
            Error::Aggregate(errors) => {
                writeln!(w, "{RED}{} errors occurred:{RESET}", errors.len())?;
                for err in errors {
                    writeln!(w)?;
                    err.nice_error(w)?;
                }
                Ok(())
            }
            _ => writeln!(w, "{RED}{self}{RESET}"),
        }
    }
}

/// Render an error followed by the most recent evaluation frames.
pub fn write_error(w: &mut dyn Write, err: &Error, trace: Option<&Trace>) -> io::Result<()> {
    if let Some(trace) = trace {
        let frames = trace.frames();
        if !frames.is_empty() {
            writeln!(w, "{FAINT}error!{RESET} call trace (oldest first):")?;
            writeln!(w)?;
            for frame in frames.iter().rev().take(10).rev() {
                writeln!(w, "  {FAINT}{}{RESET} {}", frame.range, frame.value)?;
            }
            writeln!(w)?;
        }
    }
    err.nice_error(w)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(err: &Error) -> String {
        let mut out = Vec::new();
        err.nice_error(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn arity_messages() {
        let fixed = Error::Arity {
            name: "if".into(),
            need: 3,
            variadic: false,
            have: 4,
        };
        assert_eq!(fixed.to_string(), "if arity: need 3 arguments, given 4");
        let variadic = Error::Arity {
            name: "defn".into(),
            need: 2,
            variadic: true,
            have: 1,
        };
        assert_eq!(
            variadic.to_string(),
            "defn arity: need at least 2 arguments, given 1"
        );
    }

    #[test]
    fn unbound_suggests_close_names() {
        let scope = Scope::empty();
        for name in ["foo", "bar", "baz", "qux"] {
            scope.set(name, Value::Int(1));
        }
        let err = Error::Unbound {
            symbol: Symbol::new("fo"),
            scope,
        };
        let text = render(&err);
        assert!(text.contains("unbound symbol: fo"));
        assert!(text.contains("similar bindings:"));
        assert!(text.contains("foo"));
        assert!(!text.contains("bar"));
        assert!(text.contains("perchance?"));
    }

    #[test]
    fn structured_fields_render_as_keywords() {
        let fields = Scope::empty();
        fields.set("code", Value::Int(42));
        let err = Error::Structured {
            message: "boom".into(),
            fields,
        };
        assert_eq!(err.to_string(), "boom; fields: {:code 42}");
        assert!(render(&err).contains(":code"));
    }

    #[test]
    fn io_errors_are_cloneable() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        let copy = err.clone();
        assert_eq!(copy.to_string(), "gone");
    }
}
