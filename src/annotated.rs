//! Source positions and annotated values.

use std::fmt;
use std::sync::Arc;

use crate::value::Value;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Position {
    pub file: Arc<str>,
    pub line: usize,
    pub col: usize,
}

/// A span of source text; `end` is exclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}:{}", self.start, self.end.line, self.end.col)
    }
}

/// A value carrying its source range and an optional preceding comment.
#[derive(Clone, Debug)]
pub struct Annotated {
    pub value: Value,
    pub range: Range,
    pub comment: Option<String>,
}

impl Annotated {
    pub fn new(value: Value, range: Range) -> Self {
        Annotated {
            value,
            range,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}
