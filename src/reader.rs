//! Source text to annotated value trees.

use std::sync::Arc;

use crate::annotated::{Annotated, Position, Range};
use crate::error::{Error, Result};
use crate::path::{CommandPath, ExtendPath, FileOrDir};
use crate::value::Value;

/// Read every top-level form in `source`.
pub fn read_all(source: &str, file: &str) -> Result<Vec<Value>> {
    let mut reader = Reader::new(source, file);
    let mut forms = Vec::new();
    while let Some(form) = reader.next_form()? {
        forms.push(form);
    }
    Ok(forms)
}

struct Reader {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    file: Arc<str>,
}

const DELIMITERS: &[char] = &['(', ')', '[', ']', '{', '}', '"', ';'];

impl Reader {
    fn new(source: &str, file: &str) -> Self {
        Reader {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            file: Arc::from(file),
        }
    }

    fn position(&self) -> Position {
        Position {
            file: self.file.clone(),
            line: self.line,
            col: self.col,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn error(&self, start: Position, message: impl Into<String>) -> Error {
        Error::Read {
            message: message.into(),
            range: Range {
                start,
                end: self.position(),
            },
        }
    }

    /// Skip whitespace and comments. A comment block directly above the next
    /// form (no blank line between) is returned.
    fn skip_space(&mut self) -> Option<String> {
        let mut comment: Vec<String> = Vec::new();
        let mut newlines = 0;
        while let Some(ch) = self.peek() {
            if ch == ';' {
                let mut text = String::new();
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    text.push(c);
                    self.bump();
                }
                if newlines > 1 {
                    comment.clear();
                }
                newlines = 0;
                let text = text.trim_start_matches(';');
                comment.push(text.strip_prefix(' ').unwrap_or(text).to_string());
            } else if ch.is_whitespace() {
                if ch == '\n' {
                    newlines += 1;
                }
                self.bump();
            } else {
                break;
            }
        }
        if comment.is_empty() || newlines > 1 {
            None
        } else {
            Some(comment.join("\n"))
        }
    }

    fn next_form(&mut self) -> Result<Option<Value>> {
        let comment = self.skip_space();
        if self.peek().is_none() {
            return Ok(None);
        }
        let start = self.position();
        let value = self.read_value(start.clone())?;
        let range = Range {
            start,
            end: self.position(),
        };
        let mut annotated = Annotated::new(value, range);
        annotated.comment = comment;
        Ok(Some(Value::Annotated(Arc::new(annotated))))
    }

    fn read_value(&mut self, start: Position) -> Result<Value> {
        match self.peek() {
            Some('(') => {
                self.bump();
                let (items, tail) = self.read_seq(')', start)?;
                Ok(if items.is_empty() && matches!(tail, Value::Empty) {
                    Value::Empty
                } else {
                    Value::list_with_tail(items, tail)
                })
            }
            Some('[') => {
                self.bump();
                let (items, tail) = self.read_seq(']', start)?;
                Ok(if items.is_empty() && matches!(tail, Value::Empty) {
                    Value::Empty
                } else {
                    Value::cons_with_tail(items, tail)
                })
            }
            Some('{') => {
                self.bump();
                let (items, tail) = self.read_seq('}', start.clone())?;
                if !matches!(tail, Value::Empty) {
                    return Err(self.error(start, "`&` is not allowed in a bind literal"));
                }
                Ok(Value::Bind(items.into()))
            }
            Some(close @ (')' | ']' | '}')) => {
                self.bump();
                Err(self.error(start, format!("unexpected `{close}`")))
            }
            Some('"') => {
                self.bump();
                self.read_string(start)
            }
            Some(_) => {
                let token = self.read_token();
                Ok(atom(&token))
            }
            None => Err(self.error(start, "unexpected end of input")),
        }
    }

    fn read_seq(&mut self, close: char, start: Position) -> Result<(Vec<Value>, Value)> {
        let mut items = Vec::new();
        loop {
            self.skip_space();
            match self.peek() {
                None => return Err(self.error(start, format!("missing `{close}`"))),
                Some(ch) if ch == close => {
                    self.bump();
                    return Ok((items, Value::Empty));
                }
                _ => {}
            }
            let form = self
                .next_form()?
                .ok_or_else(|| self.error(start.clone(), format!("missing `{close}`")))?;
            if matches!(form.inner(), Value::Symbol(sym) if sym.as_str() == "&") {
                self.skip_space();
                let tail = self
                    .next_form()?
                    .ok_or_else(|| self.error(start.clone(), "missing form after `&`"))?;
                self.skip_space();
                if self.peek() != Some(close) {
                    return Err(self.error(start, format!("expected `{close}` after rest form")));
                }
                self.bump();
                return Ok((items, tail));
            }
            items.push(form);
        }
    }

    fn read_string(&mut self, start: Position) -> Result<Value> {
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(start, "unterminated string")),
                Some('"') => return Ok(Value::string(&text)),
                Some('\\') => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('"') => text.push('"'),
                    Some('\\') => text.push('\\'),
                    Some(other) => {
                        return Err(self.error(start, format!("unknown escape `\\{other}`")));
                    }
                    None => return Err(self.error(start, "unterminated string")),
                },
                Some(ch) => text.push(ch),
            }
        }
    }

    fn read_token(&mut self) -> String {
        let mut token = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() || DELIMITERS.contains(&ch) {
                break;
            }
            token.push(ch);
            self.bump();
        }
        token
    }
}

fn atom(token: &str) -> Value {
    match token {
        "#t" => return Value::Bool(true),
        "#f" => return Value::Bool(false),
        "null" => return Value::Null,
        "_" => return Value::Ignore,
        _ => {}
    }
    if let Ok(n) = token.parse::<i64>() {
        return Value::Int(n);
    }
    if let Some(name) = token.strip_prefix(':') {
        if !name.is_empty() {
            return Value::keyword(name);
        }
    }
    if token.starts_with("./") || token.starts_with("../") || (token.starts_with('/') && token.len() > 1) {
        return FileOrDir::parse(token).to_value();
    }
    if let Some(name) = token.strip_prefix('.') {
        if !name.is_empty() && !name.starts_with('.') {
            return Value::Command(CommandPath::new(name));
        }
    }
    if let Some((parent, child)) = token.split_once('/') {
        if !parent.is_empty() && !child.is_empty() {
            return Value::ExtendPath(Arc::new(ExtendPath {
                parent: Value::symbol(parent),
                child: FileOrDir::parse(child),
            }));
        }
    }
    Value::symbol(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{DirPath, FilePath};
    use pretty_assertions::assert_eq;

    fn read_one(source: &str) -> Value {
        let mut forms = read_all(source, "test.kiln").unwrap();
        assert_eq!(forms.len(), 1);
        forms.remove(0)
    }

    #[test]
    fn atoms() {
        assert_eq!(read_one("42"), Value::Int(42));
        assert_eq!(read_one("-7"), Value::Int(-7));
        assert_eq!(read_one("-"), Value::symbol("-"));
        assert_eq!(read_one("#t"), Value::Bool(true));
        assert_eq!(read_one("null"), Value::Null);
        assert_eq!(read_one("_"), Value::Ignore);
        assert_eq!(read_one(":name"), Value::keyword("name"));
        assert_eq!(read_one(r#""a\n\"b\"""#), Value::string("a\n\"b\""));
    }

    #[test]
    fn paths() {
        assert_eq!(read_one("./foo"), Value::File(FilePath::new("foo")));
        assert_eq!(read_one("./foo/"), Value::Dir(DirPath::new("foo")));
        assert_eq!(read_one("/bin/sh"), Value::File(FilePath::new("/bin/sh")));
        assert_eq!(read_one(".echo"), Value::Command(CommandPath::new("echo")));
        let Value::ExtendPath(ext) = read_one("src/main.rs").inner().clone() else {
            panic!("expected extend path");
        };
        assert_eq!(ext.parent, Value::symbol("src"));
        assert_eq!(ext.child, FileOrDir::parse("main.rs"));
    }

    #[test]
    fn lists_and_rest() {
        let form = read_one("(a b & c)");
        assert_eq!(form.to_string(), "(a b & c)");
        assert_eq!(read_one("[1 2]").to_string(), "[1 2]");
        assert_eq!(read_one("{:a 1}").to_string(), "{:a 1}");
        assert_eq!(read_one("()"), Value::Empty);
    }

    #[test]
    fn ranges_and_comments() {
        let forms = read_all("; first\n; second\n(x)\n\n; detached\n\n(y)", "f.kiln").unwrap();
        let Value::Annotated(first) = &forms[0] else {
            panic!("expected annotation");
        };
        assert_eq!(first.comment.as_deref(), Some("first\nsecond"));
        assert_eq!(first.range.start.line, 3);
        assert_eq!(first.range.start.col, 1);
        assert_eq!(first.range.end.col, 4);
        let Value::Annotated(second) = &forms[1] else {
            panic!("expected annotation");
        };
        assert_eq!(second.comment, None);
    }

    #[test]
    fn malformed_input_reports_range() {
        let err = read_all("(a b", "bad.kiln").unwrap_err();
        match err {
            Error::Read { message, range } => {
                assert_eq!(message, "missing `)`");
                assert_eq!(range.start.line, 1);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(read_all(")", "bad.kiln").is_err());
        assert!(read_all("\"open", "bad.kiln").is_err());
    }
}
