//! Continuation-passing evaluation driven by a trampoline.
//!
//! Every evaluation step returns a [`Ready`] instead of recursing, so deep
//! program recursion never consumes host stack.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::annotated::{Annotated, Range};
use crate::combiner;
use crate::error::{Error, Result};
use crate::path;
use crate::reader;
use crate::runtime::Runtime;
use crate::scope::Scope;
use crate::sink::{MemorySink, Sink};
use crate::value::Value;

/// Number of evaluation frames kept for error reports.
pub const TRACE_DEPTH: usize = 1000;

/// Shared cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub value: Value,
    pub range: Range,
}

/// A bounded record of recently evaluated annotated forms. Oldest frames are
/// dropped first.
#[derive(Clone, Debug)]
pub struct Trace {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl Trace {
    pub fn new(capacity: usize) -> Self {
        Trace {
            frames: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn record(&mut self, frame: Frame) {
        if self.capacity == 0 {
            return;
        }
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Frames from oldest to newest.
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Per-evaluation state threaded through every step: cancellation, the frame
/// trace, the runtime used to run thunks and the sink for emitted values.
#[derive(Clone)]
pub struct Context {
    cancel: CancelToken,
    trace: Arc<Mutex<Trace>>,
    runtime: Option<Arc<dyn Runtime>>,
    sink: Arc<dyn Sink>,
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Context {
            cancel: CancelToken::new(),
            trace: Arc::new(Mutex::new(Trace::new(TRACE_DEPTH))),
            runtime: None,
            sink: Arc::new(MemorySink::default()),
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fails with [`Error::Interrupted`] once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn runtime(&self) -> Result<&Arc<dyn Runtime>> {
        self.runtime
            .as_ref()
            .ok_or(Error::NoRuntime { platform: None })
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub fn push_frame(&self, annotated: &Annotated) {
        self.trace.lock().record(Frame {
            value: annotated.value.clone(),
            range: annotated.range.clone(),
        });
    }

    pub fn trace(&self) -> Trace {
        self.trace.lock().clone()
    }
}

/// Either a finished result or a suspended step.
pub enum Ready {
    Done(Result<Value>),
    Step(Box<dyn FnOnce() -> Ready>),
}

impl Ready {
    pub fn fail(err: Error) -> Ready {
        Ready::Done(Err(err))
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ready::Done(result) => write!(f, "Done({result:?})"),
            Ready::Step(_) => f.write_str("Step(..)"),
        }
    }
}

/// What to do with a value once it is known.
pub struct Cont(Box<dyn FnOnce(Value) -> Ready>);

impl Cont {
    pub fn new(f: impl FnOnce(Value) -> Ready + 'static) -> Self {
        Cont(Box::new(f))
    }

    /// The final continuation: the value becomes the result.
    pub fn done() -> Self {
        Cont::new(|value| Ready::Done(Ok(value)))
    }

    /// Deliver a value. The call is suspended so the caller's frame unwinds
    /// before the continuation runs.
    pub fn call(self, value: Value) -> Ready {
        Ready::Step(Box::new(move || (self.0)(value)))
    }
}

/// Force steps until a result appears, checking cancellation before each.
pub fn trampoline(ctx: &Context, mut ready: Ready) -> Result<Value> {
    loop {
        match ready {
            Ready::Done(result) => return result,
            Ready::Step(step) => {
                ctx.check()?;
                ready = step();
            }
        }
    }
}

pub fn eval(ctx: &Context, value: Value, scope: &Scope, cont: Cont) -> Ready {
    match value {
        Value::Symbol(symbol) => match scope.get(&symbol) {
            Some(found) => cont.call(found),
            None => Ready::fail(Error::Unbound {
                symbol,
                scope: scope.clone(),
            }),
        },
        Value::Pair(cell) => {
            let operands = cell.d.clone();
            let ctx2 = ctx.clone();
            let scope2 = scope.clone();
            eval(
                ctx,
                cell.a.clone(),
                scope,
                Cont::new(move |combiner| combiner::call(&ctx2, combiner, operands, &scope2, cont)),
            )
        }
        Value::Cons(_) => {
            let (mut items, tail) = value.list_parts();
            let has_tail = !matches!(tail, Value::Empty);
            if has_tail {
                items.push(tail);
            }
            eval_each(
                ctx,
                items,
                scope,
                Box::new(move |mut values| {
                    let tail = if has_tail {
                        values.pop().unwrap_or(Value::Empty)
                    } else {
                        Value::Empty
                    };
                    cont.call(Value::list_with_tail(values, tail))
                }),
            )
        }
        Value::Bind(entries) => eval_bind(ctx, &entries, scope, cont),
        Value::ExtendPath(ext) => {
            let child = ext.child.clone();
            eval(
                ctx,
                ext.parent.clone(),
                scope,
                Cont::new(move |parent| match path::extend(&parent, &child) {
                    Ok(extended) => cont.call(extended),
                    Err(err) => Ready::fail(err),
                }),
            )
        }
        Value::Annotated(annotated) => eval_annotated(ctx, annotated, scope, cont),
        other => cont.call(other),
    }
}

fn eval_annotated(ctx: &Context, annotated: Arc<Annotated>, scope: &Scope, cont: Cont) -> Ready {
    ctx.push_frame(&annotated);
    let next = match &annotated.comment {
        Some(comment) => {
            let scope = scope.clone();
            let comment = comment.clone();
            let range = annotated.range.clone();
            Cont::new(move |result| {
                if let Value::Symbol(symbol) = result.inner() {
                    scope.set_doc(symbol, &comment);
                }
                scope.comment(Annotated {
                    value: result.clone(),
                    range,
                    comment: Some(comment),
                });
                cont.call(result)
            })
        }
        None => cont,
    };
    eval(ctx, annotated.value.clone(), scope, next)
}

fn eval_bind(ctx: &Context, entries: &[Value], scope: &Scope, cont: Cont) -> Ready {
    if entries.len() % 2 != 0 {
        return Ready::fail(Error::message(format!(
            "odd number of entries in {}",
            Value::Bind(entries.into())
        )));
    }
    let mut keys = Vec::with_capacity(entries.len() / 2);
    let mut values = Vec::with_capacity(entries.len() / 2);
    for entry in entries.chunks(2) {
        match entry[0].inner() {
            Value::Keyword(sym) | Value::Symbol(sym) => keys.push(sym.clone()),
            _ => return Ready::fail(Error::decode(&entry[0], "keyword")),
        }
        values.push(entry[1].clone());
    }
    eval_each(
        ctx,
        values,
        scope,
        Box::new(move |values| {
            let built = Scope::empty();
            for (key, value) in keys.into_iter().zip(values) {
                built.set(key, value);
            }
            cont.call(Value::Scope(built))
        }),
    )
}

/// Evaluate `items` left to right, each as its own step, then hand the
/// results to `done`.
pub fn eval_each(
    ctx: &Context,
    items: Vec<Value>,
    scope: &Scope,
    done: Box<dyn FnOnce(Vec<Value>) -> Ready>,
) -> Ready {
    let capacity = items.len();
    step_each(
        ctx.clone(),
        items.into_iter(),
        Vec::with_capacity(capacity),
        scope.clone(),
        done,
    )
}

fn step_each(
    ctx: Context,
    mut rest: std::vec::IntoIter<Value>,
    mut acc: Vec<Value>,
    scope: Scope,
    done: Box<dyn FnOnce(Vec<Value>) -> Ready>,
) -> Ready {
    match rest.next() {
        None => done(acc),
        Some(item) => {
            let ctx2 = ctx.clone();
            let scope2 = scope.clone();
            eval(
                &ctx,
                item,
                &scope,
                Cont::new(move |value| {
                    acc.push(value);
                    step_each(ctx2, rest, acc, scope2, done)
                }),
            )
        }
    }
}

/// Evaluate forms in order; the last form receives `cont` directly. An empty
/// sequence yields null.
pub fn eval_sequence(ctx: &Context, forms: Vec<Value>, scope: &Scope, cont: Cont) -> Ready {
    let mut forms = forms.into_iter();
    match forms.next() {
        None => cont.call(Value::Null),
        Some(first) => sequence_from(ctx.clone(), first, forms, scope.clone(), cont),
    }
}

fn sequence_from(
    ctx: Context,
    form: Value,
    mut rest: std::vec::IntoIter<Value>,
    scope: Scope,
    cont: Cont,
) -> Ready {
    if rest.len() == 0 {
        return eval(&ctx, form, &scope, cont);
    }
    let ctx2 = ctx.clone();
    let scope2 = scope.clone();
    eval(
        &ctx,
        form,
        &scope,
        Cont::new(move |_| match rest.next() {
            Some(next) => sequence_from(ctx2, next, rest, scope2, cont),
            None => cont.call(Value::Null),
        }),
    )
}

/// Evaluate a single value to completion.
pub fn eval_value(ctx: &Context, value: Value, scope: &Scope) -> Result<Value> {
    trampoline(ctx, eval(ctx, value, scope, Cont::done()))
}

/// Evaluate forms in order, returning the last result.
pub fn eval_all(ctx: &Context, forms: Vec<Value>, scope: &Scope) -> Result<Value> {
    trampoline(ctx, eval_sequence(ctx, forms, scope, Cont::done()))
}

/// Read and evaluate source text.
pub fn eval_source(ctx: &Context, source: &str, file: &str, scope: &Scope) -> Result<Value> {
    let forms = reader::read_all(source, file)?;
    eval_all(ctx, forms, scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ground;
    use crate::value::Symbol;
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Duration;

    fn run(source: &str) -> Result<Value> {
        let scope = ground::standard();
        eval_source(&Context::new(), source, "test.kiln", &scope)
    }

    #[test]
    fn self_evaluating_values() -> Result<()> {
        assert_eq!(run("42")?, Value::Int(42));
        assert_eq!(run(r#""hi""#)?, Value::string("hi"));
        assert_eq!(run(":kw")?, Value::keyword("kw"));
        assert_eq!(run("")?, Value::Null);
        Ok(())
    }

    #[test]
    fn unbound_symbols_carry_the_scope() {
        let err = run("nope").unwrap_err();
        match err {
            Error::Unbound { symbol, .. } => assert_eq!(symbol, Symbol::new("nope")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cons_and_bind_literals() -> Result<()> {
        assert_eq!(
            run("(def x 2) [1 x 3]")?,
            Value::list([Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        let Value::Scope(scope) = run("{:a (+ 1 2) :b \"x\"}")? else {
            panic!("expected scope");
        };
        assert_eq!(scope.get(&Symbol::new("a")), Some(Value::Int(3)));
        Ok(())
    }

    #[test]
    fn operands_evaluate_left_to_right() -> Result<()> {
        let sink = Arc::new(MemorySink::default());
        let ctx = Context::new().with_sink(sink.clone());
        let out = eval_source(
            &ctx,
            "(list (emit 1) (emit 2) (emit 3))",
            "t.kiln",
            &ground::standard(),
        )?;
        assert_eq!(out, Value::list([Value::Null, Value::Null, Value::Null]));
        assert_eq!(sink.values(), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        Ok(())
    }

    #[test]
    fn deep_tail_recursion_is_stack_safe() -> Result<()> {
        let out = run(
            r#"
            (defn count-down (n)
              (if (= n 0) :done (count-down (- n 1))))
            (count-down 1000000)
            "#,
        )?;
        assert_eq!(out, Value::keyword("done"));
        Ok(())
    }

    #[test]
    fn comments_document_definitions() -> Result<()> {
        let scope = ground::standard();
        let ctx = Context::new();
        eval_source(&ctx, "; adds one\n(defn inc (x) (+ x 1))\n", "t.kiln", &scope)?;
        assert_eq!(scope.doc(&Symbol::new("inc")).as_deref(), Some("adds one"));
        assert_eq!(scope.commentary().len(), 1);
        Ok(())
    }

    #[test]
    fn frames_are_recorded() -> Result<()> {
        let ctx = Context::new();
        eval_source(&ctx, "(+ 1 2)", "t.kiln", &ground::standard())?;
        assert!(!ctx.trace().frames().is_empty());
        Ok(())
    }

    #[test]
    fn cancellation_interrupts_an_infinite_loop() {
        let ctx = Context::new();
        let token = ctx.cancel_token().clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        let err = eval_source(
            &ctx,
            "(defn spin () (spin)) (spin)",
            "t.kiln",
            &ground::standard(),
        )
        .unwrap_err();
        canceller.join().unwrap();
        assert!(err.is_interrupted());
    }

    #[test]
    fn trace_ring_drops_oldest() {
        let mut trace = Trace::new(2);
        for n in 0..3 {
            trace.record(Frame {
                value: Value::Int(n),
                range: Range::default(),
            });
        }
        let values: Vec<Value> = trace.frames().into_iter().map(|f| f.value).collect();
        assert_eq!(values, vec![Value::Int(1), Value::Int(2)]);
    }
}
