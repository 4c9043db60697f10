//! Operatives, builtins and applicatives, and the binding of formals.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::eval::{Context, Cont, Ready, eval_each, eval_sequence};
use crate::scope::Scope;
use crate::thunk::{Thunk, ThunkCmd};
use crate::value::Value;

/// A user-defined combiner receiving its operands unevaluated.
pub struct Operative {
    pub name: String,
    pub formals: Value,
    /// Bound to the caller's scope.
    pub eformal: Value,
    pub body: Vec<Value>,
    /// Definition scope.
    pub scope: Scope,
}

pub type NativeFn = dyn Fn(&Context, Value, &Scope, Cont) -> Ready + Send + Sync;

/// A combiner implemented in Rust.
pub struct Builtin {
    pub name: String,
    pub formals: Value,
    func: Box<NativeFn>,
}

/// Evaluates operands before handing them to the underlying combiner.
pub struct Applicative {
    pub underlying: Value,
}

impl fmt::Debug for Operative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operative({} {})", self.name, self.formals)
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Builtin({} {})", self.name, self.formals)
    }
}

impl fmt::Debug for Applicative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Applicative({})", self.underlying)
    }
}

impl Operative {
    pub fn call(&self, ctx: &Context, operands: Value, caller: &Scope, cont: Cont) -> Ready {
        let local = Scope::new(vec![self.scope.clone()]);
        let bound = check_arity(&self.name, &self.formals, &operands)
            .and_then(|()| bind(&self.formals, operands, &local))
            .and_then(|()| bind(&self.eformal, Value::Scope(caller.clone()), &local));
        match bound {
            Ok(()) => eval_sequence(ctx, self.body.clone(), &local, cont),
            Err(err) => Ready::fail(err),
        }
    }
}

impl Builtin {
    pub fn new(
        name: &str,
        formals: Value,
        func: impl Fn(&Context, Value, &Scope, Cont) -> Ready + Send + Sync + 'static,
    ) -> Self {
        Builtin {
            name: name.to_string(),
            formals,
            func: Box::new(func),
        }
    }

    pub fn call(&self, ctx: &Context, operands: Value, scope: &Scope, cont: Cont) -> Ready {
        (self.func)(ctx, operands, scope, cont)
    }
}

/// Declared positional parameters and an optional rest parameter.
#[derive(Clone, Copy, Debug)]
pub struct Signature {
    pub params: &'static [&'static str],
    pub rest: Option<&'static str>,
}

impl Signature {
    pub const fn fixed(params: &'static [&'static str]) -> Self {
        Signature { params, rest: None }
    }

    pub const fn variadic(params: &'static [&'static str], rest: &'static str) -> Self {
        Signature {
            params,
            rest: Some(rest),
        }
    }

    pub fn formals(&self) -> Value {
        let tail = match self.rest {
            Some(rest) => Value::symbol(rest),
            None => Value::Empty,
        };
        Value::list_with_tail(self.params.iter().map(|p| Value::symbol(p)), tail)
    }

    pub fn check(&self, name: &str, have: usize) -> Result<()> {
        check_count(name, self.params.len(), self.rest.is_some(), have)
    }
}

fn check_count(name: &str, need: usize, variadic: bool, have: usize) -> Result<()> {
    let ok = if variadic { have >= need } else { have == need };
    if ok {
        Ok(())
    } else {
        Err(Error::Arity {
            name: name.to_string(),
            need,
            variadic,
            have,
        })
    }
}

/// Required positional count, and whether a rest pattern accepts more.
pub fn arity(formals: &Value) -> (usize, bool) {
    let (items, tail) = formals.list_parts();
    (items.len(), !matches!(tail, Value::Empty))
}

fn check_arity(name: &str, formals: &Value, operands: &Value) -> Result<()> {
    let (need, variadic) = arity(formals);
    let have = operands.list_parts().0.len();
    check_count(name, need, variadic, have)
}

/// Destructure `value` against `pattern`, binding symbols into `scope`.
pub fn bind(pattern: &Value, value: Value, scope: &Scope) -> Result<()> {
    let mismatch = |have: Value| Error::BindMismatch {
        need: pattern.clone(),
        have,
    };
    match pattern.inner() {
        Value::Symbol(symbol) => {
            scope.set(symbol.clone(), value);
            Ok(())
        }
        Value::Ignore => Ok(()),
        Value::Empty => match value.inner() {
            Value::Empty => Ok(()),
            _ => Err(mismatch(value)),
        },
        Value::Pair(want) | Value::Cons(want) => match value.inner() {
            Value::Pair(have) | Value::Cons(have) => {
                let (head, tail) = (have.a.clone(), have.d.clone());
                bind(&want.a, head, scope)?;
                bind(&want.d, tail, scope)
            }
            _ => Err(mismatch(value)),
        },
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Str(_) | Value::Keyword(_) => {
            if pattern.equal(&value) {
                Ok(())
            } else {
                Err(mismatch(value))
            }
        }
        _ => Err(Error::CannotBind {
            have: pattern.clone(),
        }),
    }
}

pub fn wrap(combiner: Value) -> Value {
    Value::Applicative(Arc::new(Applicative {
        underlying: combiner,
    }))
}

/// Apply a combiner to unevaluated operands in `scope`.
pub fn call(ctx: &Context, combiner: Value, operands: Value, scope: &Scope, cont: Cont) -> Ready {
    match combiner.inner() {
        Value::Operative(op) => op.call(ctx, operands, scope, cont),
        Value::Builtin(builtin) => builtin.call(ctx, operands, scope, cont),
        Value::Applicative(app) => {
            let items = match operands.to_vec() {
                Ok(items) => items,
                Err(err) => return Ready::fail(err),
            };
            let underlying = app.underlying.clone();
            let ctx2 = ctx.clone();
            let scope2 = scope.clone();
            eval_each(
                ctx,
                items,
                scope,
                Box::new(move |args| call(&ctx2, underlying, Value::list(args), &scope2, cont)),
            )
        }
        Value::Command(_) | Value::File(_) | Value::ThunkPath(_) | Value::Host(_) => {
            let cmd = match ThunkCmd::from_value(&combiner) {
                Ok(cmd) => cmd,
                Err(err) => return Ready::fail(err),
            };
            with_evaluated(ctx, operands, scope, move |args| {
                Ok(Value::thunk(Thunk::new(cmd).with_args(args)))
            }, cont)
        }
        Value::Keyword(key) => {
            let key = key.clone();
            with_evaluated(ctx, operands, scope, move |args| {
                let (target, default) = match args.as_slice() {
                    [target] => (target, Value::Null),
                    [target, default] => (target, default.clone()),
                    _ => {
                        return Err(Error::Arity {
                            name: format!(":{key}"),
                            need: 1,
                            variadic: true,
                            have: args.len(),
                        });
                    }
                };
                let scope: Scope = target.decode()?;
                Ok(scope.get(&key).unwrap_or(default))
            }, cont)
        }
        _ => Ready::fail(Error::decode(&combiner, "combiner")),
    }
}

fn with_evaluated(
    ctx: &Context,
    operands: Value,
    scope: &Scope,
    f: impl FnOnce(Vec<Value>) -> Result<Value> + 'static,
    cont: Cont,
) -> Ready {
    let items = match operands.to_vec() {
        Ok(items) => items,
        Err(err) => return Ready::fail(err),
    };
    eval_each(
        ctx,
        items,
        scope,
        Box::new(move |args| match f(args) {
            Ok(value) => cont.call(value),
            Err(err) => Ready::fail(err),
        }),
    )
}

/// Apply a combiner to already-evaluated arguments, skipping the
/// applicative's operand evaluation.
pub fn apply(ctx: &Context, combiner: Value, args: Vec<Value>, scope: &Scope, cont: Cont) -> Ready {
    match combiner.inner() {
        Value::Applicative(app) => call(ctx, app.underlying.clone(), Value::list(args), scope, cont),
        Value::Command(_) | Value::File(_) | Value::ThunkPath(_) | Value::Host(_) => {
            match ThunkCmd::from_value(&combiner) {
                Ok(cmd) => cont.call(Value::thunk(Thunk::new(cmd).with_args(args))),
                Err(err) => Ready::fail(err),
            }
        }
        _ => call(ctx, combiner, Value::list(args), scope, cont),
    }
}

/// A native operative: operands arrive unevaluated, after an arity check.
pub fn operative(
    name: &str,
    signature: Signature,
    f: impl Fn(&Context, Vec<Value>, &Scope, Cont) -> Ready + Send + Sync + 'static,
) -> Value {
    let owned = name.to_string();
    Value::Builtin(Arc::new(Builtin::new(
        name,
        signature.formals(),
        move |ctx, operands, scope, cont| {
            let args = match operands.to_vec() {
                Ok(args) => args,
                Err(err) => return Ready::fail(err),
            };
            if let Err(err) = signature.check(&owned, args.len()) {
                return Ready::fail(err);
            }
            f(ctx, args, scope, cont)
        },
    )))
}

/// A native applicative with access to the continuation.
pub fn cps_function(
    name: &str,
    signature: Signature,
    f: impl Fn(&Context, Vec<Value>, &Scope, Cont) -> Ready + Send + Sync + 'static,
) -> Value {
    wrap(operative(name, signature, f))
}

/// A native applicative returning its result directly.
pub fn function(
    name: &str,
    signature: Signature,
    f: impl Fn(&Context, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
) -> Value {
    cps_function(name, signature, move |ctx, args, _, cont| match f(ctx, args) {
        Ok(value) => cont.call(value),
        Err(err) => Ready::fail(err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::trampoline;
    use crate::value::Symbol;

    #[test]
    fn binds_nested_patterns_and_rest() -> Result<()> {
        let scope = Scope::empty();
        let pattern = Value::list_with_tail(
            [
                Value::symbol("a"),
                Value::list([Value::symbol("b"), Value::Ignore]),
            ],
            Value::symbol("more"),
        );
        let value = Value::list([
            Value::Int(1),
            Value::list([Value::Int(2), Value::Int(3)]),
            Value::Int(4),
            Value::Int(5),
        ]);
        bind(&pattern, value, &scope)?;
        assert_eq!(scope.get(&Symbol::new("a")), Some(Value::Int(1)));
        assert_eq!(scope.get(&Symbol::new("b")), Some(Value::Int(2)));
        assert_eq!(
            scope.get(&Symbol::new("more")),
            Some(Value::list([Value::Int(4), Value::Int(5)]))
        );
        Ok(())
    }

    #[test]
    fn literal_patterns_must_match() {
        let scope = Scope::empty();
        assert!(bind(&Value::Int(1), Value::Int(1), &scope).is_ok());
        let err = bind(&Value::Int(1), Value::Int(2), &scope).unwrap_err();
        assert_eq!(err.to_string(), "bind: need 1, have 2");
    }

    #[test]
    fn thunks_cannot_be_patterns() {
        let scope = Scope::empty();
        let thunk = Value::thunk(Thunk::command("true"));
        let err = bind(&thunk, Value::Null, &scope).unwrap_err();
        assert!(matches!(err, Error::CannotBind { .. }));
    }

    #[test]
    fn arity_counts_rest() {
        assert_eq!(arity(&Value::list([Value::symbol("x")])), (1, false));
        assert_eq!(arity(&Value::symbol("args")), (0, true));
        let sig = Signature::variadic(&["a"], "rest");
        assert!(sig.check("f", 3).is_ok());
        assert!(sig.check("f", 0).is_err());
    }

    #[test]
    fn native_functions_are_applicative() -> Result<()> {
        let add = function("add", Signature::fixed(&["a", "b"]), |_, args| {
            Ok(Value::Int(args[0].decode::<i64>()? + args[1].decode::<i64>()?))
        });
        let scope = Scope::empty();
        scope.set("x", Value::Int(40));
        let ctx = Context::new();
        let operands = Value::list([Value::symbol("x"), Value::Int(2)]);
        let out = trampoline(&ctx, call(&ctx, add, operands, &scope, Cont::done()))?;
        assert_eq!(out, Value::Int(42));
        Ok(())
    }
}
