//! The ground environment: special forms and built-in functions.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::combiner::{self, Operative, Signature, bind, cps_function, function, operative, wrap};
use crate::error::{Error, Result};
use crate::eval::{Context, Cont, Ready, eval, eval_each, eval_sequence};
use crate::path::{self, DirPath, FileOrDir, ThunkPath};
use crate::runtime::RunResult;
use crate::scope::Scope;
use crate::secret::Secret;
use crate::thunk::{ImageRef, MountSource, Platform, Thunk, ThunkAddr, ThunkCmd, ThunkImage};
use crate::value::{Symbol, Value};

/// A fresh scope holding every built-in binding.
pub fn standard() -> Scope {
    let scope = Scope::empty();
    install_forms(&scope);
    install_lists(&scope);
    install_numbers(&scope);
    install_strings(&scope);
    install_scopes(&scope);
    install_diagnostics(&scope);
    install_thunks(&scope);
    install_running(&scope);
    scope
}

fn def(scope: &Scope, value: Value, doc: &str) {
    let name = match value.inner() {
        Value::Builtin(builtin) => builtin.name.clone(),
        Value::Applicative(app) => match app.underlying.inner() {
            Value::Builtin(builtin) => builtin.name.clone(),
            _ => return,
        },
        _ => return,
    };
    scope.def(name.as_str(), value, doc);
}

fn fail_or(result: Result<Ready>) -> Ready {
    result.unwrap_or_else(Ready::fail)
}

/// Copy of a quoted form without source annotations.
fn unannotate(value: &Value) -> Value {
    match value.inner() {
        list @ (Value::Pair(_) | Value::Cons(_)) => {
            let (items, tail) = list.list_parts();
            let items: Vec<Value> = items.iter().map(unannotate).collect();
            let tail = unannotate(&tail);
            match list {
                Value::Cons(_) => Value::cons_with_tail(items, tail),
                _ => Value::list_with_tail(items, tail),
            }
        }
        Value::Bind(items) => Value::Bind(items.iter().map(unannotate).collect()),
        other => other.clone(),
    }
}

fn user_operative(name: &str, formals: &Value, eformal: Value, body: &[Value], scope: &Scope) -> Value {
    Value::Operative(Arc::new(Operative {
        name: name.to_string(),
        formals: formals.clone(),
        eformal,
        body: body.to_vec(),
        scope: scope.clone(),
    }))
}

fn install_forms(scope: &Scope) {
    def(
        scope,
        operative("quote", Signature::fixed(&["form"]), |_, args, _, cont| {
            cont.call(unannotate(&args[0]))
        }),
        "Returns its operand without evaluating it.",
    );

    def(
        scope,
        operative("def", Signature::fixed(&["binding", "value"]), |ctx, args, scope, cont| {
            let binding = args[0].clone();
            let target = scope.clone();
            eval(
                ctx,
                args[1].clone(),
                scope,
                Cont::new(move |value| match bind(&binding, value, &target) {
                    Ok(()) => cont.call(binding.inner().clone()),
                    Err(err) => Ready::fail(err),
                }),
            )
        }),
        "Evaluates value and binds it to the binding pattern in the current scope.",
    );

    def(
        scope,
        operative(
            "if",
            Signature::fixed(&["cond", "then", "else"]),
            |ctx, args, scope, cont| {
                let then = args[1].clone();
                let otherwise = args[2].clone();
                let ctx2 = ctx.clone();
                let scope2 = scope.clone();
                eval(
                    ctx,
                    args[0].clone(),
                    scope,
                    Cont::new(move |cond| {
                        let branch = if cond.is_truthy() { then } else { otherwise };
                        eval(&ctx2, branch, &scope2, cont)
                    }),
                )
            },
        ),
        "Evaluates then if cond is truthy, otherwise else.",
    );

    def(
        scope,
        operative("do", Signature::variadic(&[], "body"), |ctx, args, scope, cont| {
            eval_sequence(ctx, args, scope, cont)
        }),
        "Evaluates each form in order, returning the last result.",
    );

    def(
        scope,
        operative(
            "op",
            Signature::variadic(&["formals", "eformal"], "body"),
            |_, args, scope, cont| {
                cont.call(user_operative("op", &args[0], args[1].clone(), &args[2..], scope))
            },
        ),
        "Constructs an operative receiving unevaluated operands and the caller's scope.",
    );

    def(
        scope,
        operative("fn", Signature::variadic(&["formals"], "body"), |_, args, scope, cont| {
            cont.call(wrap(user_operative("fn", &args[0], Value::Ignore, &args[1..], scope)))
        }),
        "Constructs a function.",
    );

    def(
        scope,
        operative(
            "defop",
            Signature::variadic(&["name", "formals", "eformal"], "body"),
            |_, args, scope, cont| {
                fail_or((|| {
                    let name: Symbol = args[0].decode()?;
                    let op = user_operative(name.as_str(), &args[1], args[2].clone(), &args[3..], scope);
                    scope.set(name.clone(), op);
                    Ok(cont.call(Value::Symbol(name)))
                })())
            },
        ),
        "Defines a named operative.",
    );

    def(
        scope,
        operative(
            "defn",
            Signature::variadic(&["name", "formals"], "body"),
            |_, args, scope, cont| {
                fail_or((|| {
                    let name: Symbol = args[0].decode()?;
                    let body = user_operative(name.as_str(), &args[1], Value::Ignore, &args[2..], scope);
                    scope.set(name.clone(), wrap(body));
                    Ok(cont.call(Value::Symbol(name)))
                })())
            },
        ),
        "Defines a named function.",
    );

    def(
        scope,
        operative("let", Signature::variadic(&["bindings"], "body"), |ctx, args, scope, cont| {
            fail_or((|| {
                let forms = args[0].to_vec()?;
                if forms.len() % 2 != 0 {
                    return Err(Error::message("let: bindings must come in pairs"));
                }
                let pairs: Vec<(Value, Value)> = forms
                    .chunks(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                Ok(let_from(ctx.clone(), pairs.into_iter(), scope.child(), args[1..].to_vec(), cont))
            })())
        }),
        "Binds each pattern in turn in a child scope, then evaluates the body.",
    );

    def(
        scope,
        operative("and", Signature::variadic(&[], "conds"), |ctx, args, scope, cont| {
            short_circuit(ctx.clone(), args.into_iter(), scope.clone(), false, cont)
        }),
        "Returns the first falsy value, or the last value.",
    );

    def(
        scope,
        operative("or", Signature::variadic(&[], "conds"), |ctx, args, scope, cont| {
            short_circuit(ctx.clone(), args.into_iter(), scope.clone(), true, cont)
        }),
        "Returns the first truthy value, or the last value.",
    );

    def(
        scope,
        operative("cond", Signature::variadic(&[], "clauses"), |ctx, args, scope, cont| {
            if args.len() % 2 != 0 {
                return Ready::fail(Error::message("cond: clauses must come in pairs"));
            }
            let clauses: Vec<(Value, Value)> = args
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            cond_from(ctx.clone(), clauses.into_iter(), scope.clone(), cont)
        }),
        "Evaluates the body of the first clause whose test is truthy.",
    );

    def(
        scope,
        operative("current-scope", Signature::fixed(&[]), |_, _, scope, cont| {
            cont.call(Value::Scope(scope.clone()))
        }),
        "Returns the scope the form is evaluated in.",
    );

    def(
        scope,
        operative("$", Signature::variadic(&["cmd"], "args"), |ctx, args, scope, cont| {
            let forms: Vec<Value> = args
                .iter()
                .enumerate()
                .map(|(i, form)| match form.inner() {
                    Value::Symbol(sym) if i == 0 => {
                        Value::Command(crate::path::CommandPath::new(sym.as_str()))
                    }
                    Value::Symbol(sym) => Value::string(sym.as_str()),
                    _ => form.clone(),
                })
                .collect();
            eval_each(
                ctx,
                forms,
                scope,
                Box::new(move |mut values| {
                    let args = values.split_off(1);
                    match ThunkCmd::from_value(&values[0]) {
                        Ok(cmd) => cont.call(Value::thunk(Thunk::new(cmd).with_args(args))),
                        Err(err) => Ready::fail(err),
                    }
                }),
            )
        }),
        "Builds a thunk shell-style: bare symbols are literal strings.",
    );
}

fn let_from(
    ctx: Context,
    mut pairs: std::vec::IntoIter<(Value, Value)>,
    local: Scope,
    body: Vec<Value>,
    cont: Cont,
) -> Ready {
    match pairs.next() {
        None => eval_sequence(&ctx, body, &local, cont),
        Some((pattern, expr)) => {
            let ctx2 = ctx.clone();
            let local2 = local.clone();
            eval(
                &ctx,
                expr,
                &local,
                Cont::new(move |value| match bind(&pattern, value, &local2) {
                    Ok(()) => let_from(ctx2, pairs, local2, body, cont),
                    Err(err) => Ready::fail(err),
                }),
            )
        }
    }
}

/// `and` stops at the first falsy value, `or` (stop_on = true) at the first
/// truthy one. The last form is evaluated in tail position.
fn short_circuit(
    ctx: Context,
    mut forms: std::vec::IntoIter<Value>,
    scope: Scope,
    stop_on: bool,
    cont: Cont,
) -> Ready {
    let Some(form) = forms.next() else {
        return cont.call(Value::Bool(!stop_on));
    };
    if forms.len() == 0 {
        return eval(&ctx, form, &scope, cont);
    }
    let ctx2 = ctx.clone();
    let scope2 = scope.clone();
    eval(
        &ctx,
        form,
        &scope,
        Cont::new(move |value| {
            if value.is_truthy() == stop_on {
                cont.call(value)
            } else {
                short_circuit(ctx2, forms, scope2, stop_on, cont)
            }
        }),
    )
}

fn cond_from(
    ctx: Context,
    mut clauses: std::vec::IntoIter<(Value, Value)>,
    scope: Scope,
    cont: Cont,
) -> Ready {
    let Some((test, body)) = clauses.next() else {
        return cont.call(Value::Null);
    };
    let ctx2 = ctx.clone();
    let scope2 = scope.clone();
    eval(
        &ctx,
        test,
        &scope,
        Cont::new(move |value| {
            if value.is_truthy() {
                eval(&ctx2, body, &scope2, cont)
            } else {
                cond_from(ctx2, clauses, scope2, cont)
            }
        }),
    )
}

fn install_lists(scope: &Scope) {
    def(
        scope,
        function("wrap", Signature::fixed(&["combiner"]), |_, args| {
            if args[0].is_combiner() {
                Ok(wrap(args[0].clone()))
            } else {
                Err(Error::decode(&args[0], "combiner"))
            }
        }),
        "Wraps a combiner so its operands are evaluated.",
    );

    def(
        scope,
        function("unwrap", Signature::fixed(&["applicative"]), |_, args| {
            let app: Arc<combiner::Applicative> = args[0].decode()?;
            Ok(app.underlying.clone())
        }),
        "Returns the combiner underlying an applicative.",
    );

    def(
        scope,
        cps_function("eval", Signature::fixed(&["form", "scope"]), |ctx, args, _, cont| {
            match args[1].decode::<Scope>() {
                Ok(target) => eval(ctx, args[0].clone(), &target, cont),
                Err(err) => Ready::fail(err),
            }
        }),
        "Evaluates form in scope.",
    );

    def(
        scope,
        cps_function("apply", Signature::fixed(&["combiner", "args"]), |ctx, args, scope, cont| {
            match args[1].to_vec() {
                Ok(argv) => combiner::apply(ctx, args[0].clone(), argv, scope, cont),
                Err(err) => Ready::fail(err),
            }
        }),
        "Calls combiner with an already-evaluated argument list.",
    );

    def(
        scope,
        function("list", Signature::variadic(&[], "values"), |_, args| Ok(Value::list(args))),
        "Returns its arguments as a list.",
    );

    def(
        scope,
        function("cons", Signature::fixed(&["first", "rest"]), |_, args| {
            Ok(Value::pair(args[0].clone(), args[1].clone()))
        }),
        "Prepends first to rest.",
    );

    def(
        scope,
        function("first", Signature::fixed(&["list"]), |_, args| match args[0].inner() {
            Value::Pair(cell) | Value::Cons(cell) => Ok(cell.a.clone()),
            _ => Err(Error::decode(&args[0], "non-empty list")),
        }),
        "Returns the first element of a list.",
    );

    def(
        scope,
        function("rest", Signature::fixed(&["list"]), |_, args| match args[0].inner() {
            Value::Pair(cell) | Value::Cons(cell) => Ok(cell.d.clone()),
            _ => Err(Error::decode(&args[0], "non-empty list")),
        }),
        "Returns a list without its first element.",
    );

    def(
        scope,
        function("length", Signature::fixed(&["list"]), |_, args| {
            Ok(Value::Int(args[0].to_vec()?.len() as i64))
        }),
        "Counts the elements of a list.",
    );

    def(
        scope,
        function("empty?", Signature::fixed(&["value"]), |_, args| {
            Ok(Value::Bool(match args[0].inner() {
                Value::Empty | Value::Null => true,
                Value::Str(s) => s.is_empty(),
                Value::Scope(scope) => scope.visible_bindings().is_empty(),
                _ => false,
            }))
        }),
        "True for null, empty lists, empty strings and empty scopes.",
    );

    def(
        scope,
        function("null?", Signature::fixed(&["value"]), |_, args| {
            Ok(Value::Bool(matches!(args[0].inner(), Value::Null)))
        }),
        "True for null.",
    );

    def(
        scope,
        function("not", Signature::fixed(&["value"]), |_, args| {
            Ok(Value::Bool(!args[0].is_truthy()))
        }),
        "Negates truthiness.",
    );

    def(
        scope,
        cps_function("map", Signature::fixed(&["f", "list"]), |ctx, args, scope, cont| {
            match args[1].to_vec() {
                Ok(items) => map_from(
                    ctx.clone(),
                    args[0].clone(),
                    items.into_iter(),
                    Vec::new(),
                    scope.clone(),
                    cont,
                ),
                Err(err) => Ready::fail(err),
            }
        }),
        "Calls f on each element, in order, collecting the results.",
    );
}

fn map_from(
    ctx: Context,
    f: Value,
    mut rest: std::vec::IntoIter<Value>,
    mut acc: Vec<Value>,
    scope: Scope,
    cont: Cont,
) -> Ready {
    let Some(item) = rest.next() else {
        return cont.call(Value::list(acc));
    };
    let ctx2 = ctx.clone();
    let scope2 = scope.clone();
    let f2 = f.clone();
    combiner::apply(
        &ctx,
        f,
        vec![item],
        &scope,
        Cont::new(move |value| {
            acc.push(value);
            map_from(ctx2, f2, rest, acc, scope2, cont)
        }),
    )
}

fn ints(args: &[Value]) -> Result<Vec<i64>> {
    args.iter().map(|arg| arg.decode::<i64>()).collect()
}

fn overflow() -> Error {
    Error::message("integer overflow")
}

fn fold_ints(args: &[Value], init: i64, op: fn(i64, i64) -> Option<i64>) -> Result<Value> {
    let mut acc = init;
    for n in ints(args)? {
        acc = op(acc, n).ok_or_else(overflow)?;
    }
    Ok(Value::Int(acc))
}

fn compare(args: &[Value], ok: fn(i64, i64) -> bool) -> Result<Value> {
    let nums = ints(args)?;
    Ok(Value::Bool(nums.windows(2).all(|w| ok(w[0], w[1]))))
}

fn install_numbers(scope: &Scope) {
    def(
        scope,
        function("=", Signature::variadic(&["value"], "values"), |_, args| {
            Ok(Value::Bool(args[1..].iter().all(|other| args[0].equal(other))))
        }),
        "True when every argument equals the first.",
    );
    def(
        scope,
        function("<", Signature::variadic(&["a", "b"], "more"), |_, args| {
            compare(&args, |a, b| a < b)
        }),
        "True when the arguments strictly increase.",
    );
    def(
        scope,
        function(">", Signature::variadic(&["a", "b"], "more"), |_, args| {
            compare(&args, |a, b| a > b)
        }),
        "True when the arguments strictly decrease.",
    );
    def(
        scope,
        function("<=", Signature::variadic(&["a", "b"], "more"), |_, args| {
            compare(&args, |a, b| a <= b)
        }),
        "True when the arguments never decrease.",
    );
    def(
        scope,
        function(">=", Signature::variadic(&["a", "b"], "more"), |_, args| {
            compare(&args, |a, b| a >= b)
        }),
        "True when the arguments never increase.",
    );
    def(
        scope,
        function("+", Signature::variadic(&[], "nums"), |_, args| {
            fold_ints(&args, 0, i64::checked_add)
        }),
        "Sums its arguments.",
    );
    def(
        scope,
        function("*", Signature::variadic(&[], "nums"), |_, args| {
            fold_ints(&args, 1, i64::checked_mul)
        }),
        "Multiplies its arguments.",
    );
    def(
        scope,
        function("-", Signature::variadic(&["num"], "nums"), |_, args| {
            let first = args[0].decode::<i64>()?;
            if args.len() == 1 {
                return first.checked_neg().map(Value::Int).ok_or_else(overflow);
            }
            fold_ints(&args[1..], first, i64::checked_sub)
        }),
        "Negates one argument or subtracts the rest from the first.",
    );
    def(
        scope,
        function("quot", Signature::fixed(&["num", "denom"]), |_, args| {
            let (num, denom) = (args[0].decode::<i64>()?, args[1].decode::<i64>()?);
            if denom == 0 {
                return Err(Error::message("division by zero"));
            }
            num.checked_div(denom).map(Value::Int).ok_or_else(overflow)
        }),
        "Integer division truncating toward zero.",
    );
    def(
        scope,
        function("rem", Signature::fixed(&["num", "denom"]), |_, args| {
            let (num, denom) = (args[0].decode::<i64>()?, args[1].decode::<i64>()?);
            if denom == 0 {
                return Err(Error::message("division by zero"));
            }
            num.checked_rem(denom).map(Value::Int).ok_or_else(overflow)
        }),
        "Remainder of integer division.",
    );
    def(
        scope,
        function("max", Signature::variadic(&["num"], "nums"), |_, args| {
            Ok(Value::Int(ints(&args)?.into_iter().max().unwrap_or_default()))
        }),
        "Largest argument.",
    );
    def(
        scope,
        function("min", Signature::variadic(&["num"], "nums"), |_, args| {
            Ok(Value::Int(ints(&args)?.into_iter().min().unwrap_or_default()))
        }),
        "Smallest argument.",
    );
}

fn install_strings(scope: &Scope) {
    def(
        scope,
        function("str", Signature::variadic(&[], "values"), |_, args| {
            let mut out = String::new();
            for arg in &args {
                match arg.inner() {
                    Value::Str(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
            }
            Ok(Value::string(&out))
        }),
        "Concatenates strings and the rendering of other values.",
    );
    def(
        scope,
        function("string->symbol", Signature::fixed(&["string"]), |_, args| {
            Ok(Value::symbol(&args[0].decode::<String>()?))
        }),
        "Converts a string to a symbol.",
    );
    def(
        scope,
        function("symbol->string", Signature::fixed(&["symbol"]), |_, args| {
            Ok(Value::string(args[0].decode::<Symbol>()?.as_str()))
        }),
        "Converts a symbol to a string.",
    );
}

/// Bind `key value` pairs into `scope`; keys are keywords, symbols or strings.
fn assign_pairs(scope: &Scope, kvs: &[Value]) -> Result<()> {
    if kvs.len() % 2 != 0 {
        return Err(Error::message("expected key value pairs"));
    }
    for pair in kvs.chunks(2) {
        scope.set(pair[0].decode_name()?.as_str(), pair[1].clone());
    }
    Ok(())
}

fn install_scopes(scope: &Scope) {
    def(
        scope,
        function("make-scope", Signature::variadic(&[], "parents"), |_, args| {
            let parents = args
                .iter()
                .map(|parent| parent.decode::<Scope>())
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Scope(Scope::new(parents)))
        }),
        "Constructs an empty scope with the given parents.",
    );
    def(
        scope,
        function("assoc", Signature::variadic(&["scope"], "kvs"), |_, args| {
            let source: Scope = args[0].decode()?;
            let copy = Scope::new(source.parents().to_vec());
            for (key, value) in source.bindings() {
                copy.set(key, value);
            }
            assign_pairs(&copy, &args[1..])?;
            Ok(Value::Scope(copy))
        }),
        "Returns a copy of scope with additional bindings.",
    );
    def(
        scope,
        function("get", Signature::variadic(&["scope", "key"], "default"), |_, args| {
            let source: Scope = args[0].decode()?;
            let key = Symbol::new(&args[1].decode_name()?);
            Ok(source
                .get(&key)
                .unwrap_or_else(|| args.get(2).cloned().unwrap_or(Value::Null)))
        }),
        "Looks up key in scope, returning default (or null) when unbound.",
    );
    def(
        scope,
        function("keys", Signature::fixed(&["scope"]), |_, args| {
            let source: Scope = args[0].decode()?;
            Ok(Value::list(
                source
                    .visible_bindings()
                    .into_iter()
                    .map(|(key, _)| Value::Keyword(key)),
            ))
        }),
        "Lists the keys visible from scope.",
    );
    def(
        scope,
        cps_function("doc", Signature::variadic(&["name"], "scope"), |_, args, caller, cont| {
            fail_or((|| {
                let name = Symbol::new(&args[0].decode_name()?);
                let target = match args.get(1) {
                    Some(scope) => scope.decode::<Scope>()?,
                    None => caller.clone(),
                };
                Ok(cont.call(match target.doc(&name) {
                    Some(doc) => Value::string(&doc),
                    None => Value::Null,
                }))
            })())
        }),
        "Returns the documentation recorded for a binding.",
    );
}

fn install_diagnostics(scope: &Scope) {
    def(
        scope,
        function("error", Signature::variadic(&["message"], "fields"), |_, args| {
            let fields = Scope::empty();
            assign_pairs(&fields, &args[1..])?;
            Err(Error::Structured {
                message: args[0].decode::<String>()?,
                fields,
            })
        }),
        "Raises an error with a message and optional :key value fields.",
    );
    def(
        scope,
        function("mask", Signature::fixed(&["value", "name"]), |_, args| {
            let name = args[1].decode_name()?;
            match args[0].inner() {
                Value::Str(s) => Ok(Value::Secret(Secret::new(&name, s.as_bytes()))),
                Value::Secret(secret) => Ok(Value::Secret(Secret::new(&name, secret.reveal()))),
                _ => Err(Error::decode(&args[0], "string")),
            }
        }),
        "Turns a string into a named secret.",
    );
    def(
        scope,
        function("log", Signature::variadic(&["message"], "fields"), |_, args| {
            let fields = Scope::empty();
            assign_pairs(&fields, &args[1..])?;
            let message = match args[0].inner() {
                Value::Str(s) => s.to_string(),
                other => other.to_string(),
            };
            if fields.is_empty() {
                info!(target: "kiln::script", "{message}");
            } else {
                info!(target: "kiln::script", %fields, "{message}");
            }
            Ok(args[0].clone())
        }),
        "Logs a message with optional :key value fields.",
    );
    def(
        scope,
        function("dump", Signature::fixed(&["value"]), |_, args| {
            info!(target: "kiln::script", value = %args[0], "dump");
            Ok(args[0].clone())
        }),
        "Logs a value and returns it.",
    );
    def(
        scope,
        function("emit", Signature::fixed(&["value"]), |ctx, args| {
            ctx.sink().emit(&args[0])?;
            Ok(Value::Null)
        }),
        "Writes a value to the output sink.",
    );
}

fn thunk_arg(value: &Value) -> Result<Thunk> {
    Ok((*value.decode::<Arc<Thunk>>()?).clone())
}

fn image_arg(value: &Value) -> Result<ThunkImage> {
    match value.inner() {
        Value::Str(s) => Ok(ThunkImage::Ref(ImageRef::parse(s))),
        Value::Thunk(thunk) => Ok(ThunkImage::Thunk(thunk.clone())),
        _ => Err(Error::decode(value, "image")),
    }
}

fn path_arg(value: &Value) -> Result<FileOrDir> {
    match value.inner() {
        Value::Str(s) => Ok(FileOrDir::parse(s)),
        _ => value.decode(),
    }
}

fn platform_arg(value: &Value) -> Result<Platform> {
    match value.inner() {
        Value::Str(s) => Ok(Platform::parse(s)),
        Value::Scope(scope) => {
            let os = scope
                .get(&Symbol::new("os"))
                .ok_or_else(|| Error::decode(value, "platform"))?
                .decode::<String>()?;
            let arch = match scope.get(&Symbol::new("arch")) {
                Some(arch) => arch.decode::<Option<String>>()?,
                None => None,
            };
            Ok(Platform { os, arch })
        }
        _ => Err(Error::decode(value, "platform")),
    }
}

fn install_thunks(scope: &Scope) {
    def(
        scope,
        function("subpath", Signature::fixed(&["path", "child"]), |_, args| {
            path::extend(&args[0], &path_arg(&args[1])?)
        }),
        "Extends a directory, thunk or host path with a relative child path.",
    );
    def(
        scope,
        function("from", Signature::fixed(&["image", "thunk"]), |_, args| {
            Ok(Value::thunk(thunk_arg(&args[1])?.with_image(image_arg(&args[0])?)))
        }),
        "Sets the image a thunk starts from.",
    );
    def(
        scope,
        function("with-image", Signature::fixed(&["thunk", "image"]), |_, args| {
            Ok(Value::thunk(thunk_arg(&args[0])?.with_image(image_arg(&args[1])?)))
        }),
        "Sets the image a thunk starts from.",
    );
    def(
        scope,
        function("with-args", Signature::fixed(&["thunk", "args"]), |_, args| {
            Ok(Value::thunk(thunk_arg(&args[0])?.with_args(args[1].to_vec()?)))
        }),
        "Replaces a thunk's arguments.",
    );
    def(
        scope,
        function("with-stdin", Signature::fixed(&["thunk", "values"]), |_, args| {
            Ok(Value::thunk(thunk_arg(&args[0])?.with_stdin(args[1].to_vec()?)))
        }),
        "Replaces the values written to a thunk's stdin.",
    );
    def(
        scope,
        function("with-env", Signature::fixed(&["thunk", "env"]), |_, args| {
            let env: Scope = args[1].decode()?;
            let env: BTreeMap<String, Value> = env
                .visible_bindings()
                .into_iter()
                .map(|(key, value)| (key.as_str().to_string(), value))
                .collect();
            Ok(Value::thunk(thunk_arg(&args[0])?.with_env(env)))
        }),
        "Replaces a thunk's environment variables.",
    );
    def(
        scope,
        function("with-dir", Signature::fixed(&["thunk", "dir"]), |_, args| {
            Ok(Value::thunk(thunk_arg(&args[0])?.with_dir(path_arg(&args[1])?)))
        }),
        "Sets a thunk's working directory.",
    );
    def(
        scope,
        function("with-mount", Signature::fixed(&["thunk", "source", "target"]), |_, args| {
            let source = MountSource::from_value(&args[1])?;
            Ok(Value::thunk(thunk_arg(&args[0])?.with_mount(source, path_arg(&args[2])?)))
        }),
        "Mounts a thunk path, host path or secret into a thunk.",
    );
    def(
        scope,
        function("with-platform", Signature::fixed(&["thunk", "platform"]), |_, args| {
            Ok(Value::thunk(thunk_arg(&args[0])?.with_platform(platform_arg(&args[1])?)))
        }),
        "Sets the platform a thunk must run on.",
    );
    def(
        scope,
        function("with-label", Signature::fixed(&["thunk", "name", "value"]), |_, args| {
            let name = args[1].decode_name()?;
            let value = match args[2].inner() {
                Value::Str(s) => s.to_string(),
                other => other.to_string(),
            };
            Ok(Value::thunk(thunk_arg(&args[0])?.with_label(&name, &value)))
        }),
        "Attaches a label that does not affect the thunk's identity.",
    );
    def(
        scope,
        function("thunk-hash", Signature::fixed(&["thunk"]), |_, args| {
            Ok(Value::string(&thunk_arg(&args[0])?.name()?))
        }),
        "Returns the hex identity of a thunk.",
    );
    def(
        scope,
        function("addr", Signature::fixed(&["thunk", "port", "format"]), |_, args| {
            Ok(Value::ThunkAddr(Arc::new(ThunkAddr {
                thunk: args[0].decode()?,
                port: args[1].decode_name()?,
                format: args[2].decode()?,
            })))
        }),
        "Describes a network address served by a thunk.",
    );
    def(
        scope,
        function("render", Signature::fixed(&["addr", "scope"]), |_, args| {
            let addr: Arc<ThunkAddr> = args[0].decode()?;
            Ok(Value::string(&addr.render(&args[1].decode()?)?))
        }),
        "Renders an address, substituting $name references from scope.",
    );
}

/// Run a thunk, treating a non-zero exit as an error.
fn run_checked(ctx: &Context, thunk: &Thunk) -> Result<RunResult> {
    let result = ctx.runtime()?.run(ctx, thunk)?;
    if result.exit_code != 0 {
        return Err(Error::Exit {
            code: result.exit_code,
            thunk: thunk.name()?,
        });
    }
    Ok(result)
}

fn thunk_path_arg(value: &Value) -> Result<ThunkPath> {
    match value.inner() {
        Value::Thunk(thunk) => Ok(ThunkPath::new(thunk.clone(), FileOrDir::Dir(DirPath::root()))),
        _ => Ok((*value.decode::<Arc<ThunkPath>>()?).clone()),
    }
}

fn read_bytes(ctx: &Context, source: &Value) -> Result<Vec<u8>> {
    match source.inner() {
        Value::Thunk(thunk) => Ok(run_checked(ctx, thunk)?.stdout),
        Value::ThunkPath(tp) => ctx.runtime()?.read(ctx, tp),
        Value::Host(host) => Ok(std::fs::read(host.resolve()?)?),
        _ => Err(Error::decode(source, "readable source")),
    }
}

fn install_running(scope: &Scope) {
    def(
        scope,
        function("run", Signature::fixed(&["thunk"]), |ctx, args| {
            run_checked(ctx, &thunk_arg(&args[0])?)?;
            Ok(Value::Null)
        }),
        "Runs a thunk, failing if it exits non-zero.",
    );
    def(
        scope,
        function("succeeds?", Signature::fixed(&["thunk"]), |ctx, args| {
            match run_checked(ctx, &thunk_arg(&args[0])?) {
                Ok(_) => Ok(Value::Bool(true)),
                Err(Error::Exit { .. }) => Ok(Value::Bool(false)),
                Err(err) => Err(err),
            }
        }),
        "Runs a thunk and reports whether it exited zero.",
    );
    def(
        scope,
        function("read", Signature::fixed(&["source", "protocol"]), |ctx, args| {
            let bytes = read_bytes(ctx, &args[0])?;
            let text = String::from_utf8_lossy(&bytes);
            match args[1].decode_name()?.as_str() {
                "raw" => Ok(Value::string(&text)),
                "lines" => Ok(Value::list(text.lines().map(Value::string))),
                "json" => {
                    let stream = serde_json::Deserializer::from_str(&text).into_iter::<serde_json::Value>();
                    let mut values = Vec::new();
                    for item in stream {
                        let item = item.map_err(|err| Error::message(format!("read :json: {err}")))?;
                        values.push(Value::from_json(item));
                    }
                    Ok(Value::list(values))
                }
                other => Err(Error::message(format!("unknown protocol: {other}"))),
            }
        }),
        "Reads a thunk's stdout, a thunk path or a host path as :raw, :lines or :json.",
    );
    def(
        scope,
        function("export", Signature::fixed(&["path", "dest"]), |ctx, args| {
            let source = thunk_path_arg(&args[0])?;
            let dest: String = args[1].decode()?;
            ctx.runtime()?.export(ctx, &source, Path::new(&dest))?;
            Ok(Value::Null)
        }),
        "Copies a thunk's output directory to a host directory.",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::eval_source;
    use pretty_assertions::assert_eq;

    fn run(source: &str) -> Result<Value> {
        eval_source(&Context::new(), source, "ground.kiln", &standard())
    }

    #[test]
    fn if_selects_branches() -> Result<()> {
        assert_eq!(run("(if #t 1 2)")?, Value::Int(1));
        assert_eq!(run("(if #f 1 2)")?, Value::Int(2));
        assert_eq!(run("(if null 1 2)")?, Value::Int(2));
        Ok(())
    }

    #[test]
    fn if_alone_is_enough() -> Result<()> {
        let minimal = Scope::empty();
        let form = standard().get(&Symbol::from("if")).unwrap();
        minimal.set("if", form);
        let ctx = Context::new();
        assert_eq!(eval_source(&ctx, "(if #t 1 2)", "min.kiln", &minimal)?, Value::Int(1));
        assert_eq!(eval_source(&ctx, "(if #f 1 2)", "min.kiln", &minimal)?, Value::Int(2));
        assert!(matches!(
            eval_source(&ctx, "(if #t 1 2 3)", "min.kiln", &minimal),
            Err(Error::Arity { .. })
        ));
        Ok(())
    }

    #[test]
    fn if_checks_arity() {
        let err = run("(if #t 1 2 3)").unwrap_err();
        assert_eq!(err.to_string(), "if arity: need 3 arguments, given 4");
    }

    #[test]
    fn functions_and_closures() -> Result<()> {
        assert_eq!(run("(defn add (a b) (+ a b)) (add 2 3)")?, Value::Int(5));
        assert_eq!(run("(def mk (fn (n) (fn (m) (* n m)))) ((mk 6) 7)")?, Value::Int(42));
        assert_eq!(
            run("(defn rest-of (x & xs) xs) (rest-of 1 2 3)")?,
            Value::list([Value::Int(2), Value::Int(3)])
        );
        let err = run("(defn one (x) x) (one)").unwrap_err();
        assert_eq!(err.to_string(), "one arity: need 1 arguments, given 0");
        Ok(())
    }

    #[test]
    fn operatives_see_raw_operands_and_caller_scope() -> Result<()> {
        let out = run(
            r#"
            (defop quote-first (x & _) env x)
            (quote-first (+ 1 2) ignored)
            "#,
        )?;
        assert_eq!(out.to_string(), "(+ 1 2)");
        let out = run("(def y 9) (defop lookup (sym) env (eval sym env)) (lookup y)")?;
        assert_eq!(out, Value::Int(9));
        Ok(())
    }

    #[test]
    fn let_and_cond() -> Result<()> {
        assert_eq!(run("(let [a 1 b (+ a 1)] (* a b))")?, Value::Int(2));
        assert_eq!(run("(cond #f 1 (= 1 1) 2 :else 3)")?, Value::Int(2));
        assert_eq!(run("(cond #f 1)")?, Value::Null);
        assert_eq!(run("(let [(a b) [1 2]] b)")?, Value::Int(2));
        Ok(())
    }

    #[test]
    fn and_or_short_circuit() -> Result<()> {
        assert_eq!(run("(and 1 #f (error \"no\"))")?, Value::Bool(false));
        assert_eq!(run("(or #f 2 (error \"no\"))")?, Value::Int(2));
        assert_eq!(run("(and)")?, Value::Bool(true));
        assert_eq!(run("(or)")?, Value::Bool(false));
        Ok(())
    }

    #[test]
    fn accumulated_lists_can_be_long() -> Result<()> {
        let source = "(defn build (n acc) (if (= n 0) (length acc) (build (- n 1) (cons n acc))))
                      (build 100000 [])";
        assert_eq!(run(source)?, Value::Int(100_000));
        Ok(())
    }

    #[test]
    fn lists_and_numbers() -> Result<()> {
        assert_eq!(run("(map (fn (x) (* x x)) [1 2 3])")?.to_string(), "(1 4 9)");
        assert_eq!(run("(apply + [1 2 3])")?, Value::Int(6));
        assert_eq!(run("(first (rest [1 2 3]))")?, Value::Int(2));
        assert_eq!(run("(length (cons 0 [1 2]))")?, Value::Int(3));
        assert_eq!(run("(- 5)")?, Value::Int(-5));
        assert_eq!(run("(quot 7 2)")?, Value::Int(3));
        assert_eq!(run("(rem 7 2)")?, Value::Int(1));
        assert_eq!(run("(< 1 2 3)")?, Value::Bool(true));
        assert_eq!(run("(max 3 9 2)")?, Value::Int(9));
        assert!(run("(quot 1 0)").is_err());
        Ok(())
    }

    #[test]
    fn scopes_and_keywords() -> Result<()> {
        assert_eq!(run("(:a {:a 1})")?, Value::Int(1));
        assert_eq!(run("(:b {:a 1} 7)")?, Value::Int(7));
        assert_eq!(run("(get (assoc {:a 1} :b 2) :b)")?, Value::Int(2));
        assert_eq!(run("(keys {:a 1})")?.to_string(), "(:a)");
        assert_eq!(run(r#"(str "a" 1 :b)"#)?, Value::string("a1:b"));
        Ok(())
    }

    #[test]
    fn errors_carry_fields() {
        let err = run(r#"(error "bad thing" :code 42)"#).unwrap_err();
        match err {
            Error::Structured { message, fields } => {
                assert_eq!(message, "bad thing");
                assert_eq!(fields.get(&Symbol::new("code")), Some(Value::Int(42)));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn thunks_built_twice_are_equal() -> Result<()> {
        let out = run(
            r#"
            (defn build () (with-platform (.echo "hi") "linux"))
            (= (build) (build))
            "#,
        )?;
        assert_eq!(out, Value::Bool(true));
        let hash_a = run(r#"(thunk-hash (with-platform (.echo "hi") "linux"))"#)?;
        let hash_b = run(r#"(thunk-hash (with-platform ($ echo hi) "linux"))"#)?;
        assert_eq!(hash_a, hash_b);
        Ok(())
    }

    #[test]
    fn masked_secrets_render_redacted() -> Result<()> {
        let out = run(r#"(mask "hunter2" :token)"#)?;
        assert_eq!(out.to_string(), "<secret: token (7 bytes)>");
        Ok(())
    }

    #[test]
    fn thunk_paths_extend() -> Result<()> {
        let out = run(r#"(def t (.make)) t/out/bin"#)?;
        let Value::ThunkPath(tp) = out else {
            panic!("expected thunk path");
        };
        assert_eq!(tp.path, FileOrDir::parse("out/bin"));
        Ok(())
    }

    #[test]
    fn running_without_a_runtime_fails() {
        let err = run("(run (.true))").unwrap_err();
        assert!(matches!(err, Error::NoRuntime { .. }));
    }

    #[test]
    fn docs_are_recorded() -> Result<()> {
        let out = run("(doc :if)")?;
        assert_eq!(out, Value::string("Evaluates then if cond is truthy, otherwise else."));
        Ok(())
    }
}
