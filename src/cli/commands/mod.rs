use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::{debug, warn};

use kiln::path::{FileOrDir, HostPath};
use kiln::sink::JsonSink;
use kiln::{Config, Context, Error, Pool, Scope, Value, ground, write_error};

mod eval;
mod run;
mod serve;

pub(crate) use eval::cmd_eval;
pub(crate) use run::cmd_run;
pub(crate) use serve::cmd_serve;

/// Context wired to the configured pool, stdout and Ctrl-C.
pub(crate) fn session(config: Option<&Path>) -> Result<Context> {
    let config = Config::load(config)?;
    debug!(runtimes = config.runtimes.len(), "loaded config");
    let pool = Pool::new(&config).context("failed to open runtimes")?;
    let ctx = Context::new()
        .with_runtime(Arc::new(pool))
        .with_sink(Arc::new(JsonSink::new(io::stdout())));
    let token = ctx.cancel_token().clone();
    if let Err(err) = ctrlc::set_handler(move || token.cancel()) {
        warn!(%err, "could not install Ctrl-C handler");
    }
    Ok(ctx)
}

/// The ground environment extended with `*dir*` and `*args*`.
pub(crate) fn script_scope(dir: &Path, args: &[String]) -> Scope {
    let scope = ground::standard().child();
    scope.def(
        "*dir*",
        Value::Host(HostPath::new(dir.display().to_string(), FileOrDir::parse("."))),
        "directory containing the running script",
    );
    scope.def(
        "*args*",
        Value::list(args.iter().map(|arg| Value::string(arg))),
        "command-line arguments after the script path",
    );
    scope
}

/// Print an evaluation failure with its call trace; returns the exit code.
pub(crate) fn report(ctx: &Context, err: &Error) -> Result<i32> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    write_error(&mut out, err, Some(&ctx.trace()))?;
    out.flush()?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln::eval_source;
    use pretty_assertions::assert_eq;

    #[test]
    fn scripts_see_their_arguments_and_directory() -> kiln::Result<()> {
        let scope = script_scope(Path::new("/work/project"), &["a".into(), "b".into()]);
        let ctx = Context::new();
        let args = eval_source(&ctx, "*args*", "<test>", &scope)?;
        assert_eq!(args, Value::list([Value::string("a"), Value::string("b")]));
        let dir = eval_source(&ctx, "*dir*", "<test>", &scope)?;
        let Value::Host(host) = dir else {
            panic!("expected a host path, got {dir}");
        };
        assert_eq!(host.context_dir, "/work/project");
        Ok(())
    }
}
