use std::env;
use std::path::Path;

use anyhow::{Context as _, Result};

use kiln::eval_source;

use super::{report, script_scope, session};

pub(crate) fn cmd_eval(config: Option<&Path>, expr: &str) -> Result<i32> {
    let cwd = env::current_dir().context("failed to read working directory")?;
    let ctx = session(config)?;
    let scope = script_scope(&cwd, &[]);
    match eval_source(&ctx, expr, "<eval>", &scope) {
        Ok(value) => {
            println!("{value}");
            Ok(0)
        }
        Err(err) => report(&ctx, &err),
    }
}
