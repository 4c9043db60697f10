use std::fs;
use std::path::Path;

use anyhow::{Context as _, Result};
use tracing::info;

use kiln::eval_source;

use super::{report, script_scope, session};

pub(crate) fn cmd_run(config: Option<&Path>, file: &Path, args: &[String]) -> Result<i32> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let absolute = fs::canonicalize(file)
        .with_context(|| format!("failed to resolve {}", file.display()))?;
    let dir = absolute.parent().unwrap_or(Path::new("/"));

    let ctx = session(config)?;
    let scope = script_scope(dir, args);
    info!(script = %file.display(), "running");
    match eval_source(&ctx, &source, &file.display().to_string(), &scope) {
        Ok(_) => Ok(0),
        Err(err) => report(&ctx, &err),
    }
}
