use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use kiln::runtime::server;
use kiln::{Config, Pool};

pub(crate) fn cmd_serve(config: Option<&Path>, listen: &str) -> Result<()> {
    let config = Config::load(config)?;
    let pool = Pool::new(&config).context("failed to open runtimes")?;
    let server = server::bind(listen)?;
    eprintln!("kiln serving runtimes on http://{listen}");
    server::serve(server, Arc::new(pool));
    Ok(())
}
