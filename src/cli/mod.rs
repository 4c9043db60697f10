mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kiln", version, about = "Run kiln scripts and serve runtimes")]
struct Cli {
    /// Runtime configuration file (defaults to $KILN_CONFIG or the user config dir)
    #[arg(short = 'c', long = "config", global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate a script file
    Run {
        file: PathBuf,
        /// Bound to *args* as a list of strings
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Evaluate an expression and print its value
    Eval { expr: String },
    /// Expose the configured runtimes over HTTP
    Serve {
        #[arg(long = "listen", default_value = "127.0.0.1:6455")]
        listen: String,
    },
}

/// Returns the process exit code.
pub(crate) fn run() -> Result<i32> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { file, args } => commands::cmd_run(cli.config.as_deref(), &file, &args),
        Command::Eval { expr } => commands::cmd_eval(cli.config.as_deref(), &expr),
        Command::Serve { listen } => {
            commands::cmd_serve(cli.config.as_deref(), &listen)?;
            Ok(0)
        }
    }
}
