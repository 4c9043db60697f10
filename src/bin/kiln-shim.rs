use std::env;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use kiln::Context;
use kiln::runtime::shim::{self, OUTPUT_ENV, ShimIo};

#[derive(Parser, Debug)]
#[command(name = "kiln-shim", about = "Run a one-shot kiln command file")]
struct Args {
    #[command(subcommand)]
    command: ShimCommand,
}

#[derive(Subcommand, Debug)]
enum ShimCommand {
    /// Run the command described by a JSON file, deleting the file first.
    /// Stdout goes to the file named by $_KILN_OUTPUT when set.
    Run { cmd: PathBuf },
}

fn main() {
    kiln::init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("kiln-shim: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();
    match args.command {
        ShimCommand::Run { cmd } => {
            let streams = ShimIo {
                stdout: env::var_os(OUTPUT_ENV).map(PathBuf::from),
                stderr: None,
                process_group: false,
                root: None,
            };
            Ok(shim::run(&Context::new(), &cmd, &streams)?)
        }
    }
}
