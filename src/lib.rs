//! kiln: a small Lisp whose programs describe containerised commands as
//! content-addressed thunks and run them through pluggable backends.

pub mod annotated;
pub mod canon;
pub mod cbor;
pub mod cid;
pub mod combiner;
pub mod config;
pub mod decode;
pub mod error;
pub mod eval;
pub mod ground;
pub mod path;
pub mod reader;
pub mod runtime;
pub mod scope;
pub mod secret;
pub mod sink;
pub mod store;
pub mod suggest;
pub mod thunk;
pub mod value;

use std::sync::Once;

pub use cid::Cid;
pub use config::Config;
pub use error::{Error, NiceError, Result, write_error};
pub use eval::{CancelToken, Context, eval_source, eval_value};
pub use runtime::{Pool, RunResult, Runtime};
pub use scope::Scope;
pub use secret::Secret;
pub use thunk::{Platform, Thunk};
pub use value::Value;

static TRACING_INIT: Once = Once::new();

/// Install the stderr subscriber, filtered by `KILN_LOG` or else `RUST_LOG`.
/// Defaults to warnings only.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let filter = EnvFilter::try_from_env("KILN_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(filter)
            .init();
    });
}
