//! Build-graph execution: plan a thunk's transitive inputs into levels and
//! run each level in parallel before the thunk itself.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Deserialize;
use smallvec::SmallVec;
use tracing::{debug, info};

use super::{RunResult, Runtime};
use crate::cid::Cid;
use crate::error::{Error, Result};
use crate::eval::Context;
use crate::path::ThunkPath;
use crate::thunk::{ImageRef, Thunk};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Backend that executes each node.
    pub runtime: String,
    pub config: serde_json::Value,
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            runtime: "local".to_string(),
            config: serde_json::Value::Null,
        }
    }
}

pub type Level = SmallVec<[Arc<Thunk>; 4]>;

/// Inputs grouped so that every thunk's inputs sit in earlier levels. The
/// root itself is not included.
pub fn plan(thunk: &Thunk) -> Result<Vec<Level>> {
    let mut depths: HashMap<Cid, (usize, Arc<Thunk>)> = HashMap::new();
    let mut top = 0;
    for input in thunk.inputs() {
        top = top.max(depth(&input, &mut depths)? + 1);
    }
    let mut levels: Vec<Level> = vec![Level::new(); top];
    let mut nodes: Vec<_> = depths.into_values().collect();
    nodes.sort_by_key(|(depth, node)| (*depth, node.hash().ok()));
    for (depth, node) in nodes {
        levels[depth].push(node);
    }
    Ok(levels)
}

fn depth(thunk: &Arc<Thunk>, depths: &mut HashMap<Cid, (usize, Arc<Thunk>)>) -> Result<usize> {
    let cid = thunk.hash()?;
    if let Some((known, _)) = depths.get(&cid) {
        return Ok(*known);
    }
    let mut level = 0;
    for input in thunk.inputs() {
        level = level.max(depth(&input, depths)? + 1);
    }
    depths.insert(cid, (level, thunk.clone()));
    Ok(level)
}

pub struct GraphRuntime {
    inner: Arc<dyn Runtime>,
}

impl GraphRuntime {
    pub fn new(inner: Arc<dyn Runtime>) -> Self {
        GraphRuntime { inner }
    }

    fn run_node(&self, ctx: &Context, node: &Thunk) -> Result<()> {
        ctx.check()?;
        let result = self.inner.run(ctx, node)?;
        if !result.success() {
            return Err(Error::Exit {
                code: result.exit_code,
                thunk: node.name()?,
            });
        }
        Ok(())
    }
}

impl Runtime for GraphRuntime {
    fn name(&self) -> &str {
        "graph"
    }

    fn run(&self, ctx: &Context, thunk: &Thunk) -> Result<RunResult> {
        let levels = plan(thunk)?;
        info!(thunk = %thunk.hash()?.short(), levels = levels.len(), "running graph");
        for (index, level) in levels.iter().enumerate() {
            debug!(level = index, width = level.len(), "running level");
            level
                .as_slice()
                .par_iter()
                .try_for_each(|node| self.run_node(ctx, node))?;
        }
        self.inner.run(ctx, thunk)
    }

    fn read(&self, ctx: &Context, path: &ThunkPath) -> Result<Vec<u8>> {
        self.inner.read(ctx, path)
    }

    fn resolve(&self, ctx: &Context, image: &ImageRef) -> Result<ImageRef> {
        self.inner.resolve(ctx, image)
    }

    fn export(&self, ctx: &Context, path: &ThunkPath, dest: &Path) -> Result<()> {
        self.inner.export(ctx, path, dest)
    }
}
