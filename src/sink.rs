//! Destinations for values produced by `emit`.

use std::io::Write;

use parking_lot::Mutex;

use crate::error::Result;
use crate::value::Value;

pub trait Sink: Send + Sync {
    fn emit(&self, value: &Value) -> Result<()>;
}

/// Collects emitted values in memory.
#[derive(Default)]
pub struct MemorySink {
    values: Mutex<Vec<Value>>,
}

impl MemorySink {
    pub fn values(&self) -> Vec<Value> {
        self.values.lock().clone()
    }
}

impl Sink for MemorySink {
    fn emit(&self, value: &Value) -> Result<()> {
        self.values.lock().push(value.clone());
        Ok(())
    }
}

/// Writes each emitted value as one line of JSON.
pub struct JsonSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(out: W) -> Self {
        JsonSink {
            out: Mutex::new(out),
        }
    }
}

impl<W: Write + Send> Sink for JsonSink<W> {
    fn emit(&self, value: &Value) -> Result<()> {
        let line = value.to_json()?;
        let mut out = self.out.lock();
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}
