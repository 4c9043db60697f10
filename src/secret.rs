//! Named secret values that never leak through rendering or serialization.

use std::fmt;
use std::hint::black_box;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Sensitive bytes with a public name. The bytes are only reachable through
/// [`Secret::reveal`].
#[derive(Clone)]
pub struct Secret {
    name: Arc<str>,
    bytes: Arc<[u8]>,
}

impl Secret {
    pub fn new(name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Secret {
            name: Arc::from(name),
            bytes: Arc::from(bytes),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn reveal(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.bytes, &other.bytes)
    }
}

impl Eq for Secret {}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<secret: {} ({} bytes)>", self.name, self.bytes.len())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("secret", &*self.name)?;
        map.serialize_entry("size", &self.bytes.len())?;
        map.end()
    }
}

/// Compare two byte strings without short-circuiting on the first mismatch.
/// Only the length comparison may return early.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff = black_box(diff | (x ^ y));
    }
    diff == 0
}
