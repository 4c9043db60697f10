//! SHA-256 content identifiers for thunks.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A 32-byte content identifier: SHA-256 over a canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; 32]);

impl Cid {
    /// Compute the CID of the given bytes.
    pub fn compute(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Cid(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hexadecimal rendering.
    pub fn to_hex(&self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push(HEX[(byte >> 4) as usize] as char);
            out.push(HEX[(byte & 0x0f) as usize] as char);
        }
        out
    }

    /// First twelve hex digits, for log lines and container names.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(Error::Wire(format!(
                "CID must be 64 hex characters, got length {}",
                s.len()
            )));
        }
        let mut out = [0u8; 32];
        let bytes = s.as_bytes();
        for (i, slot) in out.iter_mut().enumerate() {
            let hi = hex_value(bytes[2 * i])?;
            let lo = hex_value(bytes[2 * i + 1])?;
            *slot = (hi << 4) | lo;
        }
        Ok(Cid(out))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let out: [u8; 32] = data.try_into().map_err(|_| {
            Error::Wire(format!("CID blob must be exactly 32 bytes, got {}", data.len()))
        })?;
        Ok(Cid(out))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.short())
    }
}

fn hex_value(byte: u8) -> Result<u8> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(Error::Wire(format!("invalid hex digit `{}`", byte as char))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        let cid = Cid::compute(b"");
        assert_eq!(
            cid.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(cid.short(), "e3b0c44298fc");
    }

    #[test]
    fn hex_parses_back() -> Result<()> {
        let cid = Cid::compute(b"kiln");
        assert_eq!(Cid::from_hex(&cid.to_hex())?, cid);
        assert!(Cid::from_hex("zz").is_err());
        Ok(())
    }

    #[test]
    fn from_slice_checks_length() {
        assert!(Cid::from_slice(&[0u8; 31]).is_err());
        assert!(Cid::from_slice(&[0u8; 32]).is_ok());
    }
}
