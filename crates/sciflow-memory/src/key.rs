//! Stable plan cache keys
//!
//! A key is the Blake3 digest of (instruction, column list, shape) and, in
//! content mode, a digest of the dataset values.

use std::fmt::{self, Display, Formatter};

/// 32-byte plan cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlanKey([u8; 32]);

impl PlanKey {
    /// Key over instruction, columns and shape
    #[must_use]
    pub fn new(instruction: &str, columns: &[String], shape: (usize, usize)) -> Self {
        Self::derive(instruction, columns, shape, None)
    }

    /// Key that also covers the dataset contents
    #[must_use]
    pub fn with_content(
        instruction: &str,
        columns: &[String],
        shape: (usize, usize),
        content_digest: &str,
    ) -> Self {
        Self::derive(instruction, columns, shape, Some(content_digest))
    }

    fn derive(
        instruction: &str,
        columns: &[String],
        shape: (usize, usize),
        content: Option<&str>,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        // Length prefixes keep ("ab", ["c"]) and ("a", ["bc"]) apart
        let mut field = |bytes: &[u8]| {
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(instruction.as_bytes());
        field(&(columns.len() as u64).to_le_bytes());
        for column in columns {
            field(column.as_bytes());
        }
        field(&(shape.0 as u64).to_le_bytes());
        field(&(shape.1 as u64).to_le_bytes());
        if let Some(digest) = content {
            field(digest.as_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw digest bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 16 hex characters, for logs
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for PlanKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
