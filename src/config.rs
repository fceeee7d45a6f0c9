use serde::{Deserialize, Serialize};

/// Options applied while parsing a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    /// Fail when a block's declared size disagrees with the bytes its parser consumed.
    pub strict_sizes: bool,
    /// Keep unrecognised chunks and sections as opaque raw blocks instead of failing.
    pub preserve_unknown: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions { strict_sizes: true, preserve_unknown: true }
    }
}

/// Options applied while serializing a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Recompute the dex adler32 checksum and SHA-1 signature.
    pub update_checksum: bool,
    /// Boundary for word-aligned sections and chunks.
    pub alignment: u64,
    pub fill: u8,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions { update_checksum: true, alignment: 4, fill: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let r = ReadOptions::default();
        assert!(r.strict_sizes && r.preserve_unknown);
        let w = WriteOptions::default();
        assert_eq!((w.alignment, w.fill, w.update_checksum), (4, 0, true));
    }
}
