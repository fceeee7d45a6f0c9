use serde::{Deserialize, Serialize};

/// Number of padding bytes needed so that `position` advances to a multiple of `alignment`.
///
/// Alignment of 0 or 1 never pads.
pub fn pad(alignment: u64, position: u64) -> u64 {
    if alignment <= 1 {
        return 0;
    }
    (alignment - position % alignment) % alignment
}

/// Padding block placing the following sibling on an `alignment` boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignPad {
    pub alignment: u64,
    pub fill: u8,
}

impl Default for AlignPad {
    fn default() -> Self {
        AlignPad { alignment: 4, fill: 0 }
    }
}

impl AlignPad {
    pub fn new(alignment: u64) -> Self {
        AlignPad { alignment, fill: 0 }
    }

    pub fn with_fill(alignment: u64, fill: u8) -> Self {
        AlignPad { alignment, fill }
    }

    pub fn size_at(&self, position: u64) -> u64 {
        pad(self.alignment, position)
    }

    /// Appends the fill bytes so the buffer length becomes aligned.
    pub fn write(&self, buffer: &mut Vec<u8>) -> usize {
        self.write_at(buffer, buffer.len() as u64)
    }

    /// Appends padding computed for an absolute `position` that may differ from the buffer length.
    pub fn write_at(&self, buffer: &mut Vec<u8>, position: u64) -> usize {
        let n = self.size_at(position) as usize;
        buffer.resize(buffer.len() + n, self.fill);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pads_to_boundary() {
        assert_eq!(pad(4, 0), 0);
        assert_eq!(pad(4, 5), 3);
        assert_eq!(pad(4, 8), 0);
        assert_eq!(pad(1, 7), 0);
        assert_eq!(pad(0, 7), 0);
        assert_eq!(pad(8, u64::MAX), 1);
    }

    #[test]
    fn writes_fill_bytes() {
        let mut buf = vec![1, 2, 3];
        let n = AlignPad::with_fill(4, 0xAA).write(&mut buf);
        assert_eq!(n, 1);
        assert_eq!(buf, vec![1, 2, 3, 0xAA]);
        assert_eq!(AlignPad::default().write(&mut buf), 0);
    }

    proptest! {
        #[test]
        fn pad_reaches_boundary(alignment in 0u64..64, position in any::<u64>()) {
            let r = pad(alignment, position);
            if alignment <= 1 {
                prop_assert_eq!(r, 0);
            } else {
                prop_assert!(r < alignment);
                prop_assert_eq!((position as u128 + r as u128) % alignment as u128, 0);
            }
        }
    }
}
