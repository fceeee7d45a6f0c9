use crate::block::leb;
use crate::error::DexResult;

/// Little-endian cursor over a byte slice, bounded by a stack of declared extents.
///
/// Every chunk or item that declares its own size pushes a limit before its body
/// is parsed and pops it afterwards; popping fails unless exactly the declared
/// extent was consumed.
#[derive(Debug, Clone)]
pub struct BlockReader<'a> {
    data: &'a [u8],
    pos: usize,
    limits: Vec<usize>,
}

impl<'a> BlockReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BlockReader { data, pos: 0, limits: Vec::new() }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// End of the innermost declared extent, or the end of the data.
    pub fn limit(&self) -> usize {
        self.limits.last().copied().unwrap_or(self.data.len())
    }

    pub fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Declares that the next `length` bytes belong to one block.
    pub fn push_limit(&mut self, length: usize) -> DexResult<()> {
        let end = match self.pos.checked_add(length) {
            Some(end) => end,
            None => fail!(Format, "Declared size {} overflows at offset {}", length, self.pos),
        };
        if end > self.limit() {
            fail!(Format, "Declared size {} at offset {} exceeds enclosing extent ending at {}",
                  length, self.pos, self.limit());
        }
        self.limits.push(end);
        Ok(())
    }

    /// Closes the innermost extent; declared and consumed length must agree.
    pub fn pop_limit(&mut self) -> DexResult<()> {
        match self.limits.pop() {
            Some(end) if end == self.pos => Ok(()),
            Some(end) => fail!(Format, "Block declared to end at {} but parsing stopped at {}", end, self.pos),
            None => fail!(Format, "No declared extent to close at offset {}", self.pos),
        }
    }

    /// Closes the innermost extent, skipping whatever the parser left unread.
    pub fn skip_to_limit(&mut self) -> DexResult<usize> {
        match self.limits.pop() {
            Some(end) if end >= self.pos => {
                let skipped = end - self.pos;
                self.pos = end;
                Ok(skipped)
            }
            Some(end) => fail!(Format, "Block declared to end at {} but parsing ran to {}", end, self.pos),
            None => fail!(Format, "No declared extent to close at offset {}", self.pos),
        }
    }

    pub fn seek(&mut self, offset: usize) -> DexResult<()> {
        if offset > self.limit() {
            fail!(Format, "Attempted to seek to {} past end of extent {}", offset, self.limit());
        }
        self.pos = offset;
        Ok(())
    }

    fn check(&self, length: usize, what: &str) -> DexResult<()> {
        if self.remaining() < length {
            fail!(Format, "Unexpected end of stream reading {} at index {}", what, self.pos);
        }
        Ok(())
    }

    pub fn read_u1(&mut self) -> DexResult<u8> {
        self.check(1, "u1")?;
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u2(&mut self) -> DexResult<u16> {
        self.check(2, "u2")?;
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    pub fn read_u4(&mut self) -> DexResult<u32> {
        self.check(4, "u4")?;
        let value = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    pub fn read_x(&mut self, length: usize) -> DexResult<Vec<u8>> {
        self.check(length, "byte array")?;
        let v = self.data[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(v)
    }

    /// Peeks at `length` bytes from the current position without consuming them.
    pub fn peek_x(&self, length: usize) -> DexResult<&'a [u8]> {
        self.check(length, "byte array")?;
        Ok(&self.data[self.pos..self.pos + length])
    }

    pub fn read_uleb128(&mut self) -> DexResult<u32> {
        let (value, size) = leb::decode_uleb128(&self.data[self.pos..self.limit()], leb::MAX_GROUPS)?;
        self.pos += size;
        Ok(value)
    }

    /// Reads a ULEB128 that may use at most `groups` 7-bit groups.
    pub fn read_uleb128_bounded(&mut self, groups: usize) -> DexResult<u32> {
        let (value, size) = leb::decode_uleb128(&self.data[self.pos..self.limit()], groups)?;
        self.pos += size;
        Ok(value)
    }

    pub fn read_uleb128p1(&mut self) -> DexResult<i64> {
        Ok(self.read_uleb128()? as i64 - 1)
    }

    pub fn read_sleb128(&mut self) -> DexResult<i32> {
        let (value, size) = leb::decode_sleb128(&self.data[self.pos..self.limit()])?;
        self.pos += size;
        Ok(value)
    }

    /// Advances to the next multiple of `alignment`, requiring the skipped bytes to exist.
    pub fn align(&mut self, alignment: u64) -> DexResult<usize> {
        let pad = crate::block::align::pad(alignment, self.pos as u64) as usize;
        self.check(pad, "alignment padding")?;
        self.pos += pad;
        Ok(pad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn reads_little_endian() {
        let data = [0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12];
        let mut r = BlockReader::new(&data);
        assert_eq!(r.read_u1().unwrap(), 1);
        assert_eq!(r.read_u2().unwrap(), 0x1234);
        assert_eq!(r.read_u4().unwrap(), 0x12345678);
        assert!(r.is_empty());
        assert_eq!(r.read_u1().unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn limits_bound_reads() {
        let data = [0u8; 8];
        let mut r = BlockReader::new(&data);
        r.push_limit(4).unwrap();
        r.read_u2().unwrap();
        assert!(r.read_u4().is_err());
        // consumed 2 of the 4 declared bytes
        assert_eq!(r.clone().pop_limit().unwrap_err().kind(), ErrorKind::Format);
        r.read_u2().unwrap();
        r.pop_limit().unwrap();
        assert_eq!(r.remaining(), 4);
    }

    #[test]
    fn nested_limit_cannot_exceed_parent() {
        let data = [0u8; 8];
        let mut r = BlockReader::new(&data);
        r.push_limit(4).unwrap();
        assert!(r.push_limit(6).is_err());
        assert_eq!(r.skip_to_limit().unwrap(), 4);
        assert_eq!(r.position(), 4);
    }
}
