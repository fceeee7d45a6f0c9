//! Instruction layout table: enough of the Dalvik encoding to walk an
//! instruction stream and locate the pool indexes embedded in it.

use once_cell::sync::Lazy;
use rangemap::RangeInclusiveMap;

use crate::error::DexResult;

/// Represents different types of references used by opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceType {
    None,
    String,
    Type,
    Field,
    Method,
    CallSite,
    MethodProto,
    MethodHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Format10t,
    Format10x,
    Format11n,
    Format11x,
    Format12x,
    Format20t,
    Format21c,
    Format21h,
    Format21s,
    Format21t,
    Format22b,
    Format22c,
    Format22s,
    Format22t,
    Format22x,
    Format23x,
    Format30t,
    Format31c,
    Format31i,
    Format31t,
    Format32x,
    Format35c,
    Format3rc,
    Format45cc,
    Format4rcc,
    Format51l,
}

impl Format {
    /// Length in 16-bit code units.
    pub const fn units(&self) -> usize {
        match self {
            Format::Format10t
            | Format::Format10x
            | Format::Format11n
            | Format::Format11x
            | Format::Format12x => 1,

            Format::Format20t
            | Format::Format21c
            | Format::Format21h
            | Format::Format21s
            | Format::Format21t
            | Format::Format22b
            | Format::Format22c
            | Format::Format22s
            | Format::Format22t
            | Format::Format22x
            | Format::Format23x => 2,

            Format::Format30t
            | Format::Format31c
            | Format::Format31i
            | Format::Format31t
            | Format::Format32x
            | Format::Format35c
            | Format::Format3rc => 3,

            Format::Format45cc | Format::Format4rcc => 4,

            Format::Format51l => 5,
        }
    }
}

pub const PACKED_SWITCH_PAYLOAD: u16 = 0x0100;
pub const SPARSE_SWITCH_PAYLOAD: u16 = 0x0200;
pub const FILL_ARRAY_DATA_PAYLOAD: u16 = 0x0300;

static LAYOUT: Lazy<RangeInclusiveMap<u8, (Format, ReferenceType)>> = Lazy::new(|| {
    use Format::*;
    use ReferenceType as R;
    let mut m = RangeInclusiveMap::new();
    m.insert(0x00..=0x00, (Format10x, R::None));
    m.insert(0x01..=0x01, (Format12x, R::None));
    m.insert(0x02..=0x02, (Format22x, R::None));
    m.insert(0x03..=0x03, (Format32x, R::None));
    m.insert(0x04..=0x04, (Format12x, R::None));
    m.insert(0x05..=0x05, (Format22x, R::None));
    m.insert(0x06..=0x06, (Format32x, R::None));
    m.insert(0x07..=0x07, (Format12x, R::None));
    m.insert(0x08..=0x08, (Format22x, R::None));
    m.insert(0x09..=0x09, (Format32x, R::None));
    m.insert(0x0a..=0x0d, (Format11x, R::None));
    m.insert(0x0e..=0x0e, (Format10x, R::None));
    m.insert(0x0f..=0x11, (Format11x, R::None));
    m.insert(0x12..=0x12, (Format11n, R::None));
    m.insert(0x13..=0x13, (Format21s, R::None));
    m.insert(0x14..=0x14, (Format31i, R::None));
    m.insert(0x15..=0x15, (Format21h, R::None));
    m.insert(0x16..=0x16, (Format21s, R::None));
    m.insert(0x17..=0x17, (Format31i, R::None));
    m.insert(0x18..=0x18, (Format51l, R::None));
    m.insert(0x19..=0x19, (Format21h, R::None));
    m.insert(0x1a..=0x1a, (Format21c, R::String));
    m.insert(0x1b..=0x1b, (Format31c, R::String));
    m.insert(0x1c..=0x1c, (Format21c, R::Type));
    m.insert(0x1d..=0x1e, (Format11x, R::None));
    m.insert(0x1f..=0x1f, (Format21c, R::Type));
    m.insert(0x20..=0x20, (Format22c, R::Type));
    m.insert(0x21..=0x21, (Format12x, R::None));
    m.insert(0x22..=0x22, (Format21c, R::Type));
    m.insert(0x23..=0x23, (Format22c, R::Type));
    m.insert(0x24..=0x24, (Format35c, R::Type));
    m.insert(0x25..=0x25, (Format3rc, R::Type));
    m.insert(0x26..=0x26, (Format31t, R::None));
    m.insert(0x27..=0x27, (Format11x, R::None));
    m.insert(0x28..=0x28, (Format10t, R::None));
    m.insert(0x29..=0x29, (Format20t, R::None));
    m.insert(0x2a..=0x2a, (Format30t, R::None));
    m.insert(0x2b..=0x2c, (Format31t, R::None));
    m.insert(0x2d..=0x31, (Format23x, R::None));
    m.insert(0x32..=0x37, (Format22t, R::None));
    m.insert(0x38..=0x3d, (Format21t, R::None));
    m.insert(0x3e..=0x43, (Format10x, R::None));
    m.insert(0x44..=0x51, (Format23x, R::None));
    m.insert(0x52..=0x5f, (Format22c, R::Field));
    m.insert(0x60..=0x6d, (Format21c, R::Field));
    m.insert(0x6e..=0x72, (Format35c, R::Method));
    m.insert(0x73..=0x73, (Format10x, R::None));
    m.insert(0x74..=0x78, (Format3rc, R::Method));
    m.insert(0x79..=0x7a, (Format10x, R::None));
    m.insert(0x7b..=0x8f, (Format12x, R::None));
    m.insert(0x90..=0xaf, (Format23x, R::None));
    m.insert(0xb0..=0xcf, (Format12x, R::None));
    m.insert(0xd0..=0xd7, (Format22s, R::None));
    m.insert(0xd8..=0xe2, (Format22b, R::None));
    m.insert(0xe3..=0xf9, (Format10x, R::None));
    m.insert(0xfa..=0xfa, (Format45cc, R::Method));
    m.insert(0xfb..=0xfb, (Format4rcc, R::Method));
    m.insert(0xfc..=0xfc, (Format35c, R::CallSite));
    m.insert(0xfd..=0xfd, (Format3rc, R::CallSite));
    m.insert(0xfe..=0xfe, (Format21c, R::MethodHandle));
    m.insert(0xff..=0xff, (Format21c, R::MethodProto));
    m
});

pub fn layout_of(opcode: u8) -> (Format, ReferenceType) {
    LAYOUT.get(&opcode).copied().unwrap_or((Format::Format10x, ReferenceType::None))
}

/// A pool index embedded in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    /// Code unit holding the index (low half when wide).
    pub pos: usize,
    /// Spans two code units.
    pub wide: bool,
    pub kind: ReferenceType,
}

fn unit(insns: &[u16], pc: usize) -> DexResult<u16> {
    match insns.get(pc) {
        Some(u) => Ok(*u),
        None => fail!(Format, "Payload at {} runs past the end of {} code units", pc, insns.len()),
    }
}

/// Length of the pseudo-instruction or instruction starting at `pc`.
pub fn insn_units(insns: &[u16], pc: usize) -> DexResult<usize> {
    let first = unit(insns, pc)?;
    let len = match first {
        PACKED_SWITCH_PAYLOAD => unit(insns, pc + 1)? as usize * 2 + 4,
        SPARSE_SWITCH_PAYLOAD => unit(insns, pc + 1)? as usize * 4 + 2,
        FILL_ARRAY_DATA_PAYLOAD => {
            let width = unit(insns, pc + 1)? as usize;
            let size = unit(insns, pc + 2)? as usize | ((unit(insns, pc + 3)? as usize) << 16);
            (size * width + 1) / 2 + 4
        }
        _ => layout_of((first & 0xff) as u8).0.units(),
    };
    Ok(len)
}

/// Walks the instruction stream and returns every embedded pool index.
pub fn scan_operands(insns: &[u16]) -> DexResult<Vec<Operand>> {
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < insns.len() {
        let len = insn_units(insns, pc)?;
        if pc + len > insns.len() {
            fail!(Format, "Instruction 0x{:04x} at {} overruns {} code units", insns[pc], pc, insns.len());
        }
        let (format, kind) = layout_of((insns[pc] & 0xff) as u8);
        if kind != ReferenceType::None && !matches!(insns[pc], PACKED_SWITCH_PAYLOAD | SPARSE_SWITCH_PAYLOAD | FILL_ARRAY_DATA_PAYLOAD) {
            match format {
                Format::Format31c => out.push(Operand { pos: pc + 1, wide: true, kind }),
                Format::Format45cc | Format::Format4rcc => {
                    out.push(Operand { pos: pc + 1, wide: false, kind });
                    out.push(Operand { pos: pc + 3, wide: false, kind: ReferenceType::MethodProto });
                }
                _ => out.push(Operand { pos: pc + 1, wide: false, kind }),
            }
        }
        pc += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_operands_and_skips_payloads() {
        let insns = [
            0x001a, 0x0005,         // const-string v0, string@5
            0x001b, 0x0001, 0x0001, // const-string/jumbo v0, string@0x10001
            0x2070, 0x0003, 0x0010, // invoke-direct {v0, v1}, method@3
            0x0000,                 // nop
            0x0300, 0x0001, 0x0003, 0x0000, 0x0201, 0x0003, // fill-array-data payload, 3 bytes
            0x10fa, 0x0002, 0x0000, 0x0007, // invoke-polymorphic method@2 proto@7
            0x000e,                 // return-void
        ];
        let ops = scan_operands(&insns).unwrap();
        assert_eq!(ops, vec![
            Operand { pos: 1, wide: false, kind: ReferenceType::String },
            Operand { pos: 3, wide: true, kind: ReferenceType::String },
            Operand { pos: 6, wide: false, kind: ReferenceType::Method },
            Operand { pos: 16, wide: false, kind: ReferenceType::Method },
            Operand { pos: 18, wide: false, kind: ReferenceType::MethodProto },
        ]);
    }

    #[test]
    fn rejects_truncated_instruction() {
        assert!(scan_operands(&[0x001a]).is_err());
        assert!(scan_operands(&[0x0100, 0x0004, 0x0000]).is_err());
        assert_eq!(insn_units(&[0x0200, 0x0002], 0).unwrap(), 10);
    }

    #[test]
    fn layout_covers_every_opcode() {
        for op in 0..=0xffu8 {
            assert!(LAYOUT.get(&op).is_some(), "opcode 0x{:02x}", op);
        }
        assert_eq!(layout_of(0x18).0.units(), 5);
    }
}
