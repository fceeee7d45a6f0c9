/* code_item: registers, instructions, try blocks and catch handlers */

use log::trace;

use crate::block::{narrow, write_sleb128, write_u2, write_u4, write_uleb128, write_x, Block, BlockReader};
use crate::dex::debug::DebugInfo;
use crate::dex::ids::{FieldItem, IdSections, MethodItem, ProtoItem, StringItem, TypeItem};
use crate::dex::insn::{scan_operands, ReferenceType};
use crate::dex::reference::{IndexReference, OffsetReference};
use crate::dex::section::Section;
use crate::error::DexResult;

/// Pool index embedded in an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnTarget
{
    String(IndexReference<StringItem>),
    Type(IndexReference<TypeItem>),
    Field(IndexReference<FieldItem>),
    Method(IndexReference<MethodItem>),
    Proto(IndexReference<ProtoItem>),
}

impl InsnTarget
{
    fn reference_type(&self) -> ReferenceType
    {
        match self {
            InsnTarget::String(_) => ReferenceType::String,
            InsnTarget::Type(_) => ReferenceType::Type,
            InsnTarget::Field(_) => ReferenceType::Field,
            InsnTarget::Method(_) => ReferenceType::Method,
            InsnTarget::Proto(_) => ReferenceType::MethodProto,
        }
    }

    fn raw(&self) -> u32
    {
        match self {
            InsnTarget::String(r) => r.get(),
            InsnTarget::Type(r) => r.get(),
            InsnTarget::Field(r) => r.get(),
            InsnTarget::Method(r) => r.get(),
            InsnTarget::Proto(r) => r.get(),
        }
    }

    fn link(&mut self, ids: &IdSections<'_>)
    {
        match self {
            InsnTarget::String(r) => { r.item(ids.strings); }
            InsnTarget::Type(r) => { r.item(ids.types); }
            InsnTarget::Field(r) => { r.item(ids.fields); }
            InsnTarget::Method(r) => { r.item(ids.methods); }
            InsnTarget::Proto(r) => { r.item(ids.protos); }
        }
    }

    fn refresh(&mut self, ids: &IdSections<'_>)
    {
        match self {
            InsnTarget::String(r) => r.refresh(ids.strings),
            InsnTarget::Type(r) => r.refresh(ids.types),
            InsnTarget::Field(r) => r.refresh(ids.fields),
            InsnTarget::Method(r) => r.refresh(ids.methods),
            InsnTarget::Proto(r) => r.refresh(ids.protos),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnReference
{
    pub pos: usize,
    pub wide: bool,
    pub target: InsnTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryItem
{
    pub start_addr: u32,
    pub insn_count: u16,
    /// Position in [`CodeItem::handlers`].
    pub handler: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatchHandler
{
    pub catches: Vec<(IndexReference<TypeItem>, u32)>,
    pub catch_all: Option<u32>,
}

impl CatchHandler
{
    fn read(reader: &mut BlockReader<'_>) -> DexResult<CatchHandler>
    {
        let size = reader.read_sleb128()?;
        let mut catches = Vec::with_capacity(size.unsigned_abs().min(256) as usize);
        for _ in 0..size.unsigned_abs() {
            let type_idx = reader.read_uleb128()?;
            let addr = reader.read_uleb128()?;
            catches.push((IndexReference::new(type_idx), addr));
        }
        let catch_all = if size <= 0 { Some(reader.read_uleb128()?) } else { None };
        Ok(CatchHandler { catches, catch_all })
    }

    fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        let n = self.catches.len() as i32;
        c += write_sleb128(bytes, if self.catch_all.is_some() { -n } else { n });
        for (t, addr) in &self.catches {
            c += write_uleb128(bytes, t.get());
            c += write_uleb128(bytes, *addr);
        }
        if let Some(addr) = self.catch_all {
            c += write_uleb128(bytes, addr);
        }
        c
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeItem
{
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub debug_info: OffsetReference<DebugInfo>,
    pub insns: Vec<u16>,
    pub references: Vec<InsnReference>,
    pub tries: Vec<TryItem>,
    pub handlers: Vec<CatchHandler>,
}

impl CodeItem
{
    pub fn new(registers_size: u16, ins_size: u16, outs_size: u16, insns: Vec<u16>) -> CodeItem
    {
        CodeItem { registers_size, ins_size, outs_size, insns, ..Default::default() }
    }

    /// Turns every pool index in the instruction stream into a resolved reference.
    pub fn link(&mut self, ids: &IdSections<'_>) -> DexResult<()>
    {
        let mut references = Vec::new();
        for op in scan_operands(&self.insns)? {
            let units = if op.wide { 2 } else { 1 };
            let raw = match self.insns.get(op.pos..op.pos + units) {
                Some([lo]) => *lo as u32,
                Some([lo, hi]) => *lo as u32 | ((*hi as u32) << 16),
                _ => fail!(Format, "Operand at code unit {} runs past the instructions", op.pos),
            };
            let target = match op.kind {
                ReferenceType::String => InsnTarget::String(IndexReference::new(raw)),
                ReferenceType::Type => InsnTarget::Type(IndexReference::new(raw)),
                ReferenceType::Field => InsnTarget::Field(IndexReference::new(raw)),
                ReferenceType::Method => InsnTarget::Method(IndexReference::new(raw)),
                ReferenceType::MethodProto => InsnTarget::Proto(IndexReference::new(raw)),
                // call sites and method handles are never renumbered
                _ => continue,
            };
            let mut r = InsnReference { pos: op.pos, wide: op.wide, target };
            r.target.link(ids);
            references.push(r);
        }
        trace!("linked {} instruction references", references.len());
        self.references = references;
        for h in self.handlers.iter_mut() {
            for (t, _) in h.catches.iter_mut() {
                t.item(ids.types);
            }
        }
        Ok(())
    }

    pub fn link_debug_info(&mut self, debug_infos: &Section<DebugInfo>)
    {
        self.debug_info.item(debug_infos);
    }

    /// Points the operand at `pos` to a new target of the matching kind.
    pub fn bind(&mut self, pos: usize, target: InsnTarget) -> DexResult<()>
    {
        let op = match scan_operands(&self.insns)?.into_iter().find(|o| o.pos == pos) {
            Some(op) => op,
            None => fail!(IndexOutOfRange, "No pool index operand at code unit {}", pos),
        };
        if op.kind != target.reference_type() {
            fail!(InvalidKey, "Operand at code unit {} takes {:?}, not {:?}", pos, op.kind, target.reference_type());
        }
        let r = InsnReference { pos, wide: op.wide, target };
        match self.references.iter_mut().find(|r| r.pos == pos) {
            Some(existing) => *existing = r,
            None => {
                self.references.push(r);
                self.references.sort_by_key(|r| r.pos);
            }
        }
        Ok(())
    }

    /// Writes current indexes back into the instruction stream.
    pub fn refresh(&mut self, ids: &IdSections<'_>, debug_infos: &Section<DebugInfo>) -> DexResult<()>
    {
        let len = self.insns.len();
        for r in self.references.iter_mut() {
            r.target.refresh(ids);
            let raw = r.target.raw();
            let units = if r.wide { 2 } else { 1 };
            match self.insns.get_mut(r.pos..r.pos + units) {
                Some([lo, hi]) => {
                    *lo = raw as u16;
                    *hi = (raw >> 16) as u16;
                }
                Some([lo]) => *lo = narrow(raw, "instruction index operand")?,
                _ => fail!(IndexOutOfRange, "Operand at code unit {} lies past the {} code units of the item", r.pos, len),
            }
        }
        for h in self.handlers.iter_mut() {
            for (t, _) in h.catches.iter_mut() {
                t.refresh(ids.types);
            }
        }
        self.debug_info.refresh(debug_infos);
        Ok(())
    }

    fn encode_handlers(&self) -> (Vec<u8>, Vec<u16>)
    {
        let mut list = Vec::new();
        let mut offsets = Vec::with_capacity(self.handlers.len());
        write_uleb128(&mut list, self.handlers.len() as u32);
        for h in &self.handlers {
            offsets.push(list.len() as u16);
            h.write(&mut list);
        }
        (list, offsets)
    }
}

impl Block for CodeItem
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<CodeItem>
    {
        let registers_size = reader.read_u2()?;
        let ins_size = reader.read_u2()?;
        let outs_size = reader.read_u2()?;
        let tries_size = reader.read_u2()?;
        let debug_info = OffsetReference::new(reader.read_u4()?);
        let insns_size = reader.read_u4()?;
        if insns_size as usize * 2 > reader.remaining() {
            fail!(Format, "Code item declares {} code units with {} bytes left", insns_size, reader.remaining());
        }
        let mut insns = Vec::with_capacity(insns_size as usize);
        for _ in 0..insns_size { insns.push(reader.read_u2()?); }

        let mut raw_tries = Vec::with_capacity(tries_size as usize);
        let mut handlers = Vec::new();
        if tries_size > 0
        {
            if insns_size % 2 == 1 { reader.read_u2()?; }
            for _ in 0..tries_size {
                raw_tries.push((reader.read_u4()?, reader.read_u2()?, reader.read_u2()?));
            }
            let base = reader.position();
            let count = reader.read_uleb128()?;
            let mut offsets = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                offsets.push(reader.position() - base);
                handlers.push(CatchHandler::read(reader)?);
            }
            let mut tries = Vec::with_capacity(raw_tries.len());
            for (start_addr, insn_count, handler_off) in raw_tries {
                let handler = match offsets.iter().position(|o| *o == handler_off as usize) {
                    Some(h) => h,
                    None => fail!(Format, "Try block at 0x{:x} names handler offset {} that starts no handler", start_addr, handler_off),
                };
                tries.push(TryItem { start_addr, insn_count, handler });
            }
            return Ok(CodeItem { registers_size, ins_size, outs_size, debug_info, insns, references: Vec::new(), tries, handlers });
        }

        Ok(CodeItem { registers_size, ins_size, outs_size, debug_info, insns, references: Vec::new(), tries: Vec::new(), handlers })
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u2(bytes, self.registers_size);
        c += write_u2(bytes, self.ins_size);
        c += write_u2(bytes, self.outs_size);
        c += write_u2(bytes, self.tries.len() as u16);
        c += write_u4(bytes, self.debug_info.get());
        c += write_u4(bytes, self.insns.len() as u32);
        for i in &self.insns { c += write_u2(bytes, *i); }
        if !self.tries.is_empty()
        {
            if self.insns.len() % 2 == 1 { c += write_u2(bytes, 0); }
            let (list, offsets) = self.encode_handlers();
            for t in &self.tries {
                c += write_u4(bytes, t.start_addr);
                c += write_u2(bytes, t.insn_count);
                c += write_u2(bytes, offsets.get(t.handler).copied().unwrap_or(0));
            }
            c += write_x(bytes, &list);
        }
        c
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::dex::section::SectionType;

    #[test]
    fn try_and_handler_roundtrip()
    {
        let mut code = CodeItem::new(2, 1, 1, vec![0x0012, 0x000e, 0x000e]);
        code.handlers.push(CatchHandler { catches: vec![(IndexReference::new(3), 1)], catch_all: None });
        code.handlers.push(CatchHandler { catches: vec![], catch_all: Some(2) });
        code.tries.push(TryItem { start_addr: 0, insn_count: 1, handler: 1 });
        code.tries.push(TryItem { start_addr: 1, insn_count: 1, handler: 0 });

        let mut out = Vec::new();
        let n = code.write_bytes(&mut out);
        assert_eq!(n, out.len());
        // header + 3 units + padding + two tries + handler list
        assert_eq!(&out[16..24], &[0x12, 0x00, 0x0e, 0x00, 0x0e, 0x00, 0x00, 0x00]);
        let back = CodeItem::read_bytes(&mut BlockReader::new(&out)).unwrap();
        assert_eq!(back.tries, code.tries);
        assert_eq!(back.handlers, code.handlers);
        let mut again = Vec::new();
        back.write_bytes(&mut again);
        assert_eq!(again, out);
    }

    #[test]
    fn references_follow_renumbering()
    {
        let mut strings = Section::new(SectionType::StringId);
        let a = strings.push(StringItem::new(crate::dex::ids::DexString::from_string("a")));
        let b = strings.push(StringItem::new(crate::dex::ids::DexString::from_string("b")));
        let types = Section::new(SectionType::TypeId);
        let protos = Section::new(SectionType::ProtoId);
        let fields = Section::new(SectionType::FieldId);
        let methods = Section::new(SectionType::MethodId);
        let debug = Section::new(SectionType::DebugInfo);

        // const-string v0, string@1 ; return-void
        let mut code = CodeItem::new(1, 0, 0, vec![0x001a, 0x0001, 0x000e]);
        {
            let ids = IdSections { strings: &strings, types: &types, protos: &protos, fields: &fields, methods: &methods };
            code.link(&ids).unwrap();
        }
        assert_eq!(code.references.len(), 1);
        strings.move_to(b, 0).unwrap();
        assert_eq!(strings.index_of(a), Some(1));
        let ids = IdSections { strings: &strings, types: &types, protos: &protos, fields: &fields, methods: &methods };
        code.refresh(&ids, &debug).unwrap();
        assert_eq!(code.insns, vec![0x001a, 0x0000, 0x000e]);

        code.bind(1, InsnTarget::String(IndexReference::to(a))).unwrap();
        code.refresh(&ids, &debug).unwrap();
        assert_eq!(code.insns[1], 1);
        assert!(code.bind(1, InsnTarget::Type(IndexReference::absent())).is_err());
        assert!(code.bind(2, InsnTarget::String(IndexReference::to(a))).is_err());
    }

    #[test]
    fn shortened_instructions_fail_refresh()
    {
        let mut strings = Section::new(SectionType::StringId);
        strings.push(StringItem::new(crate::dex::ids::DexString::from_string("a")));
        let types = Section::new(SectionType::TypeId);
        let protos = Section::new(SectionType::ProtoId);
        let fields = Section::new(SectionType::FieldId);
        let methods = Section::new(SectionType::MethodId);
        let debug = Section::new(SectionType::DebugInfo);
        let ids = IdSections { strings: &strings, types: &types, protos: &protos, fields: &fields, methods: &methods };

        // const-string/jumbo v0, string@0 ; return-void
        let mut code = CodeItem::new(1, 0, 0, vec![0x001b, 0x0000, 0x0000, 0x000e]);
        code.link(&ids).unwrap();
        assert!(code.references[0].wide);
        code.insns.truncate(2);
        let err = code.refresh(&ids, &debug).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IndexOutOfRange);
        code.insns.clear();
        assert_eq!(code.refresh(&ids, &debug).unwrap_err().kind(), crate::error::ErrorKind::IndexOutOfRange);
    }
}
