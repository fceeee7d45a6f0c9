//! debug_info_item: the line/address delta state machine.
//!
//! A sequence is read into typed elements, each stamped with the address (and
//! line) the state machine reached. An untouched sequence is written back
//! element for element, including the advance opcodes it was read with. Once
//! the caller edits it, the advance opcodes are regenerated from the visible
//! elements and line numbers are packed into special opcodes.

use std::cmp::Ordering;

use crate::block::{write_sleb128, write_u1, write_uleb128, Block, BlockReader};
use crate::dex::ids::{StringItem, TypeItem};
use crate::dex::reference::IndexReference;
use crate::dex::section::Section;
use crate::error::DexResult;

pub const DBG_END_SEQUENCE: u8 = 0x00;
pub const DBG_ADVANCE_PC: u8 = 0x01;
pub const DBG_ADVANCE_LINE: u8 = 0x02;
pub const DBG_START_LOCAL: u8 = 0x03;
pub const DBG_START_LOCAL_EXTENDED: u8 = 0x04;
pub const DBG_END_LOCAL: u8 = 0x05;
pub const DBG_RESTART_LOCAL: u8 = 0x06;
pub const DBG_SET_PROLOGUE_END: u8 = 0x07;
pub const DBG_SET_EPILOGUE_BEGIN: u8 = 0x08;
pub const DBG_SET_FILE: u8 = 0x09;
pub const DBG_FIRST_SPECIAL: u8 = 0x0a;

pub const DBG_LINE_BASE: i64 = -4;
pub const DBG_LINE_RANGE: i64 = 15;
/// Largest adjusted special opcode, 0xff - DBG_FIRST_SPECIAL.
pub const DBG_MAX_SPECIAL: i64 = 245;

/// Adjusted special opcode for an address/line step, if one byte can carry it.
pub fn encode_special(address_diff: u32, line_diff: i64) -> Option<u8>
{
    if !(DBG_LINE_BASE..DBG_LINE_BASE + DBG_LINE_RANGE).contains(&line_diff) {
        return None;
    }
    let value = address_diff as i64 * DBG_LINE_RANGE + (line_diff - DBG_LINE_BASE);
    if value > DBG_MAX_SPECIAL {
        return None;
    }
    Some(value as u8)
}

/// Address and line step carried by an adjusted special opcode.
pub fn decode_special(value: u8) -> (u32, i64)
{
    let v = value as i64;
    ((v / DBG_LINE_RANGE) as u32, v % DBG_LINE_RANGE + DBG_LINE_BASE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind
{
    AdvancePc,
    AdvanceLine,
    StartLocal,
    EndLocal,
    RestartLocal,
    PrologueEnd,
    EpilogueBegin,
    SetFile,
    LineNumber,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementData
{
    AdvancePc(u32),
    AdvanceLine(i32),
    StartLocal {
        register: u32,
        name: IndexReference<StringItem>,
        type_: IndexReference<TypeItem>,
        signature: Option<IndexReference<StringItem>>,
    },
    EndLocal { register: u32 },
    RestartLocal { register: u32 },
    PrologueEnd,
    EpilogueBegin,
    SetFile { name: IndexReference<StringItem> },
    /// Special opcode; `special` is the adjusted value it was read or last written with.
    LineNumber { special: u8 },
}

impl ElementData
{
    pub fn kind(&self) -> ElementKind
    {
        match self {
            ElementData::AdvancePc(_) => ElementKind::AdvancePc,
            ElementData::AdvanceLine(_) => ElementKind::AdvanceLine,
            ElementData::StartLocal { .. } => ElementKind::StartLocal,
            ElementData::EndLocal { .. } => ElementKind::EndLocal,
            ElementData::RestartLocal { .. } => ElementKind::RestartLocal,
            ElementData::PrologueEnd => ElementKind::PrologueEnd,
            ElementData::EpilogueBegin => ElementKind::EpilogueBegin,
            ElementData::SetFile { .. } => ElementKind::SetFile,
            ElementData::LineNumber { .. } => ElementKind::LineNumber,
        }
    }

    fn default_for(kind: ElementKind) -> ElementData
    {
        match kind {
            ElementKind::AdvancePc => ElementData::AdvancePc(0),
            ElementKind::AdvanceLine => ElementData::AdvanceLine(0),
            ElementKind::StartLocal => ElementData::StartLocal {
                register: 0,
                name: IndexReference::absent(),
                type_: IndexReference::absent(),
                signature: None,
            },
            ElementKind::EndLocal => ElementData::EndLocal { register: 0 },
            ElementKind::RestartLocal => ElementData::RestartLocal { register: 0 },
            ElementKind::PrologueEnd => ElementData::PrologueEnd,
            ElementKind::EpilogueBegin => ElementData::EpilogueBegin,
            ElementKind::SetFile => ElementData::SetFile { name: IndexReference::absent() },
            ElementKind::LineNumber => ElementData::LineNumber { special: 0 },
        }
    }
}

fn same_target<T>(a: &IndexReference<T>, b: &IndexReference<T>) -> bool
{
    match (a.peek(), b.peek()) {
        (Some(x), Some(y)) => x == y,
        (None, None) => a.get() == b.get(),
        _ => false,
    }
}

/// One event of the state machine, stamped with the state after it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugElement
{
    pub address: u32,
    pub line: u32,
    pub data: ElementData,
}

impl DebugElement
{
    pub fn kind(&self) -> ElementKind
    {
        self.data.kind()
    }

    /// Raw advance opcodes are bookkeeping and not part of the logical sequence.
    pub fn is_visible(&self) -> bool
    {
        !matches!(self.data, ElementData::AdvancePc(_) | ElementData::AdvanceLine(_))
    }

    /// Structural equality used to share identical sequences between methods.
    pub fn same_event(&self, other: &DebugElement) -> bool
    {
        if self.address != other.address {
            return false;
        }
        match (&self.data, &other.data) {
            (ElementData::LineNumber { .. }, ElementData::LineNumber { .. }) => self.line == other.line,
            (ElementData::StartLocal { register: r1, name: n1, type_: t1, signature: s1 },
             ElementData::StartLocal { register: r2, name: n2, type_: t2, signature: s2 }) => {
                r1 == r2 && same_target(n1, n2) && same_target(t1, t2) && match (s1, s2) {
                    (Some(a), Some(b)) => same_target(a, b),
                    (None, None) => true,
                    _ => false,
                }
            }
            (ElementData::SetFile { name: a }, ElementData::SetFile { name: b }) => same_target(a, b),
            (a, b) => a == b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugSequence
{
    line_start: u32,
    elements: Vec<DebugElement>,
    dirty: bool,
}

impl DebugSequence
{
    pub fn new(line_start: u32) -> DebugSequence
    {
        DebugSequence { line_start, elements: Vec::new(), dirty: true }
    }

    /// Decodes opcodes up to and including DBG_END_SEQUENCE.
    pub fn read(reader: &mut BlockReader<'_>, line_start: u32) -> DexResult<DebugSequence>
    {
        let mut elements = Vec::new();
        let mut address: u32 = 0;
        let mut line: u32 = line_start;

        loop
        {
            let op = reader.read_u1()?;
            let data = match op {
                DBG_END_SEQUENCE => break,
                DBG_ADVANCE_PC => {
                    let diff = reader.read_uleb128()?;
                    address = address.wrapping_add(diff);
                    ElementData::AdvancePc(diff)
                }
                DBG_ADVANCE_LINE => {
                    let diff = reader.read_sleb128()?;
                    line = line.wrapping_add_signed(diff);
                    ElementData::AdvanceLine(diff)
                }
                DBG_START_LOCAL | DBG_START_LOCAL_EXTENDED => {
                    let register = reader.read_uleb128()?;
                    let name = IndexReference::new(reader.read_uleb128()?.wrapping_sub(1));
                    let type_ = IndexReference::new(reader.read_uleb128()?.wrapping_sub(1));
                    let signature = if op == DBG_START_LOCAL_EXTENDED {
                        Some(IndexReference::new(reader.read_uleb128()?.wrapping_sub(1)))
                    } else {
                        None
                    };
                    ElementData::StartLocal { register, name, type_, signature }
                }
                DBG_END_LOCAL => ElementData::EndLocal { register: reader.read_uleb128()? },
                DBG_RESTART_LOCAL => ElementData::RestartLocal { register: reader.read_uleb128()? },
                DBG_SET_PROLOGUE_END => ElementData::PrologueEnd,
                DBG_SET_EPILOGUE_BEGIN => ElementData::EpilogueBegin,
                DBG_SET_FILE => ElementData::SetFile { name: IndexReference::new(reader.read_uleb128()?.wrapping_sub(1)) },
                special => {
                    let value = special - DBG_FIRST_SPECIAL;
                    let (ad, ld) = decode_special(value);
                    address = address.wrapping_add(ad);
                    line = line.wrapping_add_signed(ld as i32);
                    ElementData::LineNumber { special: value }
                }
            };
            elements.push(DebugElement { address, line, data });
        }

        Ok(DebugSequence { line_start, elements, dirty: false })
    }

    pub fn elements(&self) -> &[DebugElement]
    {
        &self.elements
    }

    pub fn visible(&self) -> impl Iterator<Item = &DebugElement> + '_
    {
        self.elements.iter().filter(|e| e.is_visible())
    }

    pub fn visible_len(&self) -> usize
    {
        self.visible().count()
    }

    pub fn is_dirty(&self) -> bool
    {
        self.dirty
    }

    /// Starting line as written: the first line entry's line once the sequence has been edited.
    pub fn line_start(&self) -> u32
    {
        if self.dirty {
            if let Some(first) = self.visible().find(|e| e.kind() == ElementKind::LineNumber) {
                return first.line;
            }
        }
        self.line_start
    }

    /// Moves the sequence so it starts at `line`; every line entry shifts by the same amount.
    pub fn set_line_start(&mut self, line: u32)
    {
        self.mark_dirty();
        let delta = line as i64 - self.line_start() as i64;
        for e in self.elements.iter_mut() {
            e.line = (e.line as i64 + delta).clamp(0, u32::MAX as i64) as u32;
        }
        self.line_start = line;
    }

    /// (address, line) pairs of every line entry, in sequence order.
    pub fn positions(&self) -> Vec<(u32, u32)>
    {
        self.elements.iter()
            .filter(|e| e.kind() == ElementKind::LineNumber)
            .map(|e| (e.address, e.line))
            .collect()
    }

    /// Line of the closest line entry before `index`, 0 at the start of the sequence.
    pub fn previous_line_number(&self, index: usize) -> u32
    {
        self.elements[..index.min(self.elements.len())].iter().rev()
            .find(|e| e.kind() == ElementKind::LineNumber)
            .map(|e| e.line)
            .unwrap_or(0)
    }

    fn mark_dirty(&mut self)
    {
        if !self.dirty {
            self.elements.retain(|e| e.is_visible());
            self.dirty = true;
        }
    }

    /// Returns the element of `kind` at `address`, inserting one after every element
    /// at or before that address when none exists.
    pub fn get_or_create_at_address(&mut self, kind: ElementKind, address: u32) -> usize
    {
        self.mark_dirty();
        if let Some(i) = self.elements.iter().position(|e| e.address == address && e.kind() == kind) {
            return i;
        }
        let index = self.elements.partition_point(|e| e.address <= address);
        let line = self.previous_line_number(index);
        self.elements.insert(index, DebugElement { address, line, data: ElementData::default_for(kind) });
        index
    }

    /// Adds or updates the line entry at `address`.
    pub fn set_line_at(&mut self, address: u32, line: u32) -> usize
    {
        let i = self.get_or_create_at_address(ElementKind::LineNumber, address);
        self.elements[i].line = line;
        i
    }

    pub fn element_mut(&mut self, index: usize) -> Option<&mut DebugElement>
    {
        self.mark_dirty();
        self.elements.get_mut(index)
    }

    /// Appends an element that must not precede the last one.
    pub fn push(&mut self, element: DebugElement) -> DexResult<()>
    {
        self.mark_dirty();
        if let Some(last) = self.elements.last() {
            if element.address < last.address {
                fail!(Format, "Debug element at 0x{:x} precedes last element at 0x{:x}", element.address, last.address);
            }
        }
        self.elements.push(element);
        Ok(())
    }

    pub fn remove_if<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&DebugElement) -> bool,
    {
        self.mark_dirty();
        let before = self.elements.len();
        self.elements.retain(|e| !predicate(e));
        before - self.elements.len()
    }

    pub fn clear(&mut self)
    {
        self.elements.clear();
        self.dirty = true;
    }

    /// Element-wise equality over visible elements.
    pub fn compare_sequence(&self, other: &DebugSequence) -> bool
    {
        let mut a = self.visible();
        let mut b = other.visible();
        loop {
            match (a.next(), b.next()) {
                (None, None) => return true,
                (Some(x), Some(y)) if x.same_event(y) => continue,
                _ => return false,
            }
        }
    }

    /// True when the visible elements of `prefix` open this sequence.
    pub fn starts_with(&self, prefix: &DebugSequence) -> bool
    {
        let mut a = self.visible();
        for p in prefix.visible() {
            match a.next() {
                Some(x) if x.same_event(p) => {}
                _ => return false,
            }
        }
        true
    }

    pub(crate) fn references_mut(&mut self) -> (Vec<&mut IndexReference<StringItem>>, Vec<&mut IndexReference<TypeItem>>)
    {
        let mut strings = Vec::new();
        let mut types = Vec::new();
        for e in self.elements.iter_mut() {
            match &mut e.data {
                ElementData::StartLocal { name, type_, signature, .. } => {
                    strings.push(name);
                    types.push(type_);
                    if let Some(sig) = signature {
                        strings.push(sig);
                    }
                }
                ElementData::SetFile { name } => strings.push(name),
                _ => {}
            }
        }
        (strings, types)
    }

    fn write_event(&self, data: &ElementData, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        match data {
            ElementData::AdvancePc(d) => {
                c += write_u1(bytes, DBG_ADVANCE_PC);
                c += write_uleb128(bytes, *d);
            }
            ElementData::AdvanceLine(d) => {
                c += write_u1(bytes, DBG_ADVANCE_LINE);
                c += write_sleb128(bytes, *d);
            }
            ElementData::StartLocal { register, name, type_, signature } => {
                let op = if signature.is_some() { DBG_START_LOCAL_EXTENDED } else { DBG_START_LOCAL };
                c += write_u1(bytes, op);
                c += write_uleb128(bytes, *register);
                c += write_uleb128(bytes, name.get().wrapping_add(1));
                c += write_uleb128(bytes, type_.get().wrapping_add(1));
                if let Some(sig) = signature {
                    c += write_uleb128(bytes, sig.get().wrapping_add(1));
                }
            }
            ElementData::EndLocal { register } => {
                c += write_u1(bytes, DBG_END_LOCAL);
                c += write_uleb128(bytes, *register);
            }
            ElementData::RestartLocal { register } => {
                c += write_u1(bytes, DBG_RESTART_LOCAL);
                c += write_uleb128(bytes, *register);
            }
            ElementData::PrologueEnd => c += write_u1(bytes, DBG_SET_PROLOGUE_END),
            ElementData::EpilogueBegin => c += write_u1(bytes, DBG_SET_EPILOGUE_BEGIN),
            ElementData::SetFile { name } => {
                c += write_u1(bytes, DBG_SET_FILE);
                c += write_uleb128(bytes, name.get().wrapping_add(1));
            }
            ElementData::LineNumber { special } => c += write_u1(bytes, DBG_FIRST_SPECIAL + special),
        }
        c
    }

    /// Encodes one line step, spilling to explicit advances when a special opcode cannot hold it.
    fn write_line_step(bytes: &mut Vec<u8>, address_diff: u32, line_diff: i64) -> usize
    {
        let mut c = 0;
        let mut ad = address_diff;
        let mut ld = line_diff;
        if !(DBG_LINE_BASE..DBG_LINE_BASE + DBG_LINE_RANGE).contains(&ld) {
            c += write_u1(bytes, DBG_ADVANCE_LINE);
            c += write_sleb128(bytes, ld as i32);
            ld = 0;
        }
        if ad as i64 * DBG_LINE_RANGE + (ld - DBG_LINE_BASE) > DBG_MAX_SPECIAL {
            c += write_u1(bytes, DBG_ADVANCE_PC);
            c += write_uleb128(bytes, ad);
            ad = 0;
        }
        let value = (ad as i64 * DBG_LINE_RANGE + (ld - DBG_LINE_BASE)) as u8;
        c += write_u1(bytes, DBG_FIRST_SPECIAL + value);
        c
    }

    fn write_canonical(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        let mut address: u32 = 0;
        let mut line: i64 = self.line_start() as i64;
        for e in self.visible() {
            match e.data {
                ElementData::LineNumber { .. } => {
                    c += Self::write_line_step(bytes, e.address.saturating_sub(address), e.line as i64 - line);
                    line = e.line as i64;
                }
                ref data => {
                    if e.address > address {
                        c += write_u1(bytes, DBG_ADVANCE_PC);
                        c += write_uleb128(bytes, e.address - address);
                    }
                    c += self.write_event(data, bytes);
                }
            }
            address = address.max(e.address);
        }
        c
    }

    /// Writes the opcodes followed by DBG_END_SEQUENCE.
    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        if self.dirty {
            c += self.write_canonical(bytes);
        } else {
            for e in &self.elements {
                c += self.write_event(&e.data, bytes);
            }
        }
        c += write_u1(bytes, DBG_END_SEQUENCE);
        c
    }
}

/// debug_info_item
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugInfo
{
    pub parameter_names: Vec<IndexReference<StringItem>>,
    pub sequence: DebugSequence,
}

impl DebugInfo
{
    pub fn new(line_start: u32) -> DebugInfo
    {
        DebugInfo { parameter_names: Vec::new(), sequence: DebugSequence::new(line_start) }
    }

    pub fn link(&mut self, strings: &Section<StringItem>, types: &Section<TypeItem>)
    {
        for p in self.parameter_names.iter_mut() {
            p.item(strings);
        }
        let (s, t) = self.sequence.references_mut();
        for r in s {
            r.item(strings);
        }
        for r in t {
            r.item(types);
        }
    }

    pub fn refresh(&mut self, strings: &Section<StringItem>, types: &Section<TypeItem>)
    {
        for p in self.parameter_names.iter_mut() {
            p.refresh(strings);
        }
        let (s, t) = self.sequence.references_mut();
        for r in s {
            r.refresh(strings);
        }
        for r in t {
            r.refresh(types);
        }
    }

    /// Structural equality used to share one item between methods.
    pub fn same_as(&self, other: &DebugInfo) -> bool
    {
        self.sequence.line_start() == other.sequence.line_start()
            && self.parameter_names.len() == other.parameter_names.len()
            && self.parameter_names.iter().zip(&other.parameter_names).all(|(a, b)| same_target(a, b))
            && self.sequence.compare_sequence(&other.sequence)
    }

    pub fn compare_line_start(&self, other: &DebugInfo) -> Ordering
    {
        self.sequence.line_start().cmp(&other.sequence.line_start())
    }
}

impl Block for DebugInfo
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<DebugInfo>
    {
        let line_start = reader.read_uleb128()?;
        let parameters_size = reader.read_uleb128()?;
        let mut parameter_names = Vec::with_capacity(parameters_size.min(256) as usize);
        for _ in 0..parameters_size {
            parameter_names.push(IndexReference::new(reader.read_uleb128()?.wrapping_sub(1)));
        }
        let sequence = DebugSequence::read(reader, line_start)?;
        Ok(DebugInfo { parameter_names, sequence })
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_uleb128(bytes, self.sequence.line_start());
        c += write_uleb128(bytes, self.parameter_names.len() as u32);
        for p in &self.parameter_names {
            c += write_uleb128(bytes, p.get().wrapping_add(1));
        }
        c += self.sequence.write(bytes);
        c
    }
}
