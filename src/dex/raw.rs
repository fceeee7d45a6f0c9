//! Sections kept as opaque bytes.
//!
//! Annotation structures, encoded arrays, call sites, method handles, hidden
//! api data and unknown map entries are not modelled. Their bytes are carried
//! verbatim and only the absolute offsets and id indexes inside them are
//! tracked, so they can follow the modelled sections when those move or
//! renumber.
//!
//! Indexes inside `encoded_value`s and annotation uleb128 slots have no fixed
//! width. When a renumbered index needs more bytes than it was read with, the
//! section is re-encoded from the bytes as read and every later position in it
//! shifts; [`RawSection::position`] maps read positions to current ones.

use std::collections::HashMap;

use log::{trace, warn};
use rangemap::RangeMap;

use crate::block::{narrow, put_u4, write_u1, write_u2, write_u4, write_uleb128, write_x, BlockReader, Width};
use crate::dex::ids::{FieldItem, IdSections, MethodItem, ProtoItem, StringItem, TypeItem};
use crate::dex::reference::IndexReference;
use crate::dex::section::SectionType;
use crate::error::DexResult;

const VALUE_BYTE: u8 = 0x00;
const VALUE_SHORT: u8 = 0x02;
const VALUE_CHAR: u8 = 0x03;
const VALUE_INT: u8 = 0x04;
const VALUE_LONG: u8 = 0x06;
const VALUE_FLOAT: u8 = 0x10;
const VALUE_DOUBLE: u8 = 0x11;
const VALUE_METHOD_TYPE: u8 = 0x15;
const VALUE_METHOD_HANDLE: u8 = 0x16;
const VALUE_STRING: u8 = 0x17;
const VALUE_TYPE: u8 = 0x18;
const VALUE_FIELD: u8 = 0x19;
const VALUE_METHOD: u8 = 0x1a;
const VALUE_ENUM: u8 = 0x1b;
const VALUE_ARRAY: u8 = 0x1c;
const VALUE_ANNOTATION: u8 = 0x1d;
const VALUE_NULL: u8 = 0x1e;
const VALUE_BOOLEAN: u8 = 0x1f;

const MAX_VALUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Extent
{
    origin: u32,
    offset: u32,
    shifts: Vec<(u32, i64)>,
}

/// Maps offsets as read to offsets in the current layout.
#[derive(Debug, Default)]
pub struct Relocator
{
    items: HashMap<u32, u32>,
    ranges: RangeMap<u32, Extent>,
}

impl Relocator
{
    pub fn new() -> Relocator
    {
        Relocator::default()
    }

    /// A modelled item read at `origin` now lives at `offset`.
    pub fn add_item(&mut self, origin: u32, offset: u32)
    {
        if origin != 0 {
            self.items.insert(origin, offset);
        }
    }

    /// A raw extent of `len` bytes read at `origin` now starts at `offset`, unchanged inside.
    pub fn add_range(&mut self, origin: u32, len: u32, offset: u32)
    {
        self.add_extent(origin, len, Extent { origin, offset, shifts: Vec::new() });
    }

    /// A raw section, including the shifts of its re-encoded slots.
    pub fn add_raw(&mut self, raw: &RawSection)
    {
        let len = raw.original.len() as u32;
        self.add_extent(raw.origin, len, Extent { origin: raw.origin, offset: raw.offset, shifts: raw.shifts.clone() });
    }

    fn add_extent(&mut self, origin: u32, len: u32, extent: Extent)
    {
        if origin != 0 && len > 0 {
            self.ranges.insert(origin..origin.saturating_add(len), extent);
        }
    }

    pub fn map(&self, origin: u32) -> Option<u32>
    {
        if origin == 0 {
            return Some(0);
        }
        if let Some(offset) = self.items.get(&origin) {
            return Some(*offset);
        }
        self.ranges.get(&origin).map(|e| e.offset + shifted(&e.shifts, origin - e.origin))
    }

    /// Like [`Relocator::map`], but a vanished target becomes 0.
    pub fn relocate(&self, origin: u32, what: &str) -> u32
    {
        match self.map(origin) {
            Some(offset) => offset,
            None => {
                warn!("{} points at 0x{:x}, which is no longer in the file", what, origin);
                0
            }
        }
    }
}

/// Applies the last shift recorded at or before `position`.
fn shifted(shifts: &[(u32, i64)], position: u32) -> u32
{
    let n = shifts.partition_point(|(at, _)| *at <= position);
    match n {
        0 => position,
        _ => (position as i64 + shifts[n - 1].1) as u32,
    }
}

/// An absolute offset into a raw section, held by a modelled item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawOffset
{
    origin: u32,
    current: u32,
}

impl RawOffset
{
    pub fn new(offset: u32) -> RawOffset
    {
        RawOffset { origin: offset, current: offset }
    }

    pub fn get(&self) -> u32
    {
        self.current
    }

    pub fn origin(&self) -> u32
    {
        self.origin
    }

    pub fn relocate(&mut self, relocator: &Relocator, what: &str)
    {
        self.current = relocator.relocate(self.origin, what);
    }
}

/// How an index is encoded in its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot
{
    Fixed(Width),
    Uleb,
    /// An `encoded_value`: header byte then `value_arg + 1` little-endian bytes.
    Value,
}

impl Slot
{
    /// Writes `index` in this slot's encoding; an unchanged index keeps the bytes as read.
    fn write(&self, out: &mut Vec<u8>, original: &[u8], read: u32, index: u32) -> DexResult<usize>
    {
        if index == read {
            return Ok(write_x(out, original));
        }
        let written = match self {
            Slot::Fixed(Width::U8) => write_u1(out, narrow(index, "raw index")?),
            Slot::Fixed(Width::U16) => write_u2(out, narrow(index, "raw index")?),
            Slot::Fixed(Width::U32) => write_u4(out, index),
            Slot::Uleb => write_uleb128(out, index),
            Slot::Value => {
                let header = match original.first() {
                    Some(h) => *h,
                    None => fail!(Format, "Empty encoded value slot"),
                };
                let needed = ((32 - index.leading_zeros() as usize + 7) / 8).max(1);
                let size = needed.max(original.len() - 1);
                write_u1(out, (((size - 1) as u8) << 5) | (header & 0x1f));
                1 + write_x(out, &index.to_le_bytes()[..size])
            }
        };
        Ok(written)
    }
}

/// The id section an index slot names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target
{
    String(IndexReference<StringItem>),
    Type(IndexReference<TypeItem>),
    Proto(IndexReference<ProtoItem>),
    Field(IndexReference<FieldItem>),
    Method(IndexReference<MethodItem>),
}

impl Target
{
    pub fn index(&self) -> u32
    {
        match self {
            Target::String(r) => r.get(),
            Target::Type(r) => r.get(),
            Target::Proto(r) => r.get(),
            Target::Field(r) => r.get(),
            Target::Method(r) => r.get(),
        }
    }

    fn link(&mut self, ids: &IdSections<'_>)
    {
        match self {
            Target::String(r) => { r.item(ids.strings); }
            Target::Type(r) => { r.item(ids.types); }
            Target::Proto(r) => { r.item(ids.protos); }
            Target::Field(r) => { r.item(ids.fields); }
            Target::Method(r) => { r.item(ids.methods); }
        }
    }

    fn refresh(&mut self, ids: &IdSections<'_>) -> u32
    {
        match self {
            Target::String(r) => r.refresh(ids.strings),
            Target::Type(r) => r.refresh(ids.types),
            Target::Proto(r) => r.refresh(ids.protos),
            Target::Field(r) => r.refresh(ids.fields),
            Target::Method(r) => r.refresh(ids.methods),
        }
        self.index()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixup
{
    Offset { at: usize, origin: u32 },
    /// `len` bytes read at `at` holding index `read`.
    Index { at: usize, len: usize, slot: Slot, read: u32, target: Target },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSection
{
    pub kind: SectionType,
    pub count: u32,
    origin: u32,
    offset: u32,
    original: Vec<u8>,
    bytes: Vec<u8>,
    shifts: Vec<(u32, i64)>,
    fixups: Vec<Fixup>,
}

impl RawSection
{
    /// Wraps the extent of a raw section and locates its fixups.
    pub fn read(kind: SectionType, count: u32, origin: u32, bytes: Vec<u8>) -> DexResult<RawSection>
    {
        let fixups = scan(kind, count, &bytes)
            .map_err(|e| e.with_context(format!("{} at 0x{:x}", kind, origin)))?;
        trace!("{} at 0x{:x}: {} bytes, {} fixups", kind, origin, bytes.len(), fixups.len());
        Ok(RawSection { kind, count, origin, offset: origin, bytes: bytes.clone(), original: bytes, shifts: Vec::new(), fixups })
    }

    pub fn origin(&self) -> u32
    {
        self.origin
    }

    pub fn offset(&self) -> u32
    {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u32)
    {
        self.offset = offset;
    }

    pub fn len(&self) -> usize
    {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    pub fn fixups(&self) -> &[Fixup]
    {
        &self.fixups
    }

    /// Current position of a byte that was read at `at` within the section.
    pub fn position(&self, at: u32) -> u32
    {
        shifted(&self.shifts, at)
    }

    pub fn link(&mut self, ids: &IdSections<'_>)
    {
        for f in self.fixups.iter_mut() {
            if let Fixup::Index { target, .. } = f {
                target.link(ids);
            }
        }
    }

    /// Writes the current index of every target, re-encoding the section from the bytes as read.
    pub fn refresh_indexes(&mut self, ids: &IdSections<'_>) -> DexResult<()>
    {
        let mut out = Vec::with_capacity(self.original.len());
        let mut shifts = Vec::new();
        let mut copied = 0;
        for f in self.fixups.iter_mut() {
            if let Fixup::Index { at, len, slot, read, target } = f {
                let index = target.refresh(ids);
                let end = *at + *len;
                write_x(&mut out, &self.original[copied..*at]);
                let written = slot.write(&mut out, &self.original[*at..end], *read, index)
                    .map_err(|e| e.with_context(format!("{} entry at +0x{:x}", self.kind, at)))?;
                copied = end;
                if written != *len {
                    shifts.push((narrow(end, "raw position")?, out.len() as i64 - end as i64));
                }
            }
        }
        write_x(&mut out, &self.original[copied..]);
        if !shifts.is_empty() {
            trace!("{} at 0x{:x} re-encoded from {} to {} bytes", self.kind, self.origin, self.original.len(), out.len());
        }
        self.bytes = out;
        self.shifts = shifts;
        Ok(())
    }

    pub fn relocate(&mut self, relocator: &Relocator)
    {
        for f in &self.fixups {
            if let Fixup::Offset { at, origin } = f {
                let what = format!("{} entry at +0x{:x}", self.kind, at);
                let pos = shifted(&self.shifts, *at as u32) as usize;
                put_u4(&mut self.bytes, pos, relocator.relocate(*origin, &what));
            }
        }
    }
}

fn offset_slot(reader: &mut BlockReader<'_>, fixups: &mut Vec<Fixup>) -> DexResult<()>
{
    let at = reader.position();
    let origin = reader.read_u4()?;
    if origin != 0 {
        fixups.push(Fixup::Offset { at, origin });
    }
    Ok(())
}

fn fixed_slot(reader: &mut BlockReader<'_>, fixups: &mut Vec<Fixup>, width: Width, make: fn(u32) -> Target) -> DexResult<()>
{
    let at = reader.position();
    let (read, len) = match width {
        Width::U8 => (reader.read_u1()? as u32, 1),
        Width::U16 => (reader.read_u2()? as u32, 2),
        Width::U32 => (reader.read_u4()?, 4),
    };
    fixups.push(Fixup::Index { at, len, slot: Slot::Fixed(width), read, target: make(read) });
    Ok(())
}

fn uleb_slot(reader: &mut BlockReader<'_>, fixups: &mut Vec<Fixup>, make: fn(u32) -> Target) -> DexResult<()>
{
    let at = reader.position();
    let read = reader.read_uleb128()?;
    fixups.push(Fixup::Index { at, len: reader.position() - at, slot: Slot::Uleb, read, target: make(read) });
    Ok(())
}

fn string_target(raw: u32) -> Target { Target::String(IndexReference::new(raw)) }
fn type_target(raw: u32) -> Target { Target::Type(IndexReference::new(raw)) }
fn proto_target(raw: u32) -> Target { Target::Proto(IndexReference::new(raw)) }
fn field_target(raw: u32) -> Target { Target::Field(IndexReference::new(raw)) }
fn method_target(raw: u32) -> Target { Target::Method(IndexReference::new(raw)) }

fn scan_value(reader: &mut BlockReader<'_>, fixups: &mut Vec<Fixup>, depth: usize) -> DexResult<()>
{
    if depth > MAX_VALUE_DEPTH {
        fail!(Format, "Encoded values nested deeper than {}", MAX_VALUE_DEPTH);
    }
    let at = reader.position();
    let header = reader.read_u1()?;
    let value_arg = (header >> 5) as usize;
    let value_type = header & 0x1f;
    let make: fn(u32) -> Target = match value_type {
        VALUE_BYTE | VALUE_SHORT | VALUE_CHAR | VALUE_INT | VALUE_LONG
        | VALUE_FLOAT | VALUE_DOUBLE | VALUE_METHOD_HANDLE => {
            reader.read_x(value_arg + 1)?;
            return Ok(());
        }
        VALUE_ARRAY => return scan_array(reader, fixups, depth + 1),
        VALUE_ANNOTATION => return scan_annotation(reader, fixups, depth + 1),
        VALUE_NULL | VALUE_BOOLEAN => return Ok(()),
        VALUE_METHOD_TYPE => proto_target,
        VALUE_STRING => string_target,
        VALUE_TYPE => type_target,
        VALUE_FIELD | VALUE_ENUM => field_target,
        VALUE_METHOD => method_target,
        other => fail!(Format, "Unknown encoded value type 0x{:02x} at +0x{:x}", other, at),
    };
    if value_arg > 3 {
        fail!(Format, "Index value at +0x{:x} is {} bytes wide", at, value_arg + 1);
    }
    let payload = reader.read_x(value_arg + 1)?;
    let read = payload.iter().rev().fold(0u32, |acc, b| (acc << 8) | *b as u32);
    fixups.push(Fixup::Index { at, len: value_arg + 2, slot: Slot::Value, read, target: make(read) });
    Ok(())
}

fn scan_array(reader: &mut BlockReader<'_>, fixups: &mut Vec<Fixup>, depth: usize) -> DexResult<()>
{
    let size = reader.read_uleb128()?;
    for _ in 0..size {
        scan_value(reader, fixups, depth)?;
    }
    Ok(())
}

fn scan_annotation(reader: &mut BlockReader<'_>, fixups: &mut Vec<Fixup>, depth: usize) -> DexResult<()>
{
    uleb_slot(reader, fixups, type_target)?;
    let size = reader.read_uleb128()?;
    for _ in 0..size {
        uleb_slot(reader, fixups, string_target)?;
        scan_value(reader, fixups, depth)?;
    }
    Ok(())
}

fn scan(kind: SectionType, count: u32, bytes: &[u8]) -> DexResult<Vec<Fixup>>
{
    let mut reader = BlockReader::new(bytes);
    let mut fixups = Vec::new();
    match kind {
        SectionType::AnnotationSetRefList | SectionType::AnnotationSet => {
            for _ in 0..count {
                reader.align(4)?;
                let size = reader.read_u4()?;
                for _ in 0..size {
                    offset_slot(&mut reader, &mut fixups)?;
                }
            }
        }
        SectionType::AnnotationsDirectory => {
            for _ in 0..count {
                reader.align(4)?;
                offset_slot(&mut reader, &mut fixups)?;
                let fields_size = reader.read_u4()?;
                let methods_size = reader.read_u4()?;
                let parameters_size = reader.read_u4()?;
                for _ in 0..fields_size {
                    fixed_slot(&mut reader, &mut fixups, Width::U32, field_target)?;
                    offset_slot(&mut reader, &mut fixups)?;
                }
                for _ in 0..(methods_size as u64 + parameters_size as u64) {
                    fixed_slot(&mut reader, &mut fixups, Width::U32, method_target)?;
                    offset_slot(&mut reader, &mut fixups)?;
                }
            }
        }
        SectionType::Annotation => {
            for _ in 0..count {
                // visibility
                reader.read_u1()?;
                scan_annotation(&mut reader, &mut fixups, 0)?;
            }
        }
        SectionType::EncodedArray => {
            for _ in 0..count {
                scan_array(&mut reader, &mut fixups, 0)?;
            }
        }
        SectionType::CallSiteId => {
            for _ in 0..count {
                offset_slot(&mut reader, &mut fixups)?;
            }
        }
        SectionType::MethodHandle => {
            for _ in 0..count {
                let handle_type = reader.read_u2()?;
                reader.read_u2()?;
                // types 0..=3 are static/instance field accessors
                if handle_type <= 3 {
                    fixed_slot(&mut reader, &mut fixups, Width::U16, field_target)?;
                } else {
                    fixed_slot(&mut reader, &mut fixups, Width::U16, method_target)?;
                }
                reader.read_u2()?;
            }
        }
        _ => {}
    }
    Ok(fixups)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::block::get_u4;
    use crate::dex::ids::DexString;
    use crate::dex::section::Section;

    fn strings(n: usize) -> Section<StringItem>
    {
        let mut strings = Section::new(SectionType::StringId);
        for i in 0..n {
            strings.push(StringItem::new(DexString::from_string(&format!("s{:03}", i))));
        }
        strings
    }

    #[test]
    fn relocator_maps_items_and_ranges()
    {
        let mut r = Relocator::new();
        r.add_item(0x100, 0x180);
        r.add_range(0x400, 0x40, 0x800);
        assert_eq!(r.map(0), Some(0));
        assert_eq!(r.map(0x100), Some(0x180));
        assert_eq!(r.map(0x410), Some(0x810));
        assert_eq!(r.map(0x440), None);
        assert_eq!(r.relocate(0x440, "test"), 0);

        let mut o = RawOffset::new(0x404);
        o.relocate(&r, "class annotations");
        assert_eq!(o.get(), 0x804);
        assert_eq!(o.origin(), 0x404);
    }

    #[test]
    fn annotation_set_offsets_are_relocated()
    {
        // two sets: [0x500, 0x520] and []
        let mut bytes = Vec::new();
        for v in [2u32, 0x500, 0x520, 0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let mut raw = RawSection::read(SectionType::AnnotationSet, 2, 0x300, bytes).unwrap();
        assert_eq!(raw.fixups().len(), 2);

        let mut r = Relocator::new();
        r.add_range(0x500, 0x40, 0x900);
        raw.relocate(&r);
        assert_eq!(get_u4(raw.bytes(), 4), Some(0x900));
        assert_eq!(get_u4(raw.bytes(), 8), Some(0x920));
        assert_eq!(get_u4(raw.bytes(), 12), Some(0));
    }

    #[test]
    fn method_handle_members_follow_renumbering()
    {
        let strings: Section<StringItem> = Section::new(SectionType::StringId);
        let types: Section<TypeItem> = Section::new(SectionType::TypeId);
        let protos: Section<ProtoItem> = Section::new(SectionType::ProtoId);
        let mut fields: Section<FieldItem> = Section::new(SectionType::FieldId);
        let mut methods: Section<MethodItem> = Section::new(SectionType::MethodId);
        let f0 = fields.push(FieldItem { class: IndexReference::new(0), field_type: IndexReference::new(0), name: IndexReference::new(0) });
        let _f1 = fields.push(FieldItem { class: IndexReference::new(0), field_type: IndexReference::new(0), name: IndexReference::new(1) });
        let _m0 = methods.push(MethodItem { class: IndexReference::new(0), proto: IndexReference::new(0), name: IndexReference::new(0) });

        // static-put on field 0, invoke-static on method 0
        let bytes = vec![0, 0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0];
        let mut raw = RawSection::read(SectionType::MethodHandle, 2, 0x200, bytes).unwrap();
        {
            let ids = IdSections { strings: &strings, types: &types, protos: &protos, fields: &fields, methods: &methods };
            raw.link(&ids);
        }
        fields.move_to(f0, 1).unwrap();
        let ids = IdSections { strings: &strings, types: &types, protos: &protos, fields: &fields, methods: &methods };
        raw.refresh_indexes(&ids).unwrap();
        assert_eq!(&raw.bytes()[4..6], &[1, 0]);
        assert_eq!(&raw.bytes()[12..14], &[0, 0]);
    }

    #[test]
    fn directory_tracks_members_and_offsets()
    {
        let mut bytes = Vec::new();
        // class set, 1 field, 1 method, 0 parameters
        for v in [0x600u32, 1, 1, 0, 7, 0x640, 9, 0x660] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let raw = RawSection::read(SectionType::AnnotationsDirectory, 1, 0x700, bytes).unwrap();
        let kinds: Vec<&str> = raw.fixups().iter().map(|f| match f {
            Fixup::Offset { .. } => "offset",
            Fixup::Index { target: Target::Field(_), .. } => "field",
            Fixup::Index { target: Target::Method(_), .. } => "method",
            Fixup::Index { .. } => "other",
        }).collect();
        assert_eq!(kinds, vec!["offset", "field", "offset", "method", "offset"]);
    }

    #[test]
    fn truncated_section_is_a_format_error()
    {
        let err = RawSection::read(SectionType::AnnotationSet, 1, 0x10, vec![3, 0, 0, 0, 1, 0]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Format);
    }

    #[test]
    fn widened_string_value_shifts_later_items()
    {
        let mut strings = strings(300);
        let types: Section<TypeItem> = Section::new(SectionType::TypeId);
        let protos: Section<ProtoItem> = Section::new(SectionType::ProtoId);
        let fields: Section<FieldItem> = Section::new(SectionType::FieldId);
        let methods: Section<MethodItem> = Section::new(SectionType::MethodId);

        // two arrays: { string@5 } and { string@0 }
        let bytes = vec![1, 0x17, 5, 1, 0x17, 0];
        let mut raw = RawSection::read(SectionType::EncodedArray, 2, 0x400, bytes).unwrap();
        assert_eq!(raw.fixups().len(), 2);
        {
            let ids = IdSections { strings: &strings, types: &types, protos: &protos, fields: &fields, methods: &methods };
            raw.link(&ids);
        }
        let s5 = strings.get(5).unwrap();
        strings.move_to(s5, 299).unwrap();
        let ids = IdSections { strings: &strings, types: &types, protos: &protos, fields: &fields, methods: &methods };
        raw.refresh_indexes(&ids).unwrap();
        assert_eq!(raw.bytes(), &[1, 0x37, 0x2b, 0x01, 1, 0x17, 0]);
        assert_eq!(raw.position(3), 4);
        assert_eq!(raw.position(0), 0);

        raw.set_offset(0x900);
        let mut r = Relocator::new();
        r.add_raw(&raw);
        assert_eq!(r.map(0x400), Some(0x900));
        assert_eq!(r.map(0x403), Some(0x904));
    }

    #[test]
    fn unchanged_indexes_keep_their_encoding()
    {
        let strings = strings(2);
        let types: Section<TypeItem> = Section::new(SectionType::TypeId);
        let protos: Section<ProtoItem> = Section::new(SectionType::ProtoId);
        let fields: Section<FieldItem> = Section::new(SectionType::FieldId);
        let methods: Section<MethodItem> = Section::new(SectionType::MethodId);

        // string@1 written with a needless second byte
        let bytes = vec![1, 0x37, 1, 0];
        let mut raw = RawSection::read(SectionType::EncodedArray, 1, 0x400, bytes.clone()).unwrap();
        let ids = IdSections { strings: &strings, types: &types, protos: &protos, fields: &fields, methods: &methods };
        raw.link(&ids);
        raw.refresh_indexes(&ids).unwrap();
        assert_eq!(raw.bytes(), bytes.as_slice());
    }

    #[test]
    fn annotation_type_and_names_are_tracked()
    {
        let strings = strings(1);
        let mut types: Section<TypeItem> = Section::new(SectionType::TypeId);
        for _ in 0..3 {
            types.push(TypeItem { descriptor: IndexReference::new(0) });
        }
        let protos: Section<ProtoItem> = Section::new(SectionType::ProtoId);
        let fields: Section<FieldItem> = Section::new(SectionType::FieldId);
        let methods: Section<MethodItem> = Section::new(SectionType::MethodId);

        // runtime visibility, type 2, one element named string 0 holding null
        let bytes = vec![1, 2, 1, 0, 0x1e];
        let mut raw = RawSection::read(SectionType::Annotation, 1, 0x500, bytes).unwrap();
        let slots: Vec<(Slot, u32)> = raw.fixups().iter().filter_map(|f| match f {
            Fixup::Index { slot, target, .. } => Some((*slot, target.index())),
            _ => None,
        }).collect();
        assert_eq!(slots, vec![(Slot::Uleb, 2), (Slot::Uleb, 0)]);
        {
            let ids = IdSections { strings: &strings, types: &types, protos: &protos, fields: &fields, methods: &methods };
            raw.link(&ids);
        }
        let t2 = types.get(2).unwrap();
        types.move_to(t2, 0).unwrap();
        let ids = IdSections { strings: &strings, types: &types, protos: &protos, fields: &fields, methods: &methods };
        raw.refresh_indexes(&ids).unwrap();
        assert_eq!(raw.bytes(), &[1, 0, 1, 0, 0x1e]);
    }

    #[test]
    fn unknown_value_type_is_a_format_error()
    {
        let err = RawSection::read(SectionType::EncodedArray, 1, 0x10, vec![1, 0x05]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Format);
    }
}
