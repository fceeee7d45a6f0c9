/* Dex container: read, edit, lay out and write */

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use adler::adler32_slice;
use log::{debug, info, trace, warn};
use sha1::{Digest, Sha1};

use crate::block::align::pad;
use crate::block::{narrow, put_u4, write_u4, write_x, Block, BlockReader};
use crate::config::{ReadOptions, WriteOptions};
use crate::dex::class::{AccessFlags, ClassDataItem, ClassDefItem, EncodedField, EncodedMethod};
use crate::dex::code::CodeItem;
use crate::dex::debug::DebugInfo;
use crate::dex::header::{Header, MapItem, MapList, HEADER_SIZE};
use crate::dex::ids::{DexString, FieldItem, IdSections, MethodItem, ProtoItem, StringItem, TypeItem, TypeList};
use crate::dex::key::{shorty_char, validate_member_name, validate_type_descriptor, FieldKey, MethodKey, ProtoKey};
use crate::dex::pool::IdPool;
use crate::dex::raw::{RawSection, Relocator};
use crate::dex::reference::{IndexReference, OffsetReference};
use crate::dex::section::{Id, Section, SectionType};
use crate::error::DexResult;

const MAX_LAYOUT_PASSES: usize = 16;

/// Section order used for files built from scratch.
const DEFAULT_LAYOUT: [SectionType; 13] = [
    SectionType::Header,
    SectionType::StringId,
    SectionType::TypeId,
    SectionType::ProtoId,
    SectionType::FieldId,
    SectionType::MethodId,
    SectionType::ClassDef,
    SectionType::CodeItem,
    SectionType::DebugInfo,
    SectionType::TypeList,
    SectionType::StringData,
    SectionType::ClassData,
    SectionType::MapList,
];

fn is_modelled(kind: SectionType) -> bool
{
    DEFAULT_LAYOUT.contains(&kind)
}

/// One section of the file in layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutEntry
{
    Modelled(SectionType),
    /// Position in the raw section list.
    Raw(usize),
}

fn compute_sha1(data: &[u8]) -> [u8; 20]
{
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Current index of the referenced item, falling back to the raw slot for unresolved references.
fn index_in<T>(r: &IndexReference<T>, section: &Section<T>) -> u32
{
    r.peek().and_then(|id| section.index_of(id)).unwrap_or_else(|| r.get())
}

fn check_u16(value: u32, what: &str) -> DexResult<()>
{
    narrow::<u16, u32>(value, what).map(|_| ())
}

fn fill_to(out: &mut Vec<u8>, offset: u32, fill: u8) -> DexResult<()>
{
    let offset = offset as usize;
    if out.len() > offset {
        fail!(Format, "Layout overlap at 0x{:x}, 0x{:x} bytes already written", offset, out.len());
    }
    out.resize(offset, fill);
    Ok(())
}

fn section_start(pos: u64, kind: SectionType, options: &WriteOptions) -> u64
{
    let alignment = if kind.alignment() > 1 { kind.alignment().max(options.alignment) } else { kind.alignment() };
    pos + pad(alignment, pos)
}

fn lay_out_items<T: Block>(section: &mut Section<T>, start: u64, snapshot: &mut Vec<u32>) -> DexResult<u64>
{
    let alignment = section.kind().alignment();
    let mut pos = start;
    section.set_offset(narrow(start, "section offset")?);
    for id in section.ids().to_vec() {
        pos += pad(alignment, pos);
        let offset: u32 = narrow(pos, "item offset")?;
        section.set_item_offset(id, offset);
        snapshot.push(offset);
        if let Some(item) = section.item(id) {
            pos += item.count_bytes() as u64;
        }
    }
    Ok(pos)
}

fn write_items<T: Block>(out: &mut Vec<u8>, section: &Section<T>, fill: u8) -> DexResult<()>
{
    for (id, item) in section.iter() {
        if let Some(offset) = section.offset_of(id) {
            fill_to(out, offset, fill)?;
        }
        item.write_bytes(out);
    }
    Ok(())
}

fn read_items<T, F>(data: &[u8], item: &MapItem, mut push: F) -> DexResult<()>
where
    T: Block,
    F: FnMut(T, u32),
{
    let mut reader = BlockReader::new(data);
    reader.seek(item.offset as usize)?;
    let alignment = item.kind.alignment();
    for _ in 0..item.size {
        reader.align(alignment)?;
        let at = reader.position() as u32;
        let value = T::read_bytes(&mut reader).map_err(|e| e.with_context(format!("item at 0x{:x}", at)))?;
        push(value, at);
    }
    Ok(())
}

/// An editable dex file.
///
/// Id sections are [`IdPool`]s keyed by their logical value, offset-addressed
/// data lives in [`Section`]s, and every cross reference is an
/// [`IndexReference`] or [`OffsetReference`] that is reconciled by
/// [`DexFile::refresh`].
#[derive(Debug)]
pub struct DexFile
{
    header: Header,
    map: MapList,
    strings: IdPool<DexString, StringItem>,
    types: IdPool<String, TypeItem>,
    protos: IdPool<ProtoKey, ProtoItem>,
    fields: IdPool<FieldKey, FieldItem>,
    methods: IdPool<MethodKey, MethodItem>,
    class_defs: Section<ClassDefItem>,
    type_lists: Section<TypeList>,
    class_data: Section<ClassDataItem>,
    code_items: Section<CodeItem>,
    debug_infos: Section<DebugInfo>,
    raw: Vec<RawSection>,
    layout: Vec<LayoutEntry>,
    read_class_count: usize,
}

impl Default for DexFile
{
    fn default() -> Self
    {
        DexFile::new()
    }
}

impl DexFile
{
    fn empty(header: Header) -> DexFile
    {
        DexFile {
            header,
            map: MapList::default(),
            strings: IdPool::new(SectionType::StringId),
            types: IdPool::new(SectionType::TypeId),
            protos: IdPool::new(SectionType::ProtoId),
            fields: IdPool::new(SectionType::FieldId),
            methods: IdPool::new(SectionType::MethodId),
            class_defs: Section::new(SectionType::ClassDef),
            type_lists: Section::new(SectionType::TypeList),
            class_data: Section::new(SectionType::ClassData),
            code_items: Section::new(SectionType::CodeItem),
            debug_infos: Section::new(SectionType::DebugInfo),
            raw: Vec::new(),
            layout: Vec::new(),
            read_class_count: 0,
        }
    }

    /// An empty version 039 file.
    pub fn new() -> DexFile
    {
        let mut dex = DexFile::empty(Header::default());
        dex.layout = DEFAULT_LAYOUT.iter().map(|k| LayoutEntry::Modelled(*k)).collect();
        dex
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> DexResult<DexFile>
    {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| err!(Io, "{}", e).with_context(path.display().to_string()))?;
        info!("reading {} ({} bytes)", path.display(), data.len());
        DexFile::from_bytes(&data)
    }

    pub fn from_reader<R: Read>(mut reader: R) -> DexResult<DexFile>
    {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        DexFile::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> DexResult<DexFile>
    {
        DexFile::from_bytes_with(data, &ReadOptions::default())
    }

    pub fn from_bytes_with(data: &[u8], options: &ReadOptions) -> DexResult<DexFile>
    {
        let mut reader = BlockReader::new(data);
        let header = Header::read_bytes(&mut reader).map_err(|e| e.with_context("dex header"))?;
        if header.file_size as usize != data.len() {
            if options.strict_sizes {
                fail!(Format, "Header declares {} bytes but {} were supplied", header.file_size, data.len());
            }
            warn!("header declares {} bytes but {} were supplied", header.file_size, data.len());
        }
        if header.map_off == 0 {
            fail!(Format, "Dex file has no map list");
        }
        if header.link_size != 0 {
            warn!("dropping {} bytes of link data", header.link_size);
        }
        reader.seek(header.map_off as usize)?;
        let map = MapList::read_bytes(&mut reader).map_err(|e| e.with_context("map list"))?;
        if options.strict_sizes {
            DexFile::check_header_counts(&header, &map)?;
        }

        let mut dex = DexFile::empty(header);
        let ordered = map.by_offset();
        for (i, item) in ordered.iter().enumerate() {
            if is_modelled(item.kind) {
                dex.layout.push(LayoutEntry::Modelled(item.kind));
                continue;
            }
            if let SectionType::Unknown(code) = item.kind {
                if !options.preserve_unknown {
                    fail!(UnsupportedFormat, "Unknown map entry type 0x{:04x}", code);
                }
                warn!("preserving unknown map entry type 0x{:04x} at 0x{:x}", code, item.offset);
            }
            let end = ordered[i + 1..].iter()
                .map(|m| m.offset as usize)
                .find(|o| *o > item.offset as usize)
                .unwrap_or(data.len())
                .min(data.len());
            if item.offset as usize > end {
                fail!(Format, "{} at 0x{:x} lies outside the file", item.kind, item.offset);
            }
            let bytes = data[item.offset as usize..end].to_vec();
            dex.raw.push(RawSection::read(item.kind, item.size, item.offset, bytes)?);
            dex.layout.push(LayoutEntry::Raw(dex.raw.len() - 1));
        }
        dex.ensure_layout();

        let mut modelled: Vec<&MapItem> = map.items.iter().filter(|m| is_modelled(m.kind)).collect();
        modelled.sort_by_key(|m| m.kind.read_rank());
        for item in modelled {
            debug!("reading {} x{} at 0x{:x}", item.kind, item.size, item.offset);
            dex.read_section(data, item)
                .map_err(|e| e.with_context(format!("{} at 0x{:x}", item.kind, item.offset)))?;
        }

        dex.map = map;
        dex.read_class_count = dex.class_defs.len();
        dex.link()?;
        dex.rebuild_keys()?;
        info!("read dex with {} strings, {} types, {} methods and {} classes",
              dex.strings.len(), dex.types.len(), dex.methods.len(), dex.class_defs.len());
        Ok(dex)
    }

    fn check_header_counts(header: &Header, map: &MapList) -> DexResult<()>
    {
        let pairs = [
            (SectionType::StringId, header.string_ids_size),
            (SectionType::TypeId, header.type_ids_size),
            (SectionType::ProtoId, header.proto_ids_size),
            (SectionType::FieldId, header.field_ids_size),
            (SectionType::MethodId, header.method_ids_size),
            (SectionType::ClassDef, header.class_defs_size),
        ];
        for (kind, declared) in pairs {
            let mapped = map.find(kind).map_or(0, |m| m.size);
            if mapped != declared {
                fail!(Format, "Header counts {} {} items but the map lists {}", declared, kind, mapped);
            }
        }
        Ok(())
    }

    fn read_section(&mut self, data: &[u8], item: &MapItem) -> DexResult<()>
    {
        match item.kind {
            SectionType::StringId => {
                let mut reader = BlockReader::new(data);
                reader.seek(item.offset as usize)?;
                for _ in 0..item.size {
                    let at = reader.position() as u32;
                    let data_off = reader.read_u4()?;
                    let mut string_reader = BlockReader::new(data);
                    string_reader.seek(data_off as usize)?;
                    let value = DexString::read_bytes(&mut string_reader)
                        .map_err(|e| e.with_context(format!("string data at 0x{:x}", data_off)))?;
                    self.strings.push_read(StringItem { value, data_off }, at);
                }
                self.strings.section_mut().set_offset(item.offset);
            }
            SectionType::TypeId => {
                read_items::<TypeItem, _>(data, item, |t, at| { self.types.push_read(t, at); })?;
                self.types.section_mut().set_offset(item.offset);
            }
            SectionType::ProtoId => {
                read_items::<ProtoItem, _>(data, item, |p, at| { self.protos.push_read(p, at); })?;
                self.protos.section_mut().set_offset(item.offset);
            }
            SectionType::FieldId => {
                read_items::<FieldItem, _>(data, item, |f, at| { self.fields.push_read(f, at); })?;
                self.fields.section_mut().set_offset(item.offset);
            }
            SectionType::MethodId => {
                read_items::<MethodItem, _>(data, item, |m, at| { self.methods.push_read(m, at); })?;
                self.methods.section_mut().set_offset(item.offset);
            }
            SectionType::ClassDef => {
                read_items::<ClassDefItem, _>(data, item, |c, at| { self.class_defs.push_read(c, at); })?;
                self.class_defs.set_offset(item.offset);
            }
            SectionType::TypeList => {
                read_items::<TypeList, _>(data, item, |l, at| { self.type_lists.push_read(l, at); })?;
                self.type_lists.set_offset(item.offset);
            }
            SectionType::ClassData => {
                read_items::<ClassDataItem, _>(data, item, |c, at| { self.class_data.push_read(c, at); })?;
                self.class_data.set_offset(item.offset);
            }
            SectionType::CodeItem => {
                read_items::<CodeItem, _>(data, item, |c, at| { self.code_items.push_read(c, at); })?;
                self.code_items.set_offset(item.offset);
            }
            SectionType::DebugInfo => {
                read_items::<DebugInfo, _>(data, item, |d, at| { self.debug_infos.push_read(d, at); })?;
                self.debug_infos.set_offset(item.offset);
            }
            // string data is reached through the string ids
            _ => {}
        }
        Ok(())
    }

    /// Adds the modelled sections a read file did not list, keeping id sections ahead of data.
    fn ensure_layout(&mut self)
    {
        if !self.layout.contains(&LayoutEntry::Modelled(SectionType::Header)) {
            self.layout.insert(0, LayoutEntry::Modelled(SectionType::Header));
        }
        for kind in DEFAULT_LAYOUT {
            let entry = LayoutEntry::Modelled(kind);
            if self.layout.contains(&entry) {
                continue;
            }
            let pos = if kind.is_id_section() {
                self.layout.iter().position(|e| {
                    let k = self.entry_kind(e);
                    k != SectionType::Header && (!k.is_id_section() || k.code() > kind.code())
                })
            } else {
                self.layout.iter().position(|e| *e == LayoutEntry::Modelled(SectionType::MapList))
            };
            match pos {
                Some(p) => self.layout.insert(p, entry),
                None => self.layout.push(entry),
            }
        }
    }

    fn entry_kind(&self, entry: &LayoutEntry) -> SectionType
    {
        match entry {
            LayoutEntry::Modelled(kind) => *kind,
            LayoutEntry::Raw(i) => self.raw.get(*i).map_or(SectionType::Unknown(0xffff), |r| r.kind),
        }
    }

    fn entry_count(&self, entry: &LayoutEntry) -> usize
    {
        match entry {
            LayoutEntry::Raw(i) => self.raw.get(*i).map_or(0, |r| if r.is_empty() { 0 } else { 1 }),
            LayoutEntry::Modelled(kind) => match kind {
                SectionType::Header | SectionType::MapList => 1,
                SectionType::StringId | SectionType::StringData => self.strings.len(),
                SectionType::TypeId => self.types.len(),
                SectionType::ProtoId => self.protos.len(),
                SectionType::FieldId => self.fields.len(),
                SectionType::MethodId => self.methods.len(),
                SectionType::ClassDef => self.class_defs.len(),
                SectionType::TypeList => self.type_lists.len(),
                SectionType::ClassData => self.class_data.len(),
                SectionType::CodeItem => self.code_items.len(),
                SectionType::DebugInfo => self.debug_infos.len(),
                _ => 0,
            },
        }
    }

    fn link(&mut self) -> DexResult<()>
    {
        let strings = self.strings.section();
        for t in self.types.section_mut().items_mut() {
            t.descriptor.item(strings);
        }
        let types = self.types.section();
        for l in self.type_lists.items_mut() {
            for t in l.types.iter_mut() {
                t.item(types);
            }
        }
        let type_lists = &self.type_lists;
        for p in self.protos.section_mut().items_mut() {
            p.shorty.item(strings);
            p.return_type.item(types);
            p.parameters.item(type_lists);
        }
        for f in self.fields.section_mut().items_mut() {
            f.class.item(types);
            f.field_type.item(types);
            f.name.item(strings);
        }
        let protos = self.protos.section();
        for m in self.methods.section_mut().items_mut() {
            m.class.item(types);
            m.proto.item(protos);
            m.name.item(strings);
        }

        let ids = IdSections {
            strings,
            types,
            protos,
            fields: self.fields.section(),
            methods: self.methods.section(),
        };
        for d in self.debug_infos.items_mut() {
            d.link(strings, types);
        }
        let debug_infos = &self.debug_infos;
        for id in self.code_items.ids().to_vec() {
            let at = self.code_items.offset_of(id).unwrap_or(0);
            if let Some(code) = self.code_items.item_mut(id) {
                code.link(&ids).map_err(|e| e.with_context(format!("code item at 0x{:x}", at)))?;
                code.link_debug_info(debug_infos);
            }
        }
        let code_items = &self.code_items;
        for c in self.class_data.items_mut() {
            c.link(&ids, code_items);
        }
        let class_data = &self.class_data;
        for c in self.class_defs.items_mut() {
            c.link(&ids, type_lists, class_data);
        }
        for r in self.raw.iter_mut() {
            r.link(&ids);
        }
        Ok(())
    }

    fn string_of(&self, r: &IndexReference<StringItem>) -> Option<String>
    {
        r.peek().and_then(|id| self.strings.section().item(id)).map(|s| s.value.to_lossy())
    }

    fn descriptor_of(&self, r: &IndexReference<TypeItem>) -> Option<String>
    {
        r.peek().and_then(|id| self.types.section().item(id)).and_then(|t| self.string_of(&t.descriptor))
    }

    fn proto_key_of(&self, p: &ProtoItem) -> Option<ProtoKey>
    {
        let return_type = self.descriptor_of(&p.return_type)?;
        let parameters = match p.parameters.peek() {
            Some(id) => self.type_lists.item(id)?
                .types.iter()
                .map(|t| self.descriptor_of(t))
                .collect::<Option<Vec<_>>>()?,
            None => Vec::new(),
        };
        Some(ProtoKey { return_type, parameters })
    }

    fn field_key_of(&self, f: &FieldItem) -> Option<FieldKey>
    {
        Some(FieldKey {
            class: self.descriptor_of(&f.class)?,
            name: self.string_of(&f.name)?,
            field_type: self.descriptor_of(&f.field_type)?,
        })
    }

    fn method_key_of(&self, m: &MethodItem) -> Option<MethodKey>
    {
        let proto = m.proto.peek().and_then(|id| self.protos.section().item(id))?;
        Some(MethodKey {
            class: self.descriptor_of(&m.class)?,
            name: self.string_of(&m.name)?,
            proto: self.proto_key_of(proto)?,
        })
    }

    /// Recomputes every stale key map from the current item values.
    fn rebuild_keys(&mut self) -> DexResult<()>
    {
        if self.strings.is_stale() {
            let entries: Vec<_> = self.strings.section().iter().map(|(id, s)| (s.value.clone(), id)).collect();
            self.strings.rebuild(entries)?;
        }
        if self.types.is_stale() {
            let entries: Vec<_> = self.types.section().iter()
                .filter_map(|(id, t)| self.string_of(&t.descriptor).map(|k| (k, id)))
                .collect();
            self.types.rebuild(entries)?;
        }
        if self.protos.is_stale() {
            let entries: Vec<_> = self.protos.section().iter()
                .filter_map(|(id, p)| self.proto_key_of(p).map(|k| (k, id)))
                .collect();
            self.protos.rebuild(entries)?;
        }
        if self.fields.is_stale() {
            let entries: Vec<_> = self.fields.section().iter()
                .filter_map(|(id, f)| self.field_key_of(f).map(|k| (k, id)))
                .collect();
            self.fields.rebuild(entries)?;
        }
        if self.methods.is_stale() {
            let entries: Vec<_> = self.methods.section().iter()
                .filter_map(|(id, m)| self.method_key_of(m).map(|k| (k, id)))
                .collect();
            self.methods.rebuild(entries)?;
        }
        Ok(())
    }

    pub fn header(&self) -> &Header
    {
        &self.header
    }

    /// Map list as of the last read or refresh.
    pub fn map(&self) -> &MapList
    {
        &self.map
    }

    pub fn layout(&self) -> &[LayoutEntry]
    {
        &self.layout
    }

    pub fn strings(&self) -> &Section<StringItem>
    {
        self.strings.section()
    }

    pub fn string(&self, id: Id<StringItem>) -> Option<&DexString>
    {
        self.strings.section().item(id).map(|s| &s.value)
    }

    pub fn types(&self) -> &Section<TypeItem>
    {
        self.types.section()
    }

    pub fn type_descriptor(&self, id: Id<TypeItem>) -> Option<String>
    {
        self.types.section().item(id).and_then(|t| self.string_of(&t.descriptor))
    }

    pub fn protos(&self) -> &Section<ProtoItem>
    {
        self.protos.section()
    }

    pub fn proto_key(&self, id: Id<ProtoItem>) -> Option<ProtoKey>
    {
        self.protos.section().item(id).and_then(|p| self.proto_key_of(p))
    }

    pub fn fields(&self) -> &Section<FieldItem>
    {
        self.fields.section()
    }

    pub fn field_key(&self, id: Id<FieldItem>) -> Option<FieldKey>
    {
        self.fields.section().item(id).and_then(|f| self.field_key_of(f))
    }

    pub fn methods(&self) -> &Section<MethodItem>
    {
        self.methods.section()
    }

    pub fn method_key(&self, id: Id<MethodItem>) -> Option<MethodKey>
    {
        self.methods.section().item(id).and_then(|m| self.method_key_of(m))
    }

    pub fn type_lists(&self) -> &Section<TypeList>
    {
        &self.type_lists
    }

    pub fn class_defs(&self) -> &Section<ClassDefItem>
    {
        &self.class_defs
    }

    pub fn class_def(&self, id: Id<ClassDefItem>) -> Option<&ClassDefItem>
    {
        self.class_defs.item(id)
    }

    pub fn class_def_mut(&mut self, id: Id<ClassDefItem>) -> Option<&mut ClassDefItem>
    {
        self.class_defs.item_mut(id)
    }

    pub fn class_data(&self) -> &Section<ClassDataItem>
    {
        &self.class_data
    }

    /// Class data of a class definition, if it has any members.
    pub fn class_data_of(&self, id: Id<ClassDefItem>) -> Option<&ClassDataItem>
    {
        self.class_defs.item(id)?.class_data.peek().and_then(|d| self.class_data.item(d))
    }

    pub fn code_items(&self) -> &Section<CodeItem>
    {
        &self.code_items
    }

    pub fn code_item(&self, id: Id<CodeItem>) -> Option<&CodeItem>
    {
        self.code_items.item(id)
    }

    pub fn code_item_mut(&mut self, id: Id<CodeItem>) -> Option<&mut CodeItem>
    {
        self.code_items.item_mut(id)
    }

    pub fn debug_infos(&self) -> &Section<DebugInfo>
    {
        &self.debug_infos
    }

    pub fn debug_info(&self, id: Id<DebugInfo>) -> Option<&DebugInfo>
    {
        self.debug_infos.item(id)
    }

    pub fn debug_info_mut(&mut self, id: Id<DebugInfo>) -> Option<&mut DebugInfo>
    {
        self.debug_infos.item_mut(id)
    }

    /// Raw sections still part of the layout.
    pub fn raw_sections(&self) -> impl Iterator<Item = &RawSection> + '_
    {
        self.layout.iter().filter_map(move |e| match e {
            LayoutEntry::Raw(i) => self.raw.get(*i),
            LayoutEntry::Modelled(_) => None,
        })
    }

    /// Id sections viewed together, for linking hand-built items.
    pub fn id_sections(&self) -> IdSections<'_>
    {
        IdSections {
            strings: self.strings.section(),
            types: self.types.section(),
            protos: self.protos.section(),
            fields: self.fields.section(),
            methods: self.methods.section(),
        }
    }

    pub fn get_or_create_string(&mut self, value: &str) -> DexResult<Id<StringItem>>
    {
        self.rebuild_keys()?;
        let key = DexString::from_string(value);
        let (id, created) = self.strings.get_or_create_with(key.clone(), || StringItem::new(key))?;
        if created {
            trace!("new string {:?}", value);
        }
        Ok(id)
    }

    pub fn get_or_create_type(&mut self, descriptor: &str) -> DexResult<Id<TypeItem>>
    {
        validate_type_descriptor(descriptor)?;
        self.rebuild_keys()?;
        if let Some(id) = self.types.get(&descriptor.to_string()) {
            return Ok(id);
        }
        let string = self.get_or_create_string(descriptor)?;
        let (id, _) = self.types.get_or_create_with(descriptor.to_string(), || TypeItem {
            descriptor: IndexReference::to(string),
        })?;
        trace!("new type {}", descriptor);
        Ok(id)
    }

    /// Returns a type list holding exactly `descriptors`, sharing an existing one when possible.
    pub fn get_or_create_type_list(&mut self, descriptors: &[String]) -> DexResult<Id<TypeList>>
    {
        for d in descriptors {
            validate_type_descriptor(d)?;
        }
        let mut types = Vec::with_capacity(descriptors.len());
        for d in descriptors {
            types.push(self.get_or_create_type(d)?);
        }
        let existing = self.type_lists.iter().find(|(_, l)| {
            l.types.len() == types.len() && l.types.iter().zip(&types).all(|(r, t)| r.peek() == Some(*t))
        });
        if let Some((id, _)) = existing {
            return Ok(id);
        }
        Ok(self.type_lists.push(TypeList { types: types.into_iter().map(IndexReference::to).collect() }))
    }

    pub fn get_or_create_proto(&mut self, key: &ProtoKey) -> DexResult<Id<ProtoItem>>
    {
        let params: Vec<&str> = key.parameters.iter().map(|p| p.as_str()).collect();
        ProtoKey::new(&key.return_type, &params)?;
        self.rebuild_keys()?;
        if let Some(id) = self.protos.get(key) {
            return Ok(id);
        }
        let shorty = self.get_or_create_string(&key.shorty())?;
        let return_type = self.get_or_create_type(&key.return_type)?;
        let parameters = if key.parameters.is_empty() {
            OffsetReference::absent()
        } else {
            OffsetReference::to(self.get_or_create_type_list(&key.parameters)?)
        };
        let (id, _) = self.protos.get_or_create_with(key.clone(), || ProtoItem {
            shorty: IndexReference::to(shorty),
            return_type: IndexReference::to(return_type),
            parameters,
        })?;
        Ok(id)
    }

    pub fn get_or_create_field(&mut self, key: &FieldKey) -> DexResult<Id<FieldItem>>
    {
        FieldKey::new(&key.class, &key.name, &key.field_type)?;
        self.rebuild_keys()?;
        if let Some(id) = self.fields.get(key) {
            return Ok(id);
        }
        let class = self.get_or_create_type(&key.class)?;
        let field_type = self.get_or_create_type(&key.field_type)?;
        let name = self.get_or_create_string(&key.name)?;
        let (id, _) = self.fields.get_or_create_with(key.clone(), || FieldItem {
            class: IndexReference::to(class),
            field_type: IndexReference::to(field_type),
            name: IndexReference::to(name),
        })?;
        Ok(id)
    }

    pub fn get_or_create_method(&mut self, key: &MethodKey) -> DexResult<Id<MethodItem>>
    {
        MethodKey::new(&key.class, &key.name, key.proto.clone())?;
        let params: Vec<&str> = key.proto.parameters.iter().map(|p| p.as_str()).collect();
        ProtoKey::new(&key.proto.return_type, &params)?;
        self.rebuild_keys()?;
        if let Some(id) = self.methods.get(key) {
            return Ok(id);
        }
        let class = self.get_or_create_type(&key.class)?;
        let proto = self.get_or_create_proto(&key.proto)?;
        let name = self.get_or_create_string(&key.name)?;
        let (id, _) = self.methods.get_or_create_with(key.clone(), || MethodItem {
            class: IndexReference::to(class),
            proto: IndexReference::to(proto),
            name: IndexReference::to(name),
        })?;
        Ok(id)
    }

    /// Changes a string's value in place; every item built on it follows.
    ///
    /// Fails with InvalidKey, leaving the file unchanged, if the value already exists.
    pub fn rename_string(&mut self, id: Id<StringItem>, value: &str) -> DexResult<()>
    {
        self.rebuild_keys()?;
        let old = match self.strings.section().item(id) {
            Some(s) => s.value.clone(),
            None => fail!(IndexOutOfRange, "String {:?} is not in this file", id),
        };
        let new = DexString::from_string(value);
        if old == new {
            return Ok(());
        }
        self.check_string_role(id, &old, value)?;
        self.strings.rekey(id, &old, new.clone())?;
        if let Some(item) = self.strings.section_mut().item_mut(id) {
            item.value = new;
        }
        debug!("renamed string {:?} to {:?}", old.to_lossy(), value);
        self.types.invalidate();
        self.protos.invalidate();
        self.fields.invalidate();
        self.methods.invalidate();
        Ok(())
    }

    /// Checks `value` against the grammar of every key built on string `id`.
    fn check_string_role(&self, id: Id<StringItem>, old: &DexString, value: &str) -> DexResult<()>
    {
        let names = |r: &IndexReference<StringItem>| r.peek() == Some(id);
        if self.types.section().iter().any(|(_, t)| names(&t.descriptor)) {
            validate_type_descriptor(value)?;
            let old = old.to_lossy();
            if shorty_char(&old) != shorty_char(value) {
                fail!(InvalidKey, "Renaming type descriptor {} to {} would change method shorties", old, value);
            }
        }
        let is_member_name = self.fields.section().iter().any(|(_, f)| names(&f.name))
            || self.methods.section().iter().any(|(_, m)| names(&m.name));
        if is_member_name {
            validate_member_name(value)?;
        }
        Ok(())
    }

    /// Points a type at a new descriptor string. The old descriptor string is left in place.
    pub fn rename_type(&mut self, id: Id<TypeItem>, descriptor: &str) -> DexResult<()>
    {
        validate_type_descriptor(descriptor)?;
        self.rebuild_keys()?;
        let old = match self.type_descriptor(id) {
            Some(d) => d,
            None => fail!(IndexOutOfRange, "Type {:?} is not in this file", id),
        };
        if old == descriptor {
            return Ok(());
        }
        if shorty_char(&old) != shorty_char(descriptor) {
            fail!(InvalidKey, "Renaming {} to {} would change method shorties", old, descriptor);
        }
        if self.types.get(&descriptor.to_string()).is_some() {
            fail!(InvalidKey, "Type {} already exists", descriptor);
        }
        let string = self.get_or_create_string(descriptor)?;
        self.types.rekey(id, &old, descriptor.to_string())?;
        if let Some(item) = self.types.section_mut().item_mut(id) {
            item.descriptor.set_item(Some(string));
        }
        debug!("renamed type {} to {}", old, descriptor);
        self.protos.invalidate();
        self.fields.invalidate();
        self.methods.invalidate();
        Ok(())
    }

    /// Restores the id section order the format requires after renames and additions.
    pub fn sort_ids(&mut self)
    {
        self.strings.section_mut().sort_by(|a, b| a.value.cmp_utf16(&b.value));

        let strings = self.strings.section();
        self.types.section_mut().sort_by(|a, b| {
            index_in(&a.descriptor, strings).cmp(&index_in(&b.descriptor, strings))
        });

        let types = self.types.section();
        let type_lists = &self.type_lists;
        let proto_order = |p: &ProtoItem| {
            let params: Vec<u32> = p.parameters.peek()
                .and_then(|id| type_lists.item(id))
                .map(|l| l.types.iter().map(|t| index_in(t, types)).collect())
                .unwrap_or_default();
            (index_in(&p.return_type, types), params)
        };
        self.protos.section_mut().sort_by(|a, b| proto_order(a).cmp(&proto_order(b)));

        self.fields.section_mut().sort_by(|a, b| {
            let ka = (index_in(&a.class, types), index_in(&a.name, strings), index_in(&a.field_type, types));
            let kb = (index_in(&b.class, types), index_in(&b.name, strings), index_in(&b.field_type, types));
            ka.cmp(&kb)
        });

        let protos = self.protos.section();
        self.methods.section_mut().sort_by(|a, b| {
            let ka = (index_in(&a.class, types), index_in(&a.name, strings), index_in(&a.proto, protos));
            let kb = (index_in(&b.class, types), index_in(&b.name, strings), index_in(&b.proto, protos));
            ka.cmp(&kb)
        });
        debug!("sorted id sections");
    }

    pub fn find_class(&self, descriptor: &str) -> Option<Id<ClassDefItem>>
    {
        self.class_defs.iter()
            .find(|(_, c)| self.descriptor_of(&c.class).as_deref() == Some(descriptor))
            .map(|(id, _)| id)
    }

    /// Adds an empty class definition.
    pub fn define_class(&mut self, descriptor: &str, access_flags: AccessFlags, superclass: Option<&str>) -> DexResult<Id<ClassDefItem>>
    {
        validate_type_descriptor(descriptor)?;
        if !descriptor.starts_with('L') {
            fail!(InvalidKey, "{} is not a class descriptor", descriptor);
        }
        if let Some(s) = superclass {
            validate_type_descriptor(s)?;
        }
        if self.find_class(descriptor).is_some() {
            fail!(InvalidKey, "Class {} is already defined", descriptor);
        }
        let class = self.get_or_create_type(descriptor)?;
        let mut def = ClassDefItem::new(IndexReference::to(class), access_flags);
        if let Some(s) = superclass {
            def.superclass = IndexReference::to(self.get_or_create_type(s)?);
        }
        Ok(self.class_defs.push(def))
    }

    fn class_data_for(&mut self, class: Id<ClassDefItem>) -> DexResult<Id<ClassDataItem>>
    {
        let existing = match self.class_defs.item(class) {
            Some(def) => def.class_data.peek(),
            None => fail!(IndexOutOfRange, "Class {:?} is not in this file", class),
        };
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = self.class_data.push(ClassDataItem::default());
        if let Some(def) = self.class_defs.item_mut(class) {
            def.class_data.set_item(Some(id));
        }
        Ok(id)
    }

    pub fn add_field(&mut self, class: Id<ClassDefItem>, key: &FieldKey, access_flags: AccessFlags) -> DexResult<Id<FieldItem>>
    {
        if !self.class_defs.contains(class) {
            fail!(IndexOutOfRange, "Class {:?} is not in this file", class);
        }
        let field = self.get_or_create_field(key)?;
        let data_id = self.class_data_for(class)?;
        if let Some(data) = self.class_data.item_mut(data_id) {
            if data.static_fields.iter().chain(data.instance_fields.iter()).any(|f| f.field.peek() == Some(field)) {
                fail!(InvalidKey, "Field {} is already a member", key);
            }
            let encoded = EncodedField { field: IndexReference::to(field), access_flags: access_flags.bits() };
            if access_flags.contains(AccessFlags::STATIC) {
                data.static_fields.push(encoded);
            } else {
                data.instance_fields.push(encoded);
            }
        }
        Ok(field)
    }

    pub fn add_method(&mut self, class: Id<ClassDefItem>, key: &MethodKey, access_flags: AccessFlags, code: Option<CodeItem>) -> DexResult<Id<MethodItem>>
    {
        if !self.class_defs.contains(class) {
            fail!(IndexOutOfRange, "Class {:?} is not in this file", class);
        }
        let method = self.get_or_create_method(key)?;
        if let Some(data) = self.class_data_of(class) {
            if data.methods().any(|m| m.method.peek() == Some(method)) {
                fail!(InvalidKey, "Method {} is already a member", key);
            }
        }
        let code = match code {
            Some(c) => OffsetReference::to(self.add_code_item(c)?),
            None => OffsetReference::absent(),
        };
        let data_id = self.class_data_for(class)?;
        if let Some(data) = self.class_data.item_mut(data_id) {
            let encoded = EncodedMethod { method: IndexReference::to(method), access_flags: access_flags.bits(), code };
            let direct = AccessFlags::STATIC | AccessFlags::PRIVATE | AccessFlags::CONSTRUCTOR;
            if access_flags.intersects(direct) {
                data.direct_methods.push(encoded);
            } else {
                data.virtual_methods.push(encoded);
            }
        }
        Ok(method)
    }

    /// Adds a code item whose instruction operands hold current indexes.
    pub fn add_code_item(&mut self, mut code: CodeItem) -> DexResult<Id<CodeItem>>
    {
        let ids = IdSections {
            strings: self.strings.section(),
            types: self.types.section(),
            protos: self.protos.section(),
            fields: self.fields.section(),
            methods: self.methods.section(),
        };
        code.link(&ids)?;
        code.link_debug_info(&self.debug_infos);
        Ok(self.code_items.push(code))
    }

    /// Adds a debug info item whose references hold current indexes.
    pub fn add_debug_info(&mut self, mut info: DebugInfo) -> Id<DebugInfo>
    {
        info.link(self.strings.section(), self.types.section());
        self.debug_infos.push(info)
    }

    fn code_in_use(&self, code: Id<CodeItem>) -> bool
    {
        self.class_data.iter().any(|(_, d)| d.methods().any(|m| m.code.peek() == Some(code)))
    }

    fn debug_info_in_use(&self, info: Id<DebugInfo>) -> bool
    {
        self.code_items.iter().any(|(_, c)| c.debug_info.peek() == Some(info))
    }

    /// Removes a class definition together with the class data, code and debug info only it used.
    pub fn remove_class(&mut self, id: Id<ClassDefItem>) -> DexResult<ClassDefItem>
    {
        let name = self.class_defs.item(id).and_then(|c| self.descriptor_of(&c.class));
        let def = match self.class_defs.remove(id) {
            Some(def) => def,
            None => fail!(IndexOutOfRange, "Class {:?} is not in this file", id),
        };
        let data_id = match def.class_data.peek() {
            Some(d) if !self.class_defs.iter().any(|(_, c)| c.class_data.peek() == Some(d)) => d,
            _ => {
                info!("removed class {}", name.unwrap_or_default());
                return Ok(def);
            }
        };
        if let Some(data) = self.class_data.remove(data_id) {
            for m in data.methods() {
                let code_id = match m.code.peek() {
                    Some(c) if !self.code_in_use(c) => c,
                    _ => continue,
                };
                if let Some(code) = self.code_items.remove(code_id) {
                    if let Some(d) = code.debug_info.peek() {
                        if !self.debug_info_in_use(d) {
                            self.debug_infos.remove(d);
                        }
                    }
                }
            }
        }
        info!("removed class {}", name.unwrap_or_default());
        Ok(def)
    }

    /// Shares one debug info item between code items with equal debug sequences.
    ///
    /// Returns the number of debug info items removed.
    pub fn dedupe_debug_info(&mut self) -> usize
    {
        let mut buckets: HashMap<(u32, usize, usize), Vec<Id<DebugInfo>>> = HashMap::new();
        let mut replaced: HashMap<Id<DebugInfo>, Id<DebugInfo>> = HashMap::new();
        for (id, info) in self.debug_infos.iter() {
            let key = (info.sequence.line_start(), info.sequence.visible_len(), info.parameter_names.len());
            let bucket = buckets.entry(key).or_default();
            let same = bucket.iter().copied().find(|c| {
                self.debug_infos.item(*c).map_or(false, |other| other.same_as(info))
            });
            match same {
                Some(c) => { replaced.insert(id, c); }
                None => bucket.push(id),
            }
        }
        for code in self.code_items.items_mut() {
            if let Some(d) = code.debug_info.peek() {
                if let Some(c) = replaced.get(&d) {
                    code.debug_info.set_item(Some(*c));
                }
            }
        }
        for id in replaced.keys() {
            self.debug_infos.remove(*id);
        }
        debug!("shared debug info, {} duplicates removed", replaced.len());
        replaced.len()
    }

    fn drop_stale_hidden_api(&mut self)
    {
        if self.class_defs.len() == self.read_class_count {
            return;
        }
        let raw = &self.raw;
        let before = self.layout.len();
        self.layout.retain(|e| !matches!(e, LayoutEntry::Raw(i) if raw[*i].kind == SectionType::HiddenApi));
        if self.layout.len() != before {
            warn!("dropping hidden api data, class definitions changed from {} to {}", self.read_class_count, self.class_defs.len());
        }
    }

    fn refresh_indexes(&mut self) -> DexResult<()>
    {
        let strings = self.strings.section();
        for t in self.types.section_mut().items_mut() {
            t.descriptor.refresh(strings);
        }
        let types = self.types.section();
        for l in self.type_lists.items_mut() {
            for t in l.types.iter_mut() {
                t.refresh(types);
                check_u16(t.get(), "type list entry")?;
            }
        }
        for p in self.protos.section_mut().items_mut() {
            p.shorty.refresh(strings);
            p.return_type.refresh(types);
        }
        for f in self.fields.section_mut().items_mut() {
            f.class.refresh(types);
            f.field_type.refresh(types);
            f.name.refresh(strings);
            check_u16(f.class.get(), "field class index")?;
            check_u16(f.field_type.get(), "field type index")?;
        }
        let protos = self.protos.section();
        for m in self.methods.section_mut().items_mut() {
            m.class.refresh(types);
            m.proto.refresh(protos);
            m.name.refresh(strings);
            check_u16(m.class.get(), "method class index")?;
            check_u16(m.proto.get(), "method proto index")?;
        }

        let ids = IdSections {
            strings,
            types,
            protos,
            fields: self.fields.section(),
            methods: self.methods.section(),
        };
        for d in self.debug_infos.items_mut() {
            d.refresh(strings, types);
        }
        for c in self.class_data.items_mut() {
            c.refresh_indexes(&ids);
        }
        for c in self.class_defs.items_mut() {
            c.refresh_indexes(&ids);
        }
        for r in self.raw.iter_mut() {
            r.refresh_indexes(&ids)?;
        }
        Ok(())
    }

    fn relocator(&self) -> Relocator
    {
        fn add_section<T>(relocator: &mut Relocator, section: &Section<T>)
        {
            for id in section.ids() {
                if let (Some(origin), Some(offset)) = (section.origin_of(*id), section.offset_of(*id)) {
                    relocator.add_item(origin, offset);
                }
            }
        }
        let mut relocator = Relocator::new();
        add_section(&mut relocator, &self.type_lists);
        add_section(&mut relocator, &self.class_data);
        add_section(&mut relocator, &self.code_items);
        add_section(&mut relocator, &self.debug_infos);
        for raw in self.raw_sections() {
            relocator.add_raw(raw);
        }
        relocator
    }

    fn refresh_offsets(&mut self) -> DexResult<()>
    {
        let type_lists = &self.type_lists;
        for p in self.protos.section_mut().items_mut() {
            p.parameters.refresh(type_lists);
        }
        let ids = IdSections {
            strings: self.strings.section(),
            types: self.types.section(),
            protos: self.protos.section(),
            fields: self.fields.section(),
            methods: self.methods.section(),
        };
        let debug_infos = &self.debug_infos;
        for c in self.code_items.items_mut() {
            c.refresh(&ids, debug_infos)?;
        }
        let code_items = &self.code_items;
        for c in self.class_data.items_mut() {
            c.refresh_offsets(code_items);
        }

        let relocator = self.relocator();
        let class_data = &self.class_data;
        for c in self.class_defs.items_mut() {
            c.refresh_offsets(type_lists, class_data);
            c.annotations.relocate(&relocator, "class annotations");
            c.static_values.relocate(&relocator, "class static values");
        }
        for r in self.raw.iter_mut() {
            r.relocate(&relocator);
        }
        Ok(())
    }

    /// Assigns an offset to every section and item. Returns every assigned offset, in order.
    fn layout_pass(&mut self, options: &WriteOptions) -> DexResult<Vec<u32>>
    {
        let entries = self.layout.clone();
        let map_entries = entries.iter().filter(|e| self.entry_count(e) > 0).count();
        let mut map = MapList::default();
        let mut snapshot = Vec::new();
        let mut data_off: Option<u64> = None;
        let mut pos: u64 = 0;

        for entry in entries {
            let count = self.entry_count(&entry);
            let kind = self.entry_kind(&entry);
            if count == 0 {
                self.header.set_section(kind, 0, 0);
                continue;
            }
            if kind != SectionType::Header {
                pos = section_start(pos, kind, options);
            }
            let start = pos;
            if data_off.is_none() && kind != SectionType::Header && !kind.is_id_section() {
                data_off = Some(start);
            }
            pos = match entry {
                LayoutEntry::Raw(i) => {
                    let raw = &mut self.raw[i];
                    raw.set_offset(narrow(start, "section offset")?);
                    map.items.push(MapItem::new(kind, raw.count, raw.offset()));
                    start + raw.len() as u64
                }
                LayoutEntry::Modelled(kind) => {
                    let end = self.lay_out_section(kind, start, map_entries, &mut snapshot)?;
                    let size = if kind == SectionType::Header || kind == SectionType::MapList { 1 } else { count as u32 };
                    map.items.push(MapItem::new(kind, size, narrow(start, "section offset")?));
                    self.header.set_section(kind, count as u32, narrow(start, "section offset")?);
                    end
                }
            };
            snapshot.push(narrow(pos, "section end")?);
        }

        let file_size: u32 = narrow(pos, "file size")?;
        let data_off = data_off.unwrap_or(pos) as u32;
        self.header.header_size = HEADER_SIZE;
        self.header.file_size = file_size;
        self.header.link_size = 0;
        self.header.link_off = 0;
        self.header.map_off = map.find(SectionType::MapList).map_or(0, |m| m.offset);
        self.header.data_off = data_off;
        self.header.data_size = file_size - data_off;
        self.map = map;
        Ok(snapshot)
    }

    fn lay_out_section(&mut self, kind: SectionType, start: u64, map_entries: usize, snapshot: &mut Vec<u32>) -> DexResult<u64>
    {
        let end = match kind {
            SectionType::Header => start + HEADER_SIZE as u64,
            SectionType::MapList => start + MapList::byte_size(map_entries) as u64,
            SectionType::StringId => {
                let section = self.strings.section_mut();
                section.set_offset(narrow(start, "section offset")?);
                let mut pos = start;
                for id in section.ids().to_vec() {
                    section.set_item_offset(id, narrow(pos, "string id offset")?);
                    pos += 4;
                }
                pos
            }
            SectionType::StringData => {
                let section = self.strings.section_mut();
                let mut pos = start;
                for id in section.ids().to_vec() {
                    if let Some(s) = section.item_mut(id) {
                        s.data_off = narrow(pos, "string data offset")?;
                        snapshot.push(s.data_off);
                        pos += s.value.count_bytes() as u64;
                    }
                }
                pos
            }
            SectionType::TypeId => lay_out_items(self.types.section_mut(), start, snapshot)?,
            SectionType::ProtoId => lay_out_items(self.protos.section_mut(), start, snapshot)?,
            SectionType::FieldId => lay_out_items(self.fields.section_mut(), start, snapshot)?,
            SectionType::MethodId => lay_out_items(self.methods.section_mut(), start, snapshot)?,
            SectionType::ClassDef => lay_out_items(&mut self.class_defs, start, snapshot)?,
            SectionType::TypeList => lay_out_items(&mut self.type_lists, start, snapshot)?,
            SectionType::ClassData => lay_out_items(&mut self.class_data, start, snapshot)?,
            SectionType::CodeItem => lay_out_items(&mut self.code_items, start, snapshot)?,
            SectionType::DebugInfo => lay_out_items(&mut self.debug_infos, start, snapshot)?,
            other => fail!(Format, "{} has no layout rule", other),
        };
        Ok(end)
    }

    /// Reconciles every reference, count and offset.
    pub fn refresh(&mut self) -> DexResult<()>
    {
        self.refresh_with(&WriteOptions::default())
    }

    pub fn refresh_with(&mut self, options: &WriteOptions) -> DexResult<()>
    {
        self.ensure_layout();
        self.drop_stale_hidden_api();
        self.refresh_indexes()?;
        let mut previous: Option<Vec<u32>> = None;
        for pass in 0..MAX_LAYOUT_PASSES {
            let snapshot = self.layout_pass(options)?;
            self.refresh_offsets()?;
            if previous.as_ref() == Some(&snapshot) {
                debug!("layout settled after {} passes, {} bytes", pass + 1, self.header.file_size);
                return Ok(());
            }
            previous = Some(snapshot);
        }
        fail!(Format, "Layout did not settle after {} passes", MAX_LAYOUT_PASSES)
    }

    pub fn to_bytes(&mut self) -> DexResult<Vec<u8>>
    {
        self.to_bytes_with(&WriteOptions::default())
    }

    pub fn to_bytes_with(&mut self, options: &WriteOptions) -> DexResult<Vec<u8>>
    {
        self.refresh_with(options)?;
        let fill = options.fill;
        let mut out = Vec::with_capacity(self.header.file_size as usize);
        self.header.write_bytes(&mut out);

        for entry in &self.layout {
            if self.entry_count(entry) == 0 {
                continue;
            }
            match entry {
                LayoutEntry::Raw(i) => {
                    let raw = &self.raw[*i];
                    fill_to(&mut out, raw.offset(), fill)?;
                    write_x(&mut out, raw.bytes());
                }
                LayoutEntry::Modelled(kind) => match kind {
                    SectionType::Header => {}
                    SectionType::MapList => {
                        fill_to(&mut out, self.header.map_off, fill)?;
                        self.map.write_bytes(&mut out);
                    }
                    SectionType::StringId => {
                        let section = self.strings.section();
                        for (id, s) in section.iter() {
                            fill_to(&mut out, section.offset_of(id).unwrap_or(0), fill)?;
                            write_u4(&mut out, s.data_off);
                        }
                    }
                    SectionType::StringData => {
                        for (_, s) in self.strings.section().iter() {
                            fill_to(&mut out, s.data_off, fill)?;
                            s.value.write_bytes(&mut out);
                        }
                    }
                    SectionType::TypeId => write_items(&mut out, self.types.section(), fill)?,
                    SectionType::ProtoId => write_items(&mut out, self.protos.section(), fill)?,
                    SectionType::FieldId => write_items(&mut out, self.fields.section(), fill)?,
                    SectionType::MethodId => write_items(&mut out, self.methods.section(), fill)?,
                    SectionType::ClassDef => write_items(&mut out, &self.class_defs, fill)?,
                    SectionType::TypeList => write_items(&mut out, &self.type_lists, fill)?,
                    SectionType::ClassData => write_items(&mut out, &self.class_data, fill)?,
                    SectionType::CodeItem => write_items(&mut out, &self.code_items, fill)?,
                    SectionType::DebugInfo => write_items(&mut out, &self.debug_infos, fill)?,
                    other => fail!(Format, "{} has no writer", other),
                },
            }
        }
        fill_to(&mut out, self.header.file_size, fill)?;

        if options.update_checksum {
            let signature = compute_sha1(&out[32..]);
            out[12..32].copy_from_slice(&signature);
            self.header.signature = signature;
            let checksum = adler32_slice(&out[12..]);
            put_u4(&mut out, 8, checksum);
            self.header.checksum = checksum;
        }
        debug!("wrote {} bytes", out.len());
        Ok(out)
    }

    pub fn write_to_file<P: AsRef<Path>>(&mut self, path: P) -> DexResult<()>
    {
        let bytes = self.to_bytes()?;
        fs::write(path.as_ref(), bytes).map_err(|e| err!(Io, "{}", e).with_context(path.as_ref().display().to_string()))
    }
}
