/* class_def_item and class_data_item */

use bitflags::bitflags;

use crate::block::{write_u4, write_uleb128, Block, BlockReader};
use crate::dex::code::CodeItem;
use crate::dex::ids::{FieldItem, IdSections, MethodItem, StringItem, TypeItem, TypeList};
use crate::dex::raw::RawOffset;
use crate::dex::reference::{IndexReference, OffsetReference};
use crate::dex::section::Section;
use crate::error::DexResult;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDefItem
{
    pub class: IndexReference<TypeItem>,
    pub access_flags: AccessFlags,
    pub superclass: IndexReference<TypeItem>,
    pub interfaces: OffsetReference<TypeList>,
    pub source_file: IndexReference<StringItem>,
    pub annotations: RawOffset,
    pub class_data: OffsetReference<ClassDataItem>,
    pub static_values: RawOffset,
}

impl ClassDefItem
{
    pub fn new(class: IndexReference<TypeItem>, access_flags: AccessFlags) -> ClassDefItem
    {
        ClassDefItem {
            class,
            access_flags,
            superclass: IndexReference::absent(),
            interfaces: OffsetReference::absent(),
            source_file: IndexReference::absent(),
            annotations: RawOffset::default(),
            class_data: OffsetReference::absent(),
            static_values: RawOffset::default(),
        }
    }

    pub fn link(&mut self, ids: &IdSections<'_>, type_lists: &Section<TypeList>, class_data: &Section<ClassDataItem>)
    {
        self.class.item(ids.types);
        self.superclass.item(ids.types);
        self.source_file.item(ids.strings);
        self.interfaces.item(type_lists);
        self.class_data.item(class_data);
    }

    pub fn refresh_indexes(&mut self, ids: &IdSections<'_>)
    {
        self.class.refresh(ids.types);
        self.superclass.refresh(ids.types);
        self.source_file.refresh(ids.strings);
    }

    pub fn refresh_offsets(&mut self, type_lists: &Section<TypeList>, class_data: &Section<ClassDataItem>)
    {
        self.interfaces.refresh(type_lists);
        self.class_data.refresh(class_data);
    }
}

impl Block for ClassDefItem
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<ClassDefItem>
    {
        Ok(ClassDefItem {
            class: IndexReference::new(reader.read_u4()?),
            access_flags: AccessFlags::from_bits_retain(reader.read_u4()?),
            superclass: IndexReference::new(reader.read_u4()?),
            interfaces: OffsetReference::new(reader.read_u4()?),
            source_file: IndexReference::new(reader.read_u4()?),
            annotations: RawOffset::new(reader.read_u4()?),
            class_data: OffsetReference::new(reader.read_u4()?),
            static_values: RawOffset::new(reader.read_u4()?),
        })
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u4(bytes, self.class.get());
        c += write_u4(bytes, self.access_flags.bits());
        c += write_u4(bytes, self.superclass.get());
        c += write_u4(bytes, self.interfaces.get());
        c += write_u4(bytes, self.source_file.get());
        c += write_u4(bytes, self.annotations.get());
        c += write_u4(bytes, self.class_data.get());
        c += write_u4(bytes, self.static_values.get());
        c
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedField
{
    pub field: IndexReference<FieldItem>,
    pub access_flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedMethod
{
    pub method: IndexReference<MethodItem>,
    pub access_flags: u32,
    pub code: OffsetReference<CodeItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassDataItem
{
    pub static_fields: Vec<EncodedField>,
    pub instance_fields: Vec<EncodedField>,
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

fn read_fields(reader: &mut BlockReader<'_>, count: u32) -> DexResult<Vec<EncodedField>>
{
    let mut v = Vec::with_capacity(count.min(4096) as usize);
    let mut idx: u32 = 0;
    for _ in 0..count {
        idx = idx.wrapping_add(reader.read_uleb128()?);
        let access_flags = reader.read_uleb128()?;
        v.push(EncodedField { field: IndexReference::new(idx), access_flags });
    }
    Ok(v)
}

fn read_methods(reader: &mut BlockReader<'_>, count: u32) -> DexResult<Vec<EncodedMethod>>
{
    let mut v = Vec::with_capacity(count.min(4096) as usize);
    let mut idx: u32 = 0;
    for _ in 0..count {
        idx = idx.wrapping_add(reader.read_uleb128()?);
        let access_flags = reader.read_uleb128()?;
        let code = OffsetReference::new(reader.read_uleb128()?);
        v.push(EncodedMethod { method: IndexReference::new(idx), access_flags, code });
    }
    Ok(v)
}

impl ClassDataItem
{
    pub fn link(&mut self, ids: &IdSections<'_>, code_items: &Section<CodeItem>)
    {
        for f in self.static_fields.iter_mut().chain(self.instance_fields.iter_mut()) {
            f.field.item(ids.fields);
        }
        for m in self.direct_methods.iter_mut().chain(self.virtual_methods.iter_mut()) {
            m.method.item(ids.methods);
            m.code.item(code_items);
        }
    }

    /// Refreshes member indexes and restores the ascending order the diff encoding needs.
    pub fn refresh_indexes(&mut self, ids: &IdSections<'_>)
    {
        for f in self.static_fields.iter_mut().chain(self.instance_fields.iter_mut()) {
            f.field.refresh(ids.fields);
        }
        for m in self.direct_methods.iter_mut().chain(self.virtual_methods.iter_mut()) {
            m.method.refresh(ids.methods);
        }
        self.static_fields.sort_by_key(|f| f.field.get());
        self.instance_fields.sort_by_key(|f| f.field.get());
        self.direct_methods.sort_by_key(|m| m.method.get());
        self.virtual_methods.sort_by_key(|m| m.method.get());
    }

    pub fn refresh_offsets(&mut self, code_items: &Section<CodeItem>)
    {
        for m in self.direct_methods.iter_mut().chain(self.virtual_methods.iter_mut()) {
            m.code.refresh(code_items);
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = &EncodedMethod> + '_
    {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    fn write_fields(bytes: &mut Vec<u8>, fields: &[EncodedField]) -> usize
    {
        let mut c = 0;
        let mut prev = 0u32;
        for f in fields {
            c += write_uleb128(bytes, f.field.get().wrapping_sub(prev));
            c += write_uleb128(bytes, f.access_flags);
            prev = f.field.get();
        }
        c
    }

    fn write_methods(bytes: &mut Vec<u8>, methods: &[EncodedMethod]) -> usize
    {
        let mut c = 0;
        let mut prev = 0u32;
        for m in methods {
            c += write_uleb128(bytes, m.method.get().wrapping_sub(prev));
            c += write_uleb128(bytes, m.access_flags);
            c += write_uleb128(bytes, m.code.get());
            prev = m.method.get();
        }
        c
    }
}

impl Block for ClassDataItem
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<ClassDataItem>
    {
        let static_fields_size = reader.read_uleb128()?;
        let instance_fields_size = reader.read_uleb128()?;
        let direct_methods_size = reader.read_uleb128()?;
        let virtual_methods_size = reader.read_uleb128()?;
        Ok(ClassDataItem {
            static_fields: read_fields(reader, static_fields_size)?,
            instance_fields: read_fields(reader, instance_fields_size)?,
            direct_methods: read_methods(reader, direct_methods_size)?,
            virtual_methods: read_methods(reader, virtual_methods_size)?,
        })
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_uleb128(bytes, self.static_fields.len() as u32);
        c += write_uleb128(bytes, self.instance_fields.len() as u32);
        c += write_uleb128(bytes, self.direct_methods.len() as u32);
        c += write_uleb128(bytes, self.virtual_methods.len() as u32);
        c += Self::write_fields(bytes, &self.static_fields);
        c += Self::write_fields(bytes, &self.instance_fields);
        c += Self::write_methods(bytes, &self.direct_methods);
        c += Self::write_methods(bytes, &self.virtual_methods);
        c
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn class_data_diff_encoding()
    {
        let mut data = ClassDataItem::default();
        data.static_fields.push(EncodedField { field: IndexReference::new(3), access_flags: 0x8 });
        data.static_fields.push(EncodedField { field: IndexReference::new(7), access_flags: 0x8 });
        data.direct_methods.push(EncodedMethod { method: IndexReference::new(200), access_flags: 0x10001, code: OffsetReference::new(0x1234) });
        let mut out = Vec::new();
        data.write_bytes(&mut out);
        assert_eq!(&out[..4], &[2, 0, 1, 0]);
        assert_eq!(&out[4..8], &[3, 8, 4, 8]);
        let back = ClassDataItem::read_bytes(&mut BlockReader::new(&out)).unwrap();
        assert_eq!(back, data);
        assert_eq!(back.methods().count(), 1);
    }

    #[test]
    fn access_flags_keep_unknown_bits()
    {
        let bytes = [0u8, 0, 0, 0, 0x01, 0x00, 0x10, 0x80, 0xff, 0xff, 0xff, 0xff,
                     0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let def = ClassDefItem::read_bytes(&mut BlockReader::new(&bytes)).unwrap();
        assert!(def.access_flags.contains(AccessFlags::PUBLIC));
        assert_eq!(def.access_flags.bits(), 0x8010_0001);
        assert!(def.superclass.is_absent());
        let mut out = Vec::new();
        def.write_bytes(&mut out);
        assert_eq!(out, bytes);
    }
}
