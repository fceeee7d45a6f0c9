/* Dex id items and type lists */

use cesu8::{from_java_cesu8, to_java_cesu8};

use crate::block::{write_u1, write_u2, write_u4, write_uleb128, write_x, Block, BlockReader};
use crate::dex::reference::{IndexReference, OffsetReference};
use crate::dex::section::Section;
use crate::error::DexResult;

/// Modified UTF-8 string data; undecodable data is kept verbatim.
#[derive(Debug, Eq, PartialEq, Hash, Clone, PartialOrd, Ord)]
pub enum DexString
{
    Decoded(String),
    Raw(u32, Vec<u8>),
}

impl DexString
{
    pub fn from_string(s: &str) -> DexString
    {
        DexString::Decoded(s.to_string())
    }

    pub fn as_str(&self) -> Option<&str>
    {
        match self
        {
            DexString::Decoded(s) => Some(s),
            DexString::Raw(_, _) => None,
        }
    }

    /// Text for diagnostics, lossy for raw data.
    pub fn to_lossy(&self) -> String
    {
        match self
        {
            DexString::Decoded(s) => s.clone(),
            DexString::Raw(_, v) => String::from_utf8_lossy(v).into_owned(),
        }
    }

    pub fn is_decoded(&self) -> bool
    {
        matches!(self, DexString::Decoded(_))
    }

    /// Order used by sorted string ids: UTF-16 code unit order.
    pub fn cmp_utf16(&self, other: &DexString) -> std::cmp::Ordering
    {
        match (self, other)
        {
            (DexString::Decoded(a), DexString::Decoded(b)) => a.encode_utf16().cmp(b.encode_utf16()),
            _ => self.cmp(other),
        }
    }
}

impl Block for DexString
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<DexString>
    {
        let utf16_size = reader.read_uleb128()?;
        let mut v = vec![];

        loop
        {
            let u = reader.read_u1()?;
            if u != 0 { v.push(u); }
            else { break; }
        }

        Ok(match from_java_cesu8(v.as_slice())
        {
            Ok(converted_str) => DexString::Decoded(converted_str.to_string()),
            _ => DexString::Raw(utf16_size, v)
        })
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;

        match self
        {
            DexString::Raw(utf16_size, v) => {
                c += write_uleb128(bytes, *utf16_size);
                c += write_x(bytes, v);
                c += write_u1(bytes, 0);
            },

            DexString::Decoded(s) => {
                let encoded = to_java_cesu8(s);
                c += write_uleb128(bytes, s.encode_utf16().count() as u32);
                c += write_x(bytes, &encoded);
                c += write_u1(bytes, 0);
            }
        }
        c
    }
}

/// string_id_item; the data offset is assigned when the string data section is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringItem
{
    pub value: DexString,
    pub data_off: u32,
}

impl StringItem
{
    pub fn new(value: DexString) -> StringItem
    {
        StringItem { value, data_off: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeItem
{
    pub descriptor: IndexReference<StringItem>,
}

impl Block for TypeItem
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<TypeItem>
    {
        Ok(TypeItem { descriptor: IndexReference::new(reader.read_u4()?) })
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        write_u4(bytes, self.descriptor.get())
    }
}

/// type_list: a u32 count followed by u16 type indexes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeList
{
    pub types: Vec<IndexReference<TypeItem>>,
}

impl Block for TypeList
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<TypeList>
    {
        let size = reader.read_u4()?;
        let mut types = Vec::with_capacity(size as usize);
        for _ in 0..size { types.push(IndexReference::new(reader.read_u2()? as u32)); }
        Ok(TypeList { types })
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u4(bytes, self.types.len() as u32);
        for t in &self.types { c += write_u2(bytes, t.get() as u16); }
        c
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoItem
{
    pub shorty: IndexReference<StringItem>,
    pub return_type: IndexReference<TypeItem>,
    pub parameters: OffsetReference<TypeList>,
}

impl Block for ProtoItem
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<ProtoItem>
    {
        Ok(ProtoItem {
            shorty: IndexReference::new(reader.read_u4()?),
            return_type: IndexReference::new(reader.read_u4()?),
            parameters: OffsetReference::new(reader.read_u4()?),
        })
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u4(bytes, self.shorty.get());
        c += write_u4(bytes, self.return_type.get());
        c += write_u4(bytes, self.parameters.get());
        c
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldItem
{
    pub class: IndexReference<TypeItem>,
    pub field_type: IndexReference<TypeItem>,
    pub name: IndexReference<StringItem>,
}

impl Block for FieldItem
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<FieldItem>
    {
        Ok(FieldItem {
            class: IndexReference::new(reader.read_u2()? as u32),
            field_type: IndexReference::new(reader.read_u2()? as u32),
            name: IndexReference::new(reader.read_u4()?),
        })
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u2(bytes, self.class.get() as u16);
        c += write_u2(bytes, self.field_type.get() as u16);
        c += write_u4(bytes, self.name.get());
        c
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodItem
{
    pub class: IndexReference<TypeItem>,
    pub proto: IndexReference<ProtoItem>,
    pub name: IndexReference<StringItem>,
}

impl Block for MethodItem
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<MethodItem>
    {
        Ok(MethodItem {
            class: IndexReference::new(reader.read_u2()? as u32),
            proto: IndexReference::new(reader.read_u2()? as u32),
            name: IndexReference::new(reader.read_u4()?),
        })
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u2(bytes, self.class.get() as u16);
        c += write_u2(bytes, self.proto.get() as u16);
        c += write_u4(bytes, self.name.get());
        c
    }
}

/// Read-only view of the five index-addressed id sections, for resolving and refreshing references.
#[derive(Clone, Copy)]
pub struct IdSections<'a>
{
    pub strings: &'a Section<StringItem>,
    pub types: &'a Section<TypeItem>,
    pub protos: &'a Section<ProtoItem>,
    pub fields: &'a Section<FieldItem>,
    pub methods: &'a Section<MethodItem>,
}
