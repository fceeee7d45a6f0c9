/* Dex header and map list */

use crate::block::{write_u2, write_u4, write_x, Block, BlockReader};
use crate::dex::section::SectionType;
use crate::error::DexResult;

pub const DEX_FILE_MAGIC: [u8; 8] = [ 0x64, 0x65, 0x78, 0x0a, 0x30, 0x33, 0x39, 0x00 ];
pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const REVERSE_ENDIAN_CONSTANT: u32 = 0x78563412;
pub const HEADER_SIZE: u32 = 0x70;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Header {
    pub magic: [u8; 8],
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link_size: u32,
    pub link_off: u32,
    pub map_off: u32,
    pub string_ids_size: u32,
    pub string_ids_off: u32,
    pub type_ids_size: u32,
    pub type_ids_off: u32,
    pub proto_ids_size: u32,
    pub proto_ids_off: u32,
    pub field_ids_size: u32,
    pub field_ids_off: u32,
    pub method_ids_size: u32,
    pub method_ids_off: u32,
    pub class_defs_size: u32,
    pub class_defs_off: u32,
    pub data_size: u32,
    pub data_off: u32,
}

impl Default for Header
{
    fn default() -> Header
    {
        Header {
            magic: DEX_FILE_MAGIC,
            checksum: 0,
            signature: [0; 20],
            file_size: HEADER_SIZE,
            header_size: HEADER_SIZE,
            endian_tag: ENDIAN_CONSTANT,
            link_size: 0,
            link_off: 0,
            map_off: 0,
            string_ids_size: 0,
            string_ids_off: 0,
            type_ids_size: 0,
            type_ids_off: 0,
            proto_ids_size: 0,
            proto_ids_off: 0,
            field_ids_size: 0,
            field_ids_off: 0,
            method_ids_size: 0,
            method_ids_off: 0,
            class_defs_size: 0,
            class_defs_off: 0,
            data_size: 0,
            data_off: 0,
        }
    }
}

impl Header
{
    /// Three-digit format version from the magic, e.g. 35 or 39.
    pub fn version(&self) -> Option<u32>
    {
        std::str::from_utf8(&self.magic[4..7]).ok()?.parse().ok()
    }

    /// Sets the (count, offset) pair the header carries for an id section.
    pub fn set_section(&mut self, kind: SectionType, size: u32, offset: u32)
    {
        let offset = if size == 0 { 0 } else { offset };
        match kind {
            SectionType::StringId => { self.string_ids_size = size; self.string_ids_off = offset; }
            SectionType::TypeId => { self.type_ids_size = size; self.type_ids_off = offset; }
            SectionType::ProtoId => { self.proto_ids_size = size; self.proto_ids_off = offset; }
            SectionType::FieldId => { self.field_ids_size = size; self.field_ids_off = offset; }
            SectionType::MethodId => { self.method_ids_size = size; self.method_ids_off = offset; }
            SectionType::ClassDef => { self.class_defs_size = size; self.class_defs_off = offset; }
            _ => {}
        }
    }
}

impl Block for Header
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<Header>
    {
        if reader.remaining() < HEADER_SIZE as usize {
            fail!(Format, "Not enough bytes for header: {}", reader.remaining());
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&reader.read_x(8)?);
        if magic[0..4] != DEX_FILE_MAGIC[0..4] || magic[7] != 0 {
            fail!(Format, "Invalid magic value {:02x?}", magic);
        }
        let checksum = reader.read_u4()?;
        let mut signature = [0u8; 20];
        signature.copy_from_slice(&reader.read_x(20)?);

        let header = Header {
            magic,
            checksum,
            signature,
            file_size: reader.read_u4()?,
            header_size: reader.read_u4()?,
            endian_tag: reader.read_u4()?,
            link_size: reader.read_u4()?,
            link_off: reader.read_u4()?,
            map_off: reader.read_u4()?,
            string_ids_size: reader.read_u4()?,
            string_ids_off: reader.read_u4()?,
            type_ids_size: reader.read_u4()?,
            type_ids_off: reader.read_u4()?,
            proto_ids_size: reader.read_u4()?,
            proto_ids_off: reader.read_u4()?,
            field_ids_size: reader.read_u4()?,
            field_ids_off: reader.read_u4()?,
            method_ids_size: reader.read_u4()?,
            method_ids_off: reader.read_u4()?,
            class_defs_size: reader.read_u4()?,
            class_defs_off: reader.read_u4()?,
            data_size: reader.read_u4()?,
            data_off: reader.read_u4()?,
        };

        if header.endian_tag == REVERSE_ENDIAN_CONSTANT {
            fail!(UnsupportedFormat, "Big-endian dex files are not supported");
        }
        if header.endian_tag != ENDIAN_CONSTANT {
            fail!(Format, "Invalid endian tag 0x{:08x}", header.endian_tag);
        }
        Ok(header)
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_x(bytes, &self.magic);
        c += write_u4(bytes, self.checksum);
        c += write_x(bytes, &self.signature);
        c += write_u4(bytes, self.file_size);
        c += write_u4(bytes, self.header_size);
        c += write_u4(bytes, self.endian_tag);
        c += write_u4(bytes, self.link_size);
        c += write_u4(bytes, self.link_off);
        c += write_u4(bytes, self.map_off);
        c += write_u4(bytes, self.string_ids_size);
        c += write_u4(bytes, self.string_ids_off);
        c += write_u4(bytes, self.type_ids_size);
        c += write_u4(bytes, self.type_ids_off);
        c += write_u4(bytes, self.proto_ids_size);
        c += write_u4(bytes, self.proto_ids_off);
        c += write_u4(bytes, self.field_ids_size);
        c += write_u4(bytes, self.field_ids_off);
        c += write_u4(bytes, self.method_ids_size);
        c += write_u4(bytes, self.method_ids_off);
        c += write_u4(bytes, self.class_defs_size);
        c += write_u4(bytes, self.class_defs_off);
        c += write_u4(bytes, self.data_size);
        c += write_u4(bytes, self.data_off);
        c
    }
}

/// One map_list entry: section type, item count and file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapItem {
    pub kind: SectionType,
    pub size: u32,
    pub offset: u32,
}

impl MapItem
{
    pub fn new(kind: SectionType, size: u32, offset: u32) -> Self
    {
        MapItem { kind, size, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MapList {
    pub items: Vec<MapItem>,
}

impl MapList
{
    pub fn byte_size(entries: usize) -> usize
    {
        4 + entries * 12
    }

    /// Entries ordered by file offset, which is the order sections are laid out in.
    pub fn by_offset(&self) -> Vec<MapItem>
    {
        let mut v = self.items.clone();
        v.sort_by_key(|m| (m.offset, m.kind.read_rank()));
        v
    }

    pub fn find(&self, kind: SectionType) -> Option<&MapItem>
    {
        self.items.iter().find(|m| m.kind == kind)
    }
}

impl Block for MapList
{
    fn read_bytes(reader: &mut BlockReader<'_>) -> DexResult<MapList>
    {
        let size = reader.read_u4()?;
        if size as usize * 12 > reader.remaining() {
            fail!(Format, "Map list declares {} entries with {} bytes left", size, reader.remaining());
        }
        let mut items = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let kind = SectionType::from_code(reader.read_u2()?);
            reader.read_u2()?;
            let count = reader.read_u4()?;
            let offset = reader.read_u4()?;
            if items.iter().any(|m: &MapItem| m.kind == kind) {
                fail!(Format, "Duplicate map entry for {}", kind);
            }
            items.push(MapItem::new(kind, count, offset));
        }
        Ok(MapList { items })
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u4(bytes, self.items.len() as u32);
        for item in &self.items {
            c += write_u2(bytes, item.kind.code());
            c += write_u2(bytes, 0);
            c += write_u4(bytes, item.size);
            c += write_u4(bytes, item.offset);
        }
        c
    }
}
