use crate::android::chunk::{begin_chunk, finalize_chunk, write_u16, write_u32, ChunkType};
use crate::android::entry::{remap_type_strings, TYPE_STRING};
use crate::android::TableBlock;
use crate::config::ReadOptions;
use crate::error::ErrorKind;

/// A TYPE chunk whose entries each hold one string value, keyed 0..n.
fn string_type_chunk(type_id: u8, values: &[u32]) -> Vec<u8> {
    let header_size = 24usize;
    let mut buf = Vec::new();
    let start = begin_chunk(&mut buf, ChunkType::Type, header_size as u16);
    buf.push(type_id);
    buf.push(0);
    write_u16(&mut buf, 0);
    write_u32(&mut buf, values.len() as u32);
    write_u32(&mut buf, (header_size + values.len() * 4) as u32);
    write_u32(&mut buf, 4); // config size
    for i in 0..values.len() {
        write_u32(&mut buf, (i * 16) as u32);
    }
    for (key, value) in values.iter().enumerate() {
        write_u16(&mut buf, 8);
        write_u16(&mut buf, 0);
        write_u32(&mut buf, key as u32);
        write_u16(&mut buf, 8);
        buf.push(0);
        buf.push(TYPE_STRING);
        write_u32(&mut buf, *value);
    }
    finalize_chunk(&mut buf, start);
    buf
}

fn table_with(strings: &[&str], package: u32, name: &str, values: &[u32]) -> TableBlock {
    let mut table = TableBlock::new().unwrap();
    for s in strings {
        table.strings_mut().get_or_create(s).unwrap();
    }
    let p = table.get_or_create_package(package, name).unwrap();
    p.type_strings_mut().unwrap().get_or_create("string").unwrap();
    for i in 0..values.len() {
        p.key_strings_mut().unwrap().get_or_create(&format!("key{}", i)).unwrap();
    }
    table.push_package_chunk(package, &string_type_chunk(1, values)).unwrap();
    table
}

/// Global string values of the package's TYPE chunks, in entry order.
fn string_values(table: &TableBlock, package: u32) -> Vec<String> {
    let package = table.package(package).unwrap();
    let tree = table.tree();
    let mut values = Vec::new();
    for (kind, node) in package.chunks() {
        if *kind != ChunkType::Type {
            continue;
        }
        let mut bytes = Vec::new();
        tree.write_bytes(*node, &mut bytes);
        remap_type_strings(&mut bytes, |i| {
            values.push(table.strings().get(i).unwrap_or("?").to_string());
            Ok(i)
        })
        .unwrap();
    }
    values
}

#[test]
fn built_table_reads_back_byte_identical() {
    let mut table = table_with(&["res/layout/main.xml", "Hello"], 0x7f, "com.example.app", &[1, 0]);
    let first = table.to_bytes().unwrap();
    let mut back = TableBlock::from_bytes(&first).unwrap();
    assert_eq!(back.packages().len(), 1);
    let package = back.package(0x7f).unwrap();
    assert_eq!(package.name(), "com.example.app");
    assert_eq!(package.chunk_count(ChunkType::Type), 1);
    assert_eq!(package.key_strings().unwrap().len(), 2);
    assert_eq!(string_values(&back, 0x7f), vec!["Hello", "res/layout/main.xml"]);
    assert_eq!(back.to_bytes().unwrap(), first);
    assert_eq!(back.to_bytes().unwrap(), first);
}

#[test]
fn merge_remaps_global_strings() {
    let mut base = table_with(&["a0", "shared"], 0x7f, "app", &[1]);
    let lib = table_with(&["only_lib", "x", "shared"], 0x02, "lib", &[0, 2]);

    assert_eq!(base.merge(&lib).unwrap(), 1);
    assert_eq!(base.strings().len(), 3);
    assert_eq!(base.strings().index_of("only_lib"), Some(2));
    assert_eq!(string_values(&base, 0x02), vec!["only_lib", "shared"]);

    let bytes = base.to_bytes().unwrap();
    let back = TableBlock::from_bytes(&bytes).unwrap();
    let ids: Vec<u32> = back.packages().iter().map(|p| p.id()).collect();
    assert_eq!(ids, vec![0x7f, 0x02]);
    assert_eq!(back.package(0x02).unwrap().name(), "lib");
    assert_eq!(string_values(&back, 0x7f), vec!["shared"]);
    assert_eq!(string_values(&back, 0x02), vec!["only_lib", "shared"]);
}

#[test]
fn merge_rejects_existing_package_ids() {
    let mut base = table_with(&["a"], 0x7f, "app", &[0]);
    let same = table_with(&["b"], 0x7f, "other", &[0]);
    assert_eq!(base.merge(&same).unwrap_err().kind(), ErrorKind::InvalidKey);
    assert_eq!(base.packages().len(), 1);
    assert_eq!(base.package(0x7f).unwrap().name(), "app");
}

#[test]
fn packages_sort_by_id() {
    let mut table = TableBlock::new().unwrap();
    for (id, name) in [(0x7f, "app"), (0x02, "lib"), (0x10, "feature")] {
        table.get_or_create_package(id, name).unwrap();
    }
    table.sort_packages().unwrap();
    let bytes = table.to_bytes().unwrap();
    let back = TableBlock::from_bytes(&bytes).unwrap();
    let names: Vec<&str> = back.packages().iter().map(|p| p.name()).collect();
    assert_eq!(names, vec!["lib", "feature", "app"]);
}

#[test]
fn renamed_package_is_written() {
    let mut table = table_with(&["a"], 0x7f, "app", &[0]);
    table.rename_package(0x7f, "com.renamed").unwrap();
    assert_eq!(table.rename_package(0x10, "x").unwrap_err().kind(), ErrorKind::InvalidKey);
    let bytes = table.to_bytes().unwrap();
    let back = TableBlock::from_bytes(&bytes).unwrap();
    assert_eq!(back.package(0x7f).unwrap().name(), "com.renamed");
}

#[test]
fn unknown_chunks_are_carried_verbatim() {
    let mut table = table_with(&["a"], 0x7f, "app", &[0]);
    let mut bytes = table.to_bytes().unwrap();
    let mut extra = Vec::new();
    let start = begin_chunk(&mut extra, ChunkType::Unknown(0x7777), 8);
    write_u32(&mut extra, 0xdead_beef);
    finalize_chunk(&mut extra, start);
    bytes.extend_from_slice(&extra);
    let size = bytes.len() as u32;
    bytes[4..8].copy_from_slice(&size.to_le_bytes());

    let mut back = TableBlock::from_bytes(&bytes).unwrap();
    assert_eq!(back.to_bytes().unwrap(), bytes);

    let strict = ReadOptions { preserve_unknown: false, ..ReadOptions::default() };
    assert_eq!(TableBlock::from_bytes_with(&bytes, &strict).unwrap_err().kind(), ErrorKind::UnsupportedFormat);
}

#[test]
fn edited_global_pool_keeps_package_bytes() {
    let mut table = table_with(&["a", "b"], 0x7f, "app", &[1]);
    let before = table.to_bytes().unwrap();
    let mut back = TableBlock::from_bytes(&before).unwrap();
    back.strings_mut().set(1, "bee").unwrap();
    let after = back.to_bytes().unwrap();
    assert_ne!(after, before);
    let reread = TableBlock::from_bytes(&after).unwrap();
    assert_eq!(string_values(&reread, 0x7f), vec!["bee"]);
    // the package chunk trails the pool and is unchanged
    let package_len = reread.tree().length(reread.package(0x7f).unwrap().node()).unwrap() as usize;
    assert_eq!(after[after.len() - package_len..], before[before.len() - package_len..]);
}
