use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::block::{get_u2, get_u4, put_u4, write_u2, write_u4};
use crate::config::ReadOptions;
use crate::dex::{AccessFlags, CodeItem, DebugInfo, DexFile, FieldKey, MethodKey, OffsetReference, ProtoKey, SectionType};
use crate::error::ErrorKind;

const GREETER: &str = "Lcom/example/Greeter;";

const OP_CONST_STRING: u16 = 0x1a;
const OP_RETURN_VOID: u16 = 0x0e;

/// A method body loading `text` into v0 and returning.
fn const_string_code(dex: &mut DexFile, text: &str) -> CodeItem {
    let s = dex.get_or_create_string(text).unwrap();
    let index = dex.strings().index_of(s).unwrap();
    CodeItem::new(1, 0, 0, vec![OP_CONST_STRING, index as u16, OP_RETURN_VOID])
}

fn void_method(class: &str, name: &str) -> MethodKey {
    MethodKey::new(class, name, ProtoKey::new("V", &[]).unwrap()).unwrap()
}

fn sample() -> DexFile {
    let mut dex = DexFile::new();
    let class = dex.define_class(GREETER, AccessFlags::PUBLIC, Some("Ljava/lang/Object;")).unwrap();
    let field = FieldKey::new(GREETER, "greeting", "Ljava/lang/String;").unwrap();
    dex.add_field(class, &field, AccessFlags::PRIVATE | AccessFlags::STATIC).unwrap();

    let mut info = DebugInfo::new(10);
    info.sequence.set_line_at(0, 10);
    let info = dex.add_debug_info(info);
    let mut code = const_string_code(&mut dex, "Hello");
    code.debug_info = OffsetReference::to(info);
    dex.add_method(class, &void_method(GREETER, "sayHello"), AccessFlags::PUBLIC, Some(code)).unwrap();
    dex.sort_ids();
    dex
}

// header slots
const FILE_SIZE_AT: usize = 32;
const MAP_OFF_AT: usize = 52;
const CLASS_DEFS_OFF_AT: usize = 100;
const DATA_SIZE_AT: usize = 104;
const DATA_OFF_AT: usize = 108;
// class_def_item slots
const CLASS_ANNOTATIONS_AT: usize = 20;
const CLASS_STATIC_VALUES_AT: usize = 28;

const VALUE_STRING: u8 = 0x17;

fn u4(bytes: &[u8], at: usize) -> u32 {
    get_u4(bytes, at).unwrap()
}

/// Inserts `(type, count, bytes)` sections ahead of the map list and lists them in it.
/// Returns the new file and the offset of each inserted section.
fn splice_sections(bytes: &[u8], sections: &[(u16, u32, Vec<u8>)]) -> (Vec<u8>, Vec<u32>) {
    let map_off = u4(bytes, MAP_OFF_AT) as usize;
    let count = u4(bytes, map_off) as usize;
    let mut entries: Vec<(u16, u32, u32)> = (0..count)
        .map(|i| map_off + 4 + i * 12)
        .map(|at| (get_u2(bytes, at).unwrap(), u4(bytes, at + 4), u4(bytes, at + 8)))
        .filter(|e| e.0 != SectionType::MapList.code())
        .collect();

    let mut out = bytes[..map_off].to_vec();
    let mut offsets = Vec::new();
    for (kind, size, data) in sections {
        out.resize((out.len() + 3) & !3, 0);
        offsets.push(out.len() as u32);
        entries.push((*kind, *size, out.len() as u32));
        out.extend_from_slice(data);
    }
    out.resize((out.len() + 3) & !3, 0);
    let new_map = out.len() as u32;
    entries.push((SectionType::MapList.code(), 1, new_map));
    write_u4(&mut out, entries.len() as u32);
    for (kind, size, offset) in &entries {
        write_u2(&mut out, *kind);
        write_u2(&mut out, 0);
        write_u4(&mut out, *size);
        write_u4(&mut out, *offset);
    }

    let file_size = out.len() as u32;
    let data_off = u4(&out, DATA_OFF_AT);
    put_u4(&mut out, MAP_OFF_AT, new_map);
    put_u4(&mut out, FILE_SIZE_AT, file_size);
    put_u4(&mut out, DATA_SIZE_AT, file_size - data_off);
    (out, offsets)
}

fn type_index(dex: &DexFile, descriptor: &str) -> Option<u32> {
    dex.types().ids().iter().position(|t| dex.type_descriptor(*t).as_deref() == Some(descriptor)).map(|i| i as u32)
}

fn string_at(dex: &DexFile, index: u8) -> Option<String> {
    dex.strings().get(index as u32).and_then(|id| dex.string(id)).map(|s| s.to_lossy())
}

fn string_index(dex: &DexFile, text: &str) -> Option<u32> {
    dex.strings().iter().position(|(_, s)| s.value.as_str() == Some(text)).map(|i| i as u32)
}

#[test]
fn written_file_reads_back_byte_identical() {
    let mut dex = sample();
    let first = dex.to_bytes().unwrap();
    let mut back = DexFile::from_bytes(&first).unwrap();
    assert_eq!(back.class_defs().len(), 1);
    assert_eq!(back.code_items().len(), 1);
    assert_eq!(back.debug_infos().len(), 1);
    let second = back.to_bytes().unwrap();
    assert_eq!(first, second);
}

#[test]
fn refresh_is_idempotent() {
    let mut dex = sample();
    let first = dex.to_bytes().unwrap();
    dex.refresh().unwrap();
    let second = dex.to_bytes().unwrap();
    assert_eq!(first, second);
}

#[test]
fn pools_stay_unique() {
    let mut dex = sample();
    let strings = dex.strings().len();
    let a = dex.get_or_create_string("Hello").unwrap();
    let b = dex.get_or_create_string("Hello").unwrap();
    assert_eq!(a, b);
    assert_eq!(dex.strings().len(), strings);

    let t = dex.get_or_create_type(GREETER).unwrap();
    assert_eq!(dex.get_or_create_type(GREETER).unwrap(), t);
    let m = dex.get_or_create_method(&void_method(GREETER, "sayHello")).unwrap();
    assert_eq!(dex.methods().len(), 1);
    assert_eq!(dex.method_key(m).unwrap().to_string(), "Lcom/example/Greeter;->sayHello()V");
}

#[test]
fn instruction_operands_follow_sorted_strings() {
    let mut dex = sample();
    let before = string_index(&dex, "Hello").unwrap();
    // sorts ahead of every existing string
    dex.get_or_create_string("AAA").unwrap();
    dex.sort_ids();
    let bytes = dex.to_bytes().unwrap();

    let back = DexFile::from_bytes(&bytes).unwrap();
    let after = string_index(&back, "Hello").unwrap();
    assert_eq!(after, before + 1);
    let (_, code) = back.code_items().iter().next().unwrap();
    assert_eq!(code.insns[1] as u32, after);
}

#[test]
fn rename_string_moves_every_user() {
    let mut dex = sample();
    let id = dex.get_or_create_string("Hello").unwrap();
    assert_eq!(dex.rename_string(id, "greeting").unwrap_err().kind(), ErrorKind::InvalidKey);
    assert_eq!(dex.string(id).and_then(|s| s.as_str()), Some("Hello"));

    let name = dex.get_or_create_string("sayHello").unwrap();
    dex.rename_string(name, "greet").unwrap();
    dex.sort_ids();
    let bytes = dex.to_bytes().unwrap();
    let back = DexFile::from_bytes(&bytes).unwrap();
    let (m, _) = back.methods().iter().next().unwrap();
    assert_eq!(back.method_key(m).unwrap().name, "greet");
    assert!(string_index(&back, "sayHello").is_none());
}

#[test]
fn shuffled_ids_sort_into_canonical_order() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut names: Vec<String> = (0..64).map(|i| format!("Lpkg/C{:02};", i)).collect();
    names.push("Lpkg/Ünicode;".to_string());
    names.push("[I".to_string());
    names.shuffle(&mut rng);

    let mut dex = DexFile::new();
    for n in &names {
        dex.get_or_create_type(n).unwrap();
    }
    dex.sort_ids();
    let bytes = dex.to_bytes().unwrap();
    let back = DexFile::from_bytes(&bytes).unwrap();

    let strings: Vec<_> = back.strings().iter().map(|(_, s)| s.value.clone()).collect();
    assert!(strings.windows(2).all(|w| w[0].cmp_utf16(&w[1]).is_lt()));
    let descriptors: Vec<String> = back.types().ids().iter().filter_map(|t| back.type_descriptor(*t)).collect();
    assert_eq!(descriptors.len(), names.len());
    let positions: Vec<u32> = descriptors.iter().map(|d| string_index(&back, d).unwrap()).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn remove_class_drops_its_code() {
    let mut dex = sample();
    let other = dex.define_class("Lcom/example/Other;", AccessFlags::PUBLIC, None).unwrap();
    let code = const_string_code(&mut dex, "Bye");
    dex.add_method(other, &void_method("Lcom/example/Other;", "run"), AccessFlags::PUBLIC, Some(code)).unwrap();
    assert_eq!(dex.code_items().len(), 2);

    let greeter = dex.find_class(GREETER).unwrap();
    dex.remove_class(greeter).unwrap();
    assert_eq!(dex.code_items().len(), 1);
    assert_eq!(dex.debug_infos().len(), 0);

    let bytes = dex.to_bytes().unwrap();
    let back = DexFile::from_bytes(&bytes).unwrap();
    assert_eq!(back.class_defs().len(), 1);
    assert!(back.find_class(GREETER).is_none());
    assert!(back.find_class("Lcom/example/Other;").is_some());
    assert_eq!(back.header().class_defs_size, 1);
}

#[test]
fn equal_debug_info_is_shared() {
    let mut dex = sample();
    let class = dex.find_class(GREETER).unwrap();
    let mut info = DebugInfo::new(10);
    info.sequence.set_line_at(0, 10);
    let info = dex.add_debug_info(info);
    let mut code = const_string_code(&mut dex, "Hello");
    code.debug_info = OffsetReference::to(info);
    dex.add_method(class, &void_method(GREETER, "sayHelloAgain"), AccessFlags::PUBLIC, Some(code)).unwrap();
    assert_eq!(dex.debug_infos().len(), 2);

    assert_eq!(dex.dedupe_debug_info(), 1);
    let bytes = dex.to_bytes().unwrap();
    let back = DexFile::from_bytes(&bytes).unwrap();
    assert_eq!(back.debug_infos().len(), 1);
    let offsets: Vec<u32> = back.code_items().iter().map(|(_, c)| c.debug_info.get()).collect();
    assert_eq!(offsets.len(), 2);
    assert_eq!(offsets[0], offsets[1]);
    assert_ne!(offsets[0], 0);
}

#[test]
fn truncated_files_fail_to_parse() {
    let mut dex = sample();
    let bytes = dex.to_bytes().unwrap();
    let err = DexFile::from_bytes(&bytes[..0x40]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[test]
fn sorted_strings_retarget_static_values() {
    let mut dex = sample();
    dex.get_or_create_string("zzz").unwrap();
    dex.get_or_create_string("AAA").unwrap();
    let bytes = dex.to_bytes().unwrap();
    let zzz = string_index(&dex, "zzz").unwrap() as u8;

    // encoded_array_item { "zzz" }
    let (mut spliced, offsets) = splice_sections(&bytes, &[(SectionType::EncodedArray.code(), 1, vec![1, VALUE_STRING, zzz])]);
    let class_def = u4(&spliced, CLASS_DEFS_OFF_AT) as usize;
    put_u4(&mut spliced, class_def + CLASS_STATIC_VALUES_AT, offsets[0]);

    let mut back = DexFile::from_bytes(&spliced).unwrap();
    back.sort_ids();
    let out = back.to_bytes().unwrap();
    let again = DexFile::from_bytes(&out).unwrap();

    let (_, def) = again.class_defs().iter().next().unwrap();
    let at = def.static_values.get() as usize;
    assert_ne!(at, 0);
    assert_eq!(&out[at..at + 2], &[1, VALUE_STRING]);
    assert_ne!(out[at + 2], zzz);
    assert_eq!(string_at(&again, out[at + 2]).as_deref(), Some("zzz"));
}

#[test]
fn annotations_follow_layout_and_renumbering() {
    let mut dex = sample();
    let bytes = dex.to_bytes().unwrap();
    let greeter = type_index(&dex, GREETER).unwrap() as u8;
    let name = string_index(&dex, "greeting").unwrap() as u8;
    let hello = string_index(&dex, "Hello").unwrap() as u8;
    assert!(greeter < 0x80 && name < 0x80);

    // annotation_item, annotation_set_item and annotations_directory_item; offsets patched below
    let item = vec![1, greeter, 1, name, VALUE_STRING, hello];
    let set = vec![1, 0, 0, 0, 0, 0, 0, 0];
    let directory = vec![0u8; 16];
    let (mut spliced, offsets) = splice_sections(&bytes, &[
        (SectionType::Annotation.code(), 1, item),
        (SectionType::AnnotationSet.code(), 1, set),
        (SectionType::AnnotationsDirectory.code(), 1, directory),
    ]);
    put_u4(&mut spliced, offsets[1] as usize + 4, offsets[0]);
    put_u4(&mut spliced, offsets[2] as usize, offsets[1]);
    let class_def = u4(&spliced, CLASS_DEFS_OFF_AT) as usize;
    put_u4(&mut spliced, class_def + CLASS_ANNOTATIONS_AT, offsets[2]);

    let mut back = DexFile::from_bytes(&spliced).unwrap();
    assert_eq!(back.raw_sections().count(), 3);
    // moves the data sections and renumbers every string
    back.get_or_create_string("AAAA, a string long enough to move the data sections").unwrap();
    back.sort_ids();
    let out = back.to_bytes().unwrap();
    let again = DexFile::from_bytes(&out).unwrap();

    let (_, def) = again.class_defs().iter().next().unwrap();
    let directory_at = def.annotations.get() as usize;
    assert_ne!(directory_at, offsets[2] as usize);
    let set_at = u4(&out, directory_at) as usize;
    assert_eq!(u4(&out, set_at), 1);
    let item_at = u4(&out, set_at + 4) as usize;
    let item = &out[item_at..item_at + 6];
    assert_eq!(item[0], 1);
    assert_eq!(again.types().get(item[1] as u32).and_then(|t| again.type_descriptor(t)).as_deref(), Some(GREETER));
    assert_eq!(string_at(&again, item[3]).as_deref(), Some("greeting"));
    assert_eq!(item[4], VALUE_STRING);
    assert_eq!(string_at(&again, item[5]).as_deref(), Some("Hello"));
    assert_ne!(item[5], hello);

    // a second write of the unchanged file is stable
    let mut third = DexFile::from_bytes(&out).unwrap();
    assert_eq!(third.to_bytes().unwrap(), out);
}

#[test]
fn unknown_map_entries_are_carried_or_rejected() {
    let mut dex = sample();
    let bytes = dex.to_bytes().unwrap();
    let (spliced, _) = splice_sections(&bytes, &[(0x7777, 1, vec![1, 2, 3, 4])]);

    let mut back = DexFile::from_bytes(&spliced).unwrap();
    let out = back.to_bytes().unwrap();
    let again = DexFile::from_bytes(&out).unwrap();
    let unknown: Vec<&[u8]> = again.raw_sections()
        .filter(|r| r.kind == SectionType::Unknown(0x7777))
        .map(|r| r.bytes())
        .collect();
    assert_eq!(unknown, vec![&[1u8, 2, 3, 4][..]]);

    let strict = ReadOptions { preserve_unknown: false, ..ReadOptions::default() };
    assert_eq!(DexFile::from_bytes_with(&spliced, &strict).unwrap_err().kind(), ErrorKind::UnsupportedFormat);
}
