//! Dex bytecode container.
//!
//! Reading visits the map list's sections in an order that satisfies forward
//! references, links every index and offset slot to the item it names, and
//! builds the key maps of the id pools. Writing refreshes those references,
//! lays the sections out again and recomputes the header, map list, checksum
//! and signature.

pub mod class;
pub mod code;
pub mod debug;
pub mod dex_file;
pub mod header;
pub mod ids;
pub mod insn;
pub mod key;
pub mod pool;
pub mod raw;
pub mod reference;
pub mod section;

pub use class::{AccessFlags, ClassDataItem, ClassDefItem, EncodedField, EncodedMethod};
pub use code::{CatchHandler, CodeItem, InsnReference, InsnTarget, TryItem};
pub use debug::{DebugElement, DebugInfo, DebugSequence, ElementData, ElementKind};
pub use dex_file::{DexFile, LayoutEntry};
pub use header::{Header, MapItem, MapList};
pub use ids::{DexString, FieldItem, IdSections, MethodItem, ProtoItem, StringItem, TypeItem, TypeList};
pub use key::{FieldKey, MethodKey, ProtoKey};
pub use pool::IdPool;
pub use raw::{RawOffset, RawSection};
pub use reference::{IndexReference, OffsetReference, NO_INDEX};
pub use section::{Id, Section, SectionType};
