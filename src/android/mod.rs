//! Android compiled resource tables.
//!
//! A table is read into a [`BlockTree`](crate::block::BlockTree) of chunks.
//! Pools and package headers are modelled; every other chunk is carried as
//! opaque bytes and written back unchanged.

pub mod chunk;
pub mod entry;
pub mod package;
pub mod string_pool;
pub mod table;

pub use chunk::{ChunkHeader, ChunkType};
pub use package::{PackageBlock, PoolSlot};
pub use string_pool::{PoolFlags, StringPool};
pub use table::TableBlock;
