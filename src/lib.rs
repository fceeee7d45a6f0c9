//! # Android blocks
//!
//! A library for structurally editing Android binary containers: compiled
//! resource tables (`resources.arsc`) and dex bytecode files.
//!
//! Both formats are modelled as trees of blocks. Editing a block marks the
//! tree dirty; `refresh` recomputes sizes, counts, offsets and alignment so
//! the written bytes are self-consistent, and indexes held by references are
//! re-read from their targets.
//!
//! ```no_run
//!  use android_blocks::dex::DexFile;
//!
//!  let mut dex = DexFile::from_file("classes.dex").unwrap();
//!  let hello = dex.get_or_create_string("Hello").unwrap();
//!  dex.rename_string(hello, "Goodbye").unwrap();
//!  dex.write_to_file("classes.dex").unwrap();
//! ```

#[macro_use]
pub mod error;

pub mod android;
pub mod block;
pub mod config;
pub mod dex;

#[cfg(test)]
mod tests;

pub use config::{ReadOptions, WriteOptions};
pub use error::{DexError, DexResult, ErrorKind};
