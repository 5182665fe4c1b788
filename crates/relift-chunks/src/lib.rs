//! Chunk discovery and reference fixup.
//!
//! - [`image`]: the normalized loader output (byte buffer, section map, import table).
//! - [`program`]: [`Chunk`] and [`Program`], the chunk set shared by discovery, fixup and assembly.
//! - [`builder`]: control-flow-directed partitioning of the code into chunks.
//! - [`fixup`]: rewrites every branch/call operand into a resolved target kind.

pub mod builder;
pub mod fixup;
pub mod image;
pub mod program;

pub use builder::{discover, DiscoveryError, DiscoveryLimits};
pub use fixup::{fixup, FixupError};
pub use image::{Image, ImportEntry, ImportModule, ImportTable, Section};
pub use program::{chunk_name, AddrRange, Chunk, Program};
