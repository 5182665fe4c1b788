//! Static recompiler from normalized 32-bit x86 images to WebAssembly.
//!
//! The work is split across the workspace crates:
//!
//! - [`x86`]: the instruction decoder and canonical instruction model;
//! - [`chunks`]: chunk discovery and reference fixup;
//! - [`wasm`]: per-chunk module assembly and the runtime ABI.
//!
//! [`Recompiler`] drives them in order for one [`chunks::Image`].

pub mod error;
pub mod options;
pub mod pipeline;

pub use error::RecompileError;
pub use options::RecompileOptions;
pub use pipeline::{Recompiled, Recompiler};

pub use relift_chunks as chunks;
pub use relift_wasm as wasm;
pub use relift_x86 as x86;
