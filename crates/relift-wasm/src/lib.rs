//! WebAssembly assembly of resolved chunks.
//!
//! Each chunk becomes a self-contained module that imports linear memory, one mutable `i32`
//! global per architectural register, and the runtime's system hooks, and exports a single
//! `entry` function. Architecture-specific lowering lives behind [`Architecture`]; [`X86`] is the
//! only implementation.

pub mod abi;
pub mod arch;
pub mod assembler;
pub mod dispatch;
pub mod emitter;
/// wasmi host for running assembled chunks, shared by this workspace's tests.
#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use abi::{CpuState, Flags};
pub use arch::{x86::X86, Architecture};
pub use assembler::{assemble, AssembleError, AssembleOptions, AssembledChunk, FunctionImport};
pub use emitter::Emitter;
