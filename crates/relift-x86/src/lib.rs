//! IA-32 front end for the relift recompiler.
//!
//! - [`inst`]: the canonical operand/instruction model shared by every later pass.
//! - [`opcode_tables`]: the data-driven opcode table, keyed by `(opcode, ModRM.reg)`.
//! - [`decoder`]: turns a byte slice into [`Instruction`] values.
//!
//! Only 32-bit protected-mode encodings are understood. The address-size override is recorded in
//! the prefix set but does not switch to 16-bit addressing.

pub mod decoder;
pub mod inst;
pub mod opcode_tables;

pub use decoder::{decode, DecodeError, MAX_INST_LEN};
pub use inst::{
    reg, Cond, Instruction, Mnemonic, Operand, OperandSize, Prefixes, ResolvedTarget,
    PROGRAM_MODULE_ID,
};
