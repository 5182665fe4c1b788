//! Architecture hooks used by the assembler.
//!
//! The assembler owns module layout, the dispatch loop, and control transfer. Everything that
//! depends on the guest ISA (register file, operand kinds beyond plain registers and immediates,
//! status flags, and most instruction semantics) goes through [`Architecture`].

pub mod x86;

use relift_x86::{Instruction, Operand};

use crate::assembler::AssembleError;
use crate::emitter::Emitter;

pub trait Architecture {
    /// Register globals in import order. Indices into this list are the operand register indices.
    fn registers(&self) -> &[&'static str];

    /// Segment globals in import order.
    fn segments(&self) -> &[&'static str];

    /// Index of the stack pointer in [`Architecture::registers`].
    fn stack_pointer(&self) -> u32;

    /// Emitted before the instruction body, e.g. pushing a return address before a call.
    fn preprocess(&self, e: &mut Emitter, inst: &Instruction) -> Result<(), AssembleError>;

    /// Emitted after the instruction body. Flag updates read the result from `registers.t1` and
    /// the staged sources from [`crate::emitter::locals`].
    fn postprocess(&self, e: &mut Emitter, inst: &Instruction) -> Result<(), AssembleError>;

    /// Push the value of an operand kind the assembler does not handle itself.
    /// Returns `Ok(false)` when the kind is unknown to the architecture too.
    fn operand_to_stack(&self, e: &mut Emitter, op: &Operand) -> Result<bool, AssembleError>;

    /// Pop the top of the stack into an operand kind the assembler does not handle itself.
    fn stack_to_operand(&self, e: &mut Emitter, op: &Operand) -> Result<bool, AssembleError>;

    /// Push the effective address of a memory operand kind the assembler does not handle itself.
    fn operand_address(&self, e: &mut Emitter, op: &Operand) -> Result<bool, AssembleError>;

    /// Push the `i32` condition of a conditional instruction.
    fn flag_test(&self, e: &mut Emitter, inst: &Instruction) -> Result<(), AssembleError>;

    /// Lower an instruction the assembler has no generic lowering for.
    /// Returns `Ok(false)` when the mnemonic is unsupported.
    fn build_instruction(&self, e: &mut Emitter, inst: &Instruction)
        -> Result<bool, AssembleError>;
}
