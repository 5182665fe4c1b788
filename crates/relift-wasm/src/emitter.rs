//! Instruction emission helpers shared by the assembler and the architecture lowerings.

use relift_x86::{Mnemonic, Operand, OperandSize};
use wasm_encoder::{BlockType, Function, Instruction, MemArg, ValType};

use crate::abi::{
    IMPORT_DEBUGGER, IMPORT_INDIRECT_DISPATCH, IMPORT_INTERRUPT, SCRATCH_GLOBALS, SYSTEM_MODULE,
};
use crate::arch::Architecture;
use crate::assembler::{AssembleError, FunctionImport};

/// Function locals. All are `i32` except [`WIDE`].
pub mod locals {
    /// First source operand of the current instruction, masked to its width.
    pub const LHS: u32 = 0;
    /// Second source operand of the current instruction, masked to its width.
    pub const RHS: u32 = 1;
    /// Value being written by a store.
    pub const VALUE: u32 = 2;
    /// String-instruction step and other per-instruction temporaries.
    pub const TMP: u32 = 3;
    /// 64-bit products and dividends.
    pub const WIDE: u32 = 4;

    pub(crate) const I32_COUNT: u32 = 4;
}

/// Runtime hooks every module imports, in import order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemFunc {
    Debugger,
    IndirectDispatch,
    Interrupt,
}

impl SystemFunc {
    pub const ALL: [SystemFunc; 3] = [
        SystemFunc::Debugger,
        SystemFunc::IndirectDispatch,
        SystemFunc::Interrupt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SystemFunc::Debugger => IMPORT_DEBUGGER,
            SystemFunc::IndirectDispatch => IMPORT_INDIRECT_DISPATCH,
            SystemFunc::Interrupt => IMPORT_INTERRUPT,
        }
    }

    fn index(self) -> u32 {
        self as u32
    }
}

/// Global indices of the imported register, scratch and segment slots.
#[derive(Debug, Clone, Copy)]
pub struct GlobalLayout {
    registers: u32,
    segments: u32,
}

impl GlobalLayout {
    pub fn new(registers: usize, segments: usize) -> Self {
        Self {
            registers: registers as u32,
            segments: segments as u32,
        }
    }

    pub fn register(&self, index: u32) -> u32 {
        debug_assert!(index < self.registers);
        index
    }

    pub fn link(&self) -> u32 {
        self.registers
    }

    pub fn t1(&self) -> u32 {
        self.registers + 1
    }

    pub fn t2(&self) -> u32 {
        self.registers + 2
    }

    pub fn segment(&self, index: u32) -> u32 {
        debug_assert!(index < self.segments);
        self.registers + SCRATCH_GLOBALS.len() as u32 + index
    }
}

fn memarg(size: OperandSize) -> MemArg {
    MemArg {
        offset: 0,
        align: size.bytes().trailing_zeros(),
        memory_index: 0,
    }
}

/// Wraps the function body being built and tracks structured-control nesting.
pub struct Emitter {
    pub func: Function,
    pub globals: GlobalLayout,
    /// Chunk and external functions imported after the system hooks, in first-use order.
    imports: Vec<FunctionImport>,
    /// Number of `block`/`loop`/`if` constructs currently open.
    depth: u32,
    current: Option<(Mnemonic, u32)>,
}

impl Emitter {
    pub fn new(globals: GlobalLayout) -> Self {
        Self {
            func: Function::new(vec![
                (locals::I32_COUNT, ValType::I32),
                (1, ValType::I64),
            ]),
            globals,
            imports: Vec::new(),
            depth: 0,
            current: None,
        }
    }

    pub fn finish(mut self) -> (Function, Vec<FunctionImport>) {
        self.func.instruction(&Instruction::End);
        (self.func, self.imports)
    }

    /// Record the instruction being lowered so failures can name it.
    pub fn begin_instruction(&mut self, mnemonic: Mnemonic, address: u32) {
        self.current = Some((mnemonic, address));
    }

    pub fn unsupported(&self) -> AssembleError {
        let (mnemonic, address) = self.current.unwrap_or((Mnemonic::Nop, 0));
        AssembleError::UnsupportedInstruction { mnemonic, address }
    }

    pub fn i32_const(&mut self, value: i32) {
        self.func.instruction(&Instruction::I32Const(value));
    }

    pub fn u32_const(&mut self, value: u32) {
        self.i32_const(value as i32);
    }

    pub fn local_get(&mut self, local: u32) {
        self.func.instruction(&Instruction::LocalGet(local));
    }

    pub fn local_set(&mut self, local: u32) {
        self.func.instruction(&Instruction::LocalSet(local));
    }

    pub fn global_get(&mut self, global: u32) {
        self.func.instruction(&Instruction::GlobalGet(global));
    }

    pub fn global_set(&mut self, global: u32) {
        self.func.instruction(&Instruction::GlobalSet(global));
    }

    /// `i32.and` with the width mask; a no-op for 32-bit values.
    pub fn mask(&mut self, size: OperandSize) {
        if size.mask() != u32::MAX {
            self.u32_const(size.mask());
            self.func.instruction(&Instruction::I32And);
        }
    }

    /// Sign-extend a masked value of `size` to 32 bits.
    pub fn sign_extend(&mut self, size: OperandSize) {
        match size {
            OperandSize::Bits8 => {
                self.func.instruction(&Instruction::I32Extend8S);
            }
            OperandSize::Bits16 => {
                self.func.instruction(&Instruction::I32Extend16S);
            }
            OperandSize::Bits32 | OperandSize::Bits128 => {}
        }
    }

    /// `[addr] -> [value]`, zero-extended.
    pub fn load(&mut self, size: OperandSize) -> Result<(), AssembleError> {
        let arg = memarg(size);
        match size {
            OperandSize::Bits8 => self.func.instruction(&Instruction::I32Load8U(arg)),
            OperandSize::Bits16 => self.func.instruction(&Instruction::I32Load16U(arg)),
            OperandSize::Bits32 => self.func.instruction(&Instruction::I32Load(arg)),
            OperandSize::Bits128 => return Err(self.unsupported()),
        };
        Ok(())
    }

    /// `[addr, value] -> []`.
    pub fn store(&mut self, size: OperandSize) -> Result<(), AssembleError> {
        let arg = memarg(size);
        match size {
            OperandSize::Bits8 => self.func.instruction(&Instruction::I32Store8(arg)),
            OperandSize::Bits16 => self.func.instruction(&Instruction::I32Store16(arg)),
            OperandSize::Bits32 => self.func.instruction(&Instruction::I32Store(arg)),
            OperandSize::Bits128 => return Err(self.unsupported()),
        };
        Ok(())
    }

    /// `global += delta`.
    pub fn global_add(&mut self, global: u32, delta: i32) {
        self.global_get(global);
        self.i32_const(delta);
        self.func.instruction(&Instruction::I32Add);
        self.global_set(global);
    }

    /// Open a `block` and return its nesting level.
    pub fn block(&mut self) -> u32 {
        self.func.instruction(&Instruction::Block(BlockType::Empty));
        self.open()
    }

    /// Open a `loop` and return its nesting level.
    pub fn loop_(&mut self) -> u32 {
        self.func.instruction(&Instruction::Loop(BlockType::Empty));
        self.open()
    }

    /// Open an `if` on the condition at the top of the stack.
    pub fn if_(&mut self) -> u32 {
        self.func.instruction(&Instruction::If(BlockType::Empty));
        self.open()
    }

    pub fn else_(&mut self) {
        self.func.instruction(&Instruction::Else);
    }

    pub fn end(&mut self) {
        debug_assert!(self.depth > 0, "unbalanced end");
        self.depth -= 1;
        self.func.instruction(&Instruction::End);
    }

    fn open(&mut self) -> u32 {
        let level = self.depth;
        self.depth += 1;
        level
    }

    fn relative(&self, level: u32) -> u32 {
        debug_assert!(level < self.depth, "branch to a closed construct");
        self.depth - 1 - level
    }

    /// Branch to the construct opened at `level`.
    pub fn br(&mut self, level: u32) {
        let relative = self.relative(level);
        self.func.instruction(&Instruction::Br(relative));
    }

    pub fn br_if(&mut self, level: u32) {
        let relative = self.relative(level);
        self.func.instruction(&Instruction::BrIf(relative));
    }

    pub fn ret(&mut self) {
        self.func.instruction(&Instruction::Return);
    }

    pub fn call_system(&mut self, func: SystemFunc) {
        self.func.instruction(&Instruction::Call(func.index()));
    }

    /// Call an imported function, registering the import on first use.
    pub fn call_import(&mut self, module: &str, name: &str) {
        let position = match self
            .imports
            .iter()
            .position(|i| i.module == module && i.name == name)
        {
            Some(position) => position,
            None => {
                self.imports.push(FunctionImport {
                    module: module.to_string(),
                    name: name.to_string(),
                });
                self.imports.len() - 1
            }
        };
        let index = SystemFunc::ALL.len() as u32 + position as u32;
        self.func.instruction(&Instruction::Call(index));
    }

    /// Push the value of `op`, zero-extended to 32 bits.
    pub fn load_operand<A: Architecture + ?Sized>(
        &mut self,
        arch: &A,
        op: &Operand,
    ) -> Result<(), AssembleError> {
        match op {
            Operand::Register {
                index,
                size: OperandSize::Bits32,
                indirect: false,
                ..
            } => {
                let global = self.globals.register(u32::from(*index));
                self.global_get(global);
                Ok(())
            }
            Operand::Immediate {
                value,
                size,
                indirect: false,
                ..
            } => {
                self.u32_const((*value as u32) & size.mask());
                Ok(())
            }
            Operand::Register {
                size,
                indirect: true,
                ..
            }
            | Operand::Immediate {
                size,
                indirect: true,
                ..
            } => {
                self.address_of(arch, op)?;
                self.load(*size)
            }
            _ => {
                if arch.operand_to_stack(self, op)? {
                    Ok(())
                } else {
                    Err(self.unsupported())
                }
            }
        }
    }

    /// Pop the value at the top of the stack into `op`.
    pub fn store_operand<A: Architecture + ?Sized>(
        &mut self,
        arch: &A,
        op: &Operand,
    ) -> Result<(), AssembleError> {
        match op {
            Operand::Register {
                index,
                size: OperandSize::Bits32,
                indirect: false,
                ..
            } => {
                let global = self.globals.register(u32::from(*index));
                self.global_set(global);
                Ok(())
            }
            Operand::Register {
                size,
                indirect: true,
                ..
            }
            | Operand::Immediate {
                size,
                indirect: true,
                ..
            } => {
                self.local_set(locals::VALUE);
                self.address_of(arch, op)?;
                self.local_get(locals::VALUE);
                self.store(*size)
            }
            _ => {
                if arch.stack_to_operand(self, op)? {
                    Ok(())
                } else {
                    Err(self.unsupported())
                }
            }
        }
    }

    /// Push the effective address of a memory operand.
    pub fn address_of<A: Architecture + ?Sized>(
        &mut self,
        arch: &A,
        op: &Operand,
    ) -> Result<(), AssembleError> {
        match op {
            Operand::Register {
                index,
                indirect: true,
                displacement,
                ..
            } => {
                let global = self.globals.register(u32::from(*index));
                self.global_get(global);
                if let Some(disp) = displacement {
                    self.i32_const(*disp);
                    self.func.instruction(&Instruction::I32Add);
                }
                Ok(())
            }
            Operand::Immediate {
                value,
                indirect: true,
                displacement,
                ..
            } => {
                self.u32_const((*value as u32).wrapping_add(displacement.unwrap_or(0) as u32));
                Ok(())
            }
            _ => {
                if arch.operand_address(self, op)? {
                    Ok(())
                } else {
                    Err(self.unsupported())
                }
            }
        }
    }
}
