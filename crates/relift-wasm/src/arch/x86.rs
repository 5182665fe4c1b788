//! 32-bit x86 lowering.
//!
//! Registers live in `i32` globals named after [`X86_REGISTERS`]; each status flag is its own
//! global holding 0 or 1. Arithmetic instructions stage their sources in [`locals::LHS`] and
//! [`locals::RHS`] and leave the masked result in `registers.t1`, which is where
//! [`Architecture::postprocess`] picks them up to compute flags.

use relift_x86::{
    reg, Cond, Instruction as X86Instruction, Mnemonic, Operand, OperandSize, Prefixes,
};
use tracing::warn;
use wasm_encoder::Instruction;

use super::Architecture;
use crate::abi::{Flags, X86_REGISTERS};
use crate::assembler::AssembleError;
use crate::emitter::{locals, Emitter, SystemFunc};

/// Index of the first flag global in [`X86_REGISTERS`].
const FLAG_BASE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    Cf = 0,
    Pf,
    Af,
    Zf,
    Sf,
    Df,
    Of,
}

impl Flag {
    const ALL: [Flag; 7] = [
        Flag::Cf,
        Flag::Pf,
        Flag::Af,
        Flag::Zf,
        Flag::Sf,
        Flag::Df,
        Flag::Of,
    ];

    fn global(self, e: &Emitter) -> u32 {
        e.globals.register(FLAG_BASE + self as u32)
    }

    fn eflags_bit(self) -> u32 {
        Flags::GLOBAL_ORDER[self as usize].bits().trailing_zeros()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagOp {
    Add { carry_in: bool, writes_cf: bool },
    Sub { borrow_in: bool, writes_cf: bool },
    Logic,
    Shift(Mnemonic),
    SignedMul,
    UnsignedMul,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct X86;

impl X86 {
    fn gpr(&self, e: &Emitter, index: u8) -> u32 {
        e.globals.register(u32::from(index & 7))
    }

    fn esp(&self, e: &Emitter) -> u32 {
        e.globals.register(self.stack_pointer())
    }

    fn get_flag(&self, e: &mut Emitter, flag: Flag) {
        let global = flag.global(e);
        e.global_get(global);
    }

    fn set_flag(&self, e: &mut Emitter, flag: Flag, emit_value: impl FnOnce(&mut Emitter)) {
        emit_value(e);
        let global = flag.global(e);
        e.global_set(global);
    }

    fn set_flag_const(&self, e: &mut Emitter, flag: Flag, value: bool) {
        self.set_flag(e, flag, |e| e.i32_const(i32::from(value)));
    }

    /// `[value] -> [(value >> bit) & 1]`.
    fn emit_bit(e: &mut Emitter, bit: u32) {
        if bit != 0 {
            e.u32_const(bit);
            e.func.instruction(&Instruction::I32ShrU);
        }
        e.i32_const(1);
        e.func.instruction(&Instruction::I32And);
    }

    fn emit_parity_even(e: &mut Emitter) {
        let t1 = e.globals.t1();
        e.global_get(t1);
        e.u32_const(0xff);
        e.func.instruction(&Instruction::I32And);
        e.func.instruction(&Instruction::I32Popcnt);
        e.i32_const(1);
        e.func.instruction(&Instruction::I32And);
        e.func.instruction(&Instruction::I32Eqz);
    }

    /// ZF, SF and PF from the masked result in `t1`.
    fn emit_result_flags(&self, e: &mut Emitter, size: OperandSize) {
        let t1 = e.globals.t1();
        self.set_flag(e, Flag::Zf, |e| {
            e.global_get(t1);
            e.func.instruction(&Instruction::I32Eqz);
        });
        self.set_flag(e, Flag::Sf, |e| {
            e.global_get(t1);
            Self::emit_bit(e, size.bits() - 1);
        });
        self.set_flag(e, Flag::Pf, Self::emit_parity_even);
    }

    fn emit_aux_carry(&self, e: &mut Emitter) {
        let t1 = e.globals.t1();
        self.set_flag(e, Flag::Af, |e| {
            e.local_get(locals::LHS);
            e.local_get(locals::RHS);
            e.func.instruction(&Instruction::I32Xor);
            e.global_get(t1);
            e.func.instruction(&Instruction::I32Xor);
            Self::emit_bit(e, 4);
        });
    }

    fn emit_add_flags(&self, e: &mut Emitter, size: OperandSize, carry_in: bool, writes_cf: bool) {
        let t1 = e.globals.t1();
        if writes_cf {
            self.set_flag(e, Flag::Cf, |e| {
                // The carry out of `size` bits, including the incoming carry for ADC.
                e.local_get(locals::LHS);
                e.func.instruction(&Instruction::I64ExtendI32U);
                e.local_get(locals::RHS);
                e.func.instruction(&Instruction::I64ExtendI32U);
                e.func.instruction(&Instruction::I64Add);
                if carry_in {
                    let cf = Flag::Cf.global(e);
                    e.global_get(cf);
                    e.func.instruction(&Instruction::I64ExtendI32U);
                    e.func.instruction(&Instruction::I64Add);
                }
                e.func.instruction(&Instruction::I64Const(i64::from(size.bits())));
                e.func.instruction(&Instruction::I64ShrU);
                e.func.instruction(&Instruction::I64Const(0));
                e.func.instruction(&Instruction::I64Ne);
            });
        }
        self.set_flag(e, Flag::Of, |e| {
            // ((a ^ r) & (b ^ r)) at the sign bit.
            e.local_get(locals::LHS);
            e.global_get(t1);
            e.func.instruction(&Instruction::I32Xor);
            e.local_get(locals::RHS);
            e.global_get(t1);
            e.func.instruction(&Instruction::I32Xor);
            e.func.instruction(&Instruction::I32And);
            Self::emit_bit(e, size.bits() - 1);
        });
        self.emit_aux_carry(e);
        self.emit_result_flags(e, size);
    }

    fn emit_sub_flags(&self, e: &mut Emitter, size: OperandSize, borrow_in: bool, writes_cf: bool) {
        let t1 = e.globals.t1();
        if writes_cf {
            self.set_flag(e, Flag::Cf, |e| {
                if borrow_in {
                    // a <u b + CF, in 64 bits so the sum cannot wrap.
                    e.local_get(locals::LHS);
                    e.func.instruction(&Instruction::I64ExtendI32U);
                    e.local_get(locals::RHS);
                    e.func.instruction(&Instruction::I64ExtendI32U);
                    let cf = Flag::Cf.global(e);
                    e.global_get(cf);
                    e.func.instruction(&Instruction::I64ExtendI32U);
                    e.func.instruction(&Instruction::I64Add);
                    e.func.instruction(&Instruction::I64LtU);
                } else {
                    e.local_get(locals::LHS);
                    e.local_get(locals::RHS);
                    e.func.instruction(&Instruction::I32LtU);
                }
            });
        }
        self.set_flag(e, Flag::Of, |e| {
            // ((a ^ b) & (a ^ r)) at the sign bit.
            e.local_get(locals::LHS);
            e.local_get(locals::RHS);
            e.func.instruction(&Instruction::I32Xor);
            e.local_get(locals::LHS);
            e.global_get(t1);
            e.func.instruction(&Instruction::I32Xor);
            e.func.instruction(&Instruction::I32And);
            Self::emit_bit(e, size.bits() - 1);
        });
        self.emit_aux_carry(e);
        self.emit_result_flags(e, size);
    }

    fn emit_logic_flags(&self, e: &mut Emitter, size: OperandSize) {
        self.set_flag_const(e, Flag::Cf, false);
        self.set_flag_const(e, Flag::Of, false);
        self.set_flag_const(e, Flag::Af, false);
        self.emit_result_flags(e, size);
    }

    /// Flags are left untouched when the masked count in `RHS` is zero. AF is left as-is.
    fn emit_shift_flags(&self, e: &mut Emitter, op: Mnemonic, size: OperandSize) {
        let t1 = e.globals.t1();
        let skip = e.block();
        e.local_get(locals::RHS);
        e.func.instruction(&Instruction::I32Eqz);
        e.br_if(skip);

        match op {
            Mnemonic::Shl => {
                self.set_flag(e, Flag::Cf, |e| {
                    // Bit `size` of the unmasked 64-bit shift is the last bit out.
                    e.local_get(locals::LHS);
                    e.func.instruction(&Instruction::I64ExtendI32U);
                    e.local_get(locals::RHS);
                    e.func.instruction(&Instruction::I64ExtendI32U);
                    e.func.instruction(&Instruction::I64Shl);
                    e.func.instruction(&Instruction::I64Const(i64::from(size.bits())));
                    e.func.instruction(&Instruction::I64ShrU);
                    e.func.instruction(&Instruction::I32WrapI64);
                    e.i32_const(1);
                    e.func.instruction(&Instruction::I32And);
                });
                self.set_flag(e, Flag::Of, |e| {
                    e.global_get(t1);
                    Self::emit_bit(e, size.bits() - 1);
                    let cf = Flag::Cf.global(e);
                    e.global_get(cf);
                    e.func.instruction(&Instruction::I32Xor);
                });
            }
            Mnemonic::Shr | Mnemonic::Sar => {
                self.set_flag(e, Flag::Cf, |e| {
                    e.local_get(locals::LHS);
                    if op == Mnemonic::Sar {
                        e.sign_extend(size);
                    }
                    e.local_get(locals::RHS);
                    e.i32_const(1);
                    e.func.instruction(&Instruction::I32Sub);
                    if op == Mnemonic::Sar {
                        e.func.instruction(&Instruction::I32ShrS);
                    } else {
                        e.func.instruction(&Instruction::I32ShrU);
                    }
                    e.i32_const(1);
                    e.func.instruction(&Instruction::I32And);
                });
                if op == Mnemonic::Sar {
                    self.set_flag_const(e, Flag::Of, false);
                } else {
                    self.set_flag(e, Flag::Of, |e| {
                        e.local_get(locals::LHS);
                        Self::emit_bit(e, size.bits() - 1);
                    });
                }
            }
            _ => {}
        }
        self.emit_result_flags(e, size);
        e.end();
    }

    /// CF = OF = the product in `WIDE` does not fit `size` bits.
    fn emit_mul_flags(&self, e: &mut Emitter, size: OperandSize, signed: bool) {
        self.set_flag(e, Flag::Cf, |e| {
            e.local_get(locals::WIDE);
            if signed {
                e.local_get(locals::WIDE);
                e.func.instruction(&Instruction::I32WrapI64);
                e.sign_extend(size);
                e.func.instruction(&Instruction::I64ExtendI32S);
                e.func.instruction(&Instruction::I64Ne);
            } else {
                e.func.instruction(&Instruction::I64Const(i64::from(size.bits())));
                e.func.instruction(&Instruction::I64ShrU);
                e.func.instruction(&Instruction::I64Const(0));
                e.func.instruction(&Instruction::I64Ne);
            }
        });
        let cf = Flag::Cf.global(e);
        self.set_flag(e, Flag::Of, |e| e.global_get(cf));
    }

    fn flag_op(inst: &X86Instruction) -> Option<FlagOp> {
        Some(match inst.mnemonic {
            Mnemonic::Add => FlagOp::Add {
                carry_in: false,
                writes_cf: true,
            },
            Mnemonic::Adc => FlagOp::Add {
                carry_in: true,
                writes_cf: true,
            },
            Mnemonic::Inc => FlagOp::Add {
                carry_in: false,
                writes_cf: false,
            },
            Mnemonic::Sub | Mnemonic::Cmp | Mnemonic::Neg | Mnemonic::Cmpxchg => FlagOp::Sub {
                borrow_in: false,
                writes_cf: true,
            },
            Mnemonic::Sbb => FlagOp::Sub {
                borrow_in: true,
                writes_cf: true,
            },
            Mnemonic::Dec => FlagOp::Sub {
                borrow_in: false,
                writes_cf: false,
            },
            Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Test => FlagOp::Logic,
            m @ (Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar) => FlagOp::Shift(m),
            Mnemonic::Imul => FlagOp::SignedMul,
            Mnemonic::Mul => FlagOp::UnsignedMul,
            _ => return None,
        })
    }

    /// Push a 32-bit constant such as a return address.
    fn push_const(&self, e: &mut Emitter, value: u32) -> Result<(), AssembleError> {
        e.u32_const(value);
        self.push(e, OperandSize::Bits32)
    }

    /// `[value] -> []`: `esp -= size; [esp] = value`.
    fn push(&self, e: &mut Emitter, size: OperandSize) -> Result<(), AssembleError> {
        let esp = self.esp(e);
        e.local_set(locals::TMP);
        e.global_add(esp, -(size.bytes() as i32));
        e.global_get(esp);
        e.local_get(locals::TMP);
        e.store(size)
    }

    /// `[] -> [value]`: `value = [esp]; esp += size`.
    fn pop(&self, e: &mut Emitter, size: OperandSize) -> Result<(), AssembleError> {
        let esp = self.esp(e);
        e.global_get(esp);
        e.load(size)?;
        e.global_add(esp, size.bytes() as i32);
        Ok(())
    }

    fn store_reg(
        &self,
        e: &mut Emitter,
        index: u8,
        size: OperandSize,
    ) -> Result<(), AssembleError> {
        e.store_operand(self, &Operand::reg(index, size))
    }

    fn load_reg(&self, e: &mut Emitter, index: u8, size: OperandSize) -> Result<(), AssembleError> {
        e.load_operand(self, &Operand::reg(index, size))
    }

    /// Write the masked result back to `t1` and, when given, to the destination.
    fn finish_result(
        &self,
        e: &mut Emitter,
        dst: Option<&Operand>,
        size: OperandSize,
    ) -> Result<(), AssembleError> {
        let t1 = e.globals.t1();
        e.mask(size);
        e.global_set(t1);
        if let Some(dst) = dst {
            e.global_get(t1);
            e.store_operand(self, dst)?;
        }
        Ok(())
    }

    fn stage(&self, e: &mut Emitter, lhs: &Operand, rhs: &Operand) -> Result<(), AssembleError> {
        e.load_operand(self, lhs)?;
        e.local_set(locals::LHS);
        e.load_operand(self, rhs)?;
        e.local_set(locals::RHS);
        Ok(())
    }

    fn build_binary(&self, e: &mut Emitter, inst: &X86Instruction) -> Result<(), AssembleError> {
        let (dst, lhs, rhs) = match inst.operands.as_slice() {
            [dst, lhs, rhs] => (Some(dst), lhs, rhs),
            [lhs, rhs] => (None, lhs, rhs),
            _ => return Err(e.unsupported()),
        };
        let size = operand_size(e, lhs)?;
        self.stage(e, lhs, rhs)?;

        e.local_get(locals::LHS);
        e.local_get(locals::RHS);
        match inst.mnemonic {
            Mnemonic::Add => e.func.instruction(&Instruction::I32Add),
            Mnemonic::Adc => {
                e.func.instruction(&Instruction::I32Add);
                self.get_flag(e, Flag::Cf);
                e.func.instruction(&Instruction::I32Add)
            }
            Mnemonic::Sub | Mnemonic::Cmp => e.func.instruction(&Instruction::I32Sub),
            Mnemonic::Sbb => {
                e.func.instruction(&Instruction::I32Sub);
                self.get_flag(e, Flag::Cf);
                e.func.instruction(&Instruction::I32Sub)
            }
            Mnemonic::And | Mnemonic::Test => e.func.instruction(&Instruction::I32And),
            Mnemonic::Or => e.func.instruction(&Instruction::I32Or),
            Mnemonic::Xor => e.func.instruction(&Instruction::I32Xor),
            _ => return Err(e.unsupported()),
        };

        let writes = !matches!(inst.mnemonic, Mnemonic::Cmp | Mnemonic::Test);
        self.finish_result(e, dst.filter(|_| writes), size)
    }

    /// INC, DEC, NEG and NOT on a single read-modify-write operand.
    fn build_unary(&self, e: &mut Emitter, inst: &X86Instruction) -> Result<(), AssembleError> {
        let [dst] = inst.operands.as_slice() else {
            return Err(e.unsupported());
        };
        let size = operand_size(e, dst)?;
        match inst.mnemonic {
            Mnemonic::Inc | Mnemonic::Dec => {
                e.load_operand(self, dst)?;
                e.local_set(locals::LHS);
                e.i32_const(1);
                e.local_set(locals::RHS);
            }
            Mnemonic::Neg => {
                e.i32_const(0);
                e.local_set(locals::LHS);
                e.load_operand(self, dst)?;
                e.local_set(locals::RHS);
            }
            Mnemonic::Not => {
                e.load_operand(self, dst)?;
                e.i32_const(-1);
                e.func.instruction(&Instruction::I32Xor);
                e.mask(size);
                return e.store_operand(self, dst);
            }
            _ => return Err(e.unsupported()),
        }
        e.local_get(locals::LHS);
        e.local_get(locals::RHS);
        if inst.mnemonic == Mnemonic::Inc {
            e.func.instruction(&Instruction::I32Add);
        } else {
            e.func.instruction(&Instruction::I32Sub);
        }
        self.finish_result(e, Some(dst), size)
    }

    fn build_shift(&self, e: &mut Emitter, inst: &X86Instruction) -> Result<(), AssembleError> {
        let [dst, lhs, count] = inst.operands.as_slice() else {
            return Err(e.unsupported());
        };
        let size = operand_size(e, lhs)?;
        e.load_operand(self, lhs)?;
        e.local_set(locals::LHS);
        e.load_operand(self, count)?;
        e.i32_const(31);
        e.func.instruction(&Instruction::I32And);
        e.local_set(locals::RHS);

        e.local_get(locals::LHS);
        match inst.mnemonic {
            Mnemonic::Shl => {
                e.local_get(locals::RHS);
                e.func.instruction(&Instruction::I32Shl);
            }
            Mnemonic::Shr => {
                e.local_get(locals::RHS);
                e.func.instruction(&Instruction::I32ShrU);
            }
            Mnemonic::Sar => {
                e.sign_extend(size);
                e.local_get(locals::RHS);
                e.func.instruction(&Instruction::I32ShrS);
            }
            _ => return Err(e.unsupported()),
        }
        self.finish_result(e, Some(dst), size)
    }

    /// Push `ext64(value)` for the value at the top of the stack.
    fn extend_wide(e: &mut Emitter, size: OperandSize, signed: bool) {
        if signed {
            e.sign_extend(size);
            e.func.instruction(&Instruction::I64ExtendI32S);
        } else {
            e.func.instruction(&Instruction::I64ExtendI32U);
        }
    }

    fn build_multiply(&self, e: &mut Emitter, inst: &X86Instruction) -> Result<(), AssembleError> {
        let signed = inst.mnemonic == Mnemonic::Imul;
        match inst.operands.as_slice() {
            [dst, lhs, rhs] if signed => {
                let size = operand_size(e, dst)?;
                self.stage(e, lhs, rhs)?;
                self.emit_wide_product(e, size, signed);
                e.local_get(locals::WIDE);
                e.func.instruction(&Instruction::I32WrapI64);
                self.finish_result(e, Some(dst), size)
            }
            [src] => {
                let size = operand_size(e, src)?;
                self.stage(e, &Operand::reg(reg::EAX, size), src)?;
                self.emit_wide_product(e, size, signed);

                e.local_get(locals::WIDE);
                e.func.instruction(&Instruction::I32WrapI64);
                let t1 = e.globals.t1();
                e.mask(size);
                e.global_set(t1);

                if size == OperandSize::Bits8 {
                    // AX = AL * r/m8
                    e.local_get(locals::WIDE);
                    e.func.instruction(&Instruction::I32WrapI64);
                    e.u32_const(0xffff);
                    e.func.instruction(&Instruction::I32And);
                    return self.store_reg(e, reg::EAX, OperandSize::Bits16);
                }
                e.global_get(t1);
                self.store_reg(e, reg::EAX, size)?;
                e.local_get(locals::WIDE);
                e.func.instruction(&Instruction::I64Const(i64::from(size.bits())));
                e.func.instruction(&Instruction::I64ShrU);
                e.func.instruction(&Instruction::I32WrapI64);
                e.mask(size);
                self.store_reg(e, reg::EDX, size)
            }
            _ => Err(e.unsupported()),
        }
    }

    fn emit_wide_product(&self, e: &mut Emitter, size: OperandSize, signed: bool) {
        e.local_get(locals::LHS);
        Self::extend_wide(e, size, signed);
        e.local_get(locals::RHS);
        Self::extend_wide(e, size, signed);
        e.func.instruction(&Instruction::I64Mul);
        e.local_set(locals::WIDE);
    }

    fn build_divide(&self, e: &mut Emitter, inst: &X86Instruction) -> Result<(), AssembleError> {
        let [divisor] = inst.operands.as_slice() else {
            return Err(e.unsupported());
        };
        let signed = inst.mnemonic == Mnemonic::Idiv;
        let size = operand_size(e, divisor)?;
        e.load_operand(self, divisor)?;
        e.local_set(locals::RHS);

        // #DE on a zero divisor; the runtime does not resume after it.
        let ok = e.block();
        e.local_get(locals::RHS);
        e.br_if(ok);
        let t1 = e.globals.t1();
        e.i32_const(0);
        e.global_set(t1);
        e.call_system(SystemFunc::Interrupt);
        e.func.instruction(&Instruction::Unreachable);
        e.end();

        // Dividend: AX, DX:AX or EDX:EAX.
        match size {
            OperandSize::Bits8 => {
                self.load_reg(e, reg::EAX, OperandSize::Bits16)?;
                Self::extend_wide(e, OperandSize::Bits16, signed);
            }
            OperandSize::Bits16 => {
                self.load_reg(e, reg::EDX, OperandSize::Bits16)?;
                e.i32_const(16);
                e.func.instruction(&Instruction::I32Shl);
                self.load_reg(e, reg::EAX, OperandSize::Bits16)?;
                e.func.instruction(&Instruction::I32Or);
                Self::extend_wide(e, OperandSize::Bits32, signed);
            }
            OperandSize::Bits32 => {
                self.load_reg(e, reg::EDX, OperandSize::Bits32)?;
                e.func.instruction(&Instruction::I64ExtendI32U);
                e.func.instruction(&Instruction::I64Const(32));
                e.func.instruction(&Instruction::I64Shl);
                self.load_reg(e, reg::EAX, OperandSize::Bits32)?;
                e.func.instruction(&Instruction::I64ExtendI32U);
                e.func.instruction(&Instruction::I64Or);
            }
            OperandSize::Bits128 => return Err(e.unsupported()),
        }
        e.local_set(locals::WIDE);

        let (quotient, remainder) = match size {
            OperandSize::Bits8 => ((reg::EAX, OperandSize::Bits8), (4, OperandSize::Bits8)),
            _ => ((reg::EAX, size), (reg::EDX, size)),
        };
        for ((index, part_size), op) in [
            (
                quotient,
                if signed {
                    Instruction::I64DivS
                } else {
                    Instruction::I64DivU
                },
            ),
            (
                remainder,
                if signed {
                    Instruction::I64RemS
                } else {
                    Instruction::I64RemU
                },
            ),
        ] {
            e.local_get(locals::WIDE);
            e.local_get(locals::RHS);
            Self::extend_wide(e, size, signed);
            e.func.instruction(&op);
            e.func.instruction(&Instruction::I32WrapI64);
            e.mask(part_size);
            self.store_reg(e, index, part_size)?;
        }
        Ok(())
    }

    fn build_string(&self, e: &mut Emitter, inst: &X86Instruction) -> Result<(), AssembleError> {
        let [dst, src] = inst.operands.as_slice() else {
            return Err(e.unsupported());
        };
        let size = operand_size(e, dst)?;
        let (esi, edi, ecx) = (
            self.gpr(e, reg::ESI),
            self.gpr(e, reg::EDI),
            self.gpr(e, reg::ECX),
        );
        let step = size.bytes() as i32;

        // Per-element step: -size when DF is set.
        e.i32_const(-step);
        e.i32_const(step);
        self.get_flag(e, Flag::Df);
        e.func.instruction(&Instruction::Select);
        e.local_set(locals::TMP);

        let repeat = inst.prefixes.intersects(Prefixes::REP | Prefixes::REPNE);
        let levels = if repeat {
            let exit = e.block();
            let top = e.loop_();
            e.global_get(ecx);
            e.func.instruction(&Instruction::I32Eqz);
            e.br_if(exit);
            Some(top)
        } else {
            None
        };

        e.global_get(edi);
        if inst.mnemonic == Mnemonic::Movs {
            e.global_get(esi);
            e.load(size)?;
        } else {
            e.load_operand(self, src)?;
        }
        e.store(size)?;
        if inst.mnemonic == Mnemonic::Movs {
            e.global_get(esi);
            e.local_get(locals::TMP);
            e.func.instruction(&Instruction::I32Add);
            e.global_set(esi);
        }
        e.global_get(edi);
        e.local_get(locals::TMP);
        e.func.instruction(&Instruction::I32Add);
        e.global_set(edi);

        if let Some(top) = levels {
            e.global_add(ecx, -1);
            e.br(top);
            e.end();
            e.end();
        }
        Ok(())
    }

    fn build_stack(&self, e: &mut Emitter, inst: &X86Instruction) -> Result<(), AssembleError> {
        match (inst.mnemonic, inst.operands.as_slice()) {
            (Mnemonic::Push, [src]) => {
                let size = operand_size(e, src)?;
                e.load_operand(self, src)?;
                self.push(e, size)
            }
            (Mnemonic::Pop, [dst]) => {
                let size = operand_size(e, dst)?;
                self.pop(e, size)?;
                e.store_operand(self, dst)
            }
            (Mnemonic::Pushad, []) => {
                let esp = self.esp(e);
                e.global_get(esp);
                e.local_set(locals::LHS);
                for index in 0..8u8 {
                    if index == reg::ESP {
                        e.local_get(locals::LHS);
                    } else {
                        self.load_reg(e, index, OperandSize::Bits32)?;
                    }
                    self.push(e, OperandSize::Bits32)?;
                }
                Ok(())
            }
            (Mnemonic::Popad, []) => {
                for index in (0..8u8).rev() {
                    if index == reg::ESP {
                        let esp = self.esp(e);
                        e.global_add(esp, 4);
                    } else {
                        self.pop(e, OperandSize::Bits32)?;
                        self.store_reg(e, index, OperandSize::Bits32)?;
                    }
                }
                Ok(())
            }
            (Mnemonic::Pushfd, []) => {
                e.u32_const(crate::abi::EFLAGS_RESERVED);
                for flag in Flag::ALL {
                    self.get_flag(e, flag);
                    e.u32_const(flag.eflags_bit());
                    e.func.instruction(&Instruction::I32Shl);
                    e.func.instruction(&Instruction::I32Or);
                }
                self.push(e, OperandSize::Bits32)
            }
            (Mnemonic::Popfd, []) => {
                self.pop(e, OperandSize::Bits32)?;
                e.local_set(locals::LHS);
                for flag in Flag::ALL {
                    self.set_flag(e, flag, |e| {
                        e.local_get(locals::LHS);
                        Self::emit_bit(e, flag.eflags_bit());
                    });
                }
                Ok(())
            }
            (Mnemonic::Leave, []) => {
                let (esp, ebp) = (self.esp(e), self.gpr(e, reg::EBP));
                e.global_get(ebp);
                e.global_set(esp);
                self.pop(e, OperandSize::Bits32)?;
                e.global_set(ebp);
                Ok(())
            }
            _ => Err(e.unsupported()),
        }
    }

    fn build_segment_operand(
        &self,
        e: &mut Emitter,
        index: u8,
        displacement: Option<i32>,
    ) -> Result<(), AssembleError> {
        let segment = self.segment_global(e, index)?;
        e.global_get(segment);
        if let Some(disp) = displacement {
            e.i32_const(disp);
            e.func.instruction(&Instruction::I32Add);
        }
        Ok(())
    }

    fn segment_global(&self, e: &Emitter, index: u8) -> Result<u32, AssembleError> {
        if usize::from(index) < self.segments().len() {
            Ok(e.globals.segment(u32::from(index)))
        } else {
            Err(e.unsupported())
        }
    }
}

fn operand_size(e: &Emitter, op: &Operand) -> Result<OperandSize, AssembleError> {
    match op.size() {
        Some(size) if size != OperandSize::Bits128 => Ok(size),
        _ => Err(e.unsupported()),
    }
}

impl Architecture for X86 {
    fn registers(&self) -> &[&'static str] {
        &X86_REGISTERS
    }

    fn segments(&self) -> &[&'static str] {
        &reg::SEGMENT_NAMES
    }

    fn stack_pointer(&self) -> u32 {
        u32::from(reg::ESP)
    }

    fn preprocess(&self, e: &mut Emitter, inst: &X86Instruction) -> Result<(), AssembleError> {
        let t1 = e.globals.t1();
        match inst.mnemonic {
            Mnemonic::Call | Mnemonic::Extern => self.push_const(e, inst.next_address),
            Mnemonic::ICall | Mnemonic::IJmp => {
                // The target is read before the return address is pushed.
                let [target] = inst.operands.as_slice() else {
                    return Err(e.unsupported());
                };
                e.load_operand(self, target)?;
                e.global_set(t1);
                if inst.mnemonic == Mnemonic::ICall {
                    self.push_const(e, inst.next_address)?;
                }
                Ok(())
            }
            Mnemonic::Ret => {
                let extra = match inst.operands.as_slice() {
                    [] => 0,
                    [imm] => imm.direct_immediate().ok_or_else(|| e.unsupported())? as i32,
                    _ => return Err(e.unsupported()),
                };
                let esp = self.esp(e);
                e.global_add(esp, 4 + (extra & 0xffff));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn postprocess(&self, e: &mut Emitter, inst: &X86Instruction) -> Result<(), AssembleError> {
        let Some(op) = Self::flag_op(inst) else {
            return Ok(());
        };
        let first = inst.operands.first().ok_or_else(|| e.unsupported())?;
        let size = operand_size(e, first)?;
        match op {
            FlagOp::Add {
                carry_in,
                writes_cf,
            } => self.emit_add_flags(e, size, carry_in, writes_cf),
            FlagOp::Sub {
                borrow_in,
                writes_cf,
            } => self.emit_sub_flags(e, size, borrow_in, writes_cf),
            FlagOp::Logic => self.emit_logic_flags(e, size),
            FlagOp::Shift(m) => self.emit_shift_flags(e, m, size),
            FlagOp::SignedMul => self.emit_mul_flags(e, size, true),
            FlagOp::UnsignedMul => self.emit_mul_flags(e, size, false),
        }
        Ok(())
    }

    fn operand_to_stack(&self, e: &mut Emitter, op: &Operand) -> Result<bool, AssembleError> {
        match op {
            Operand::Register {
                index,
                size: OperandSize::Bits16,
                indirect: false,
                ..
            } => {
                let global = self.gpr(e, *index);
                e.global_get(global);
                e.mask(OperandSize::Bits16);
            }
            Operand::Register {
                index,
                size: OperandSize::Bits8,
                indirect: false,
                ..
            } => {
                // AH..BH are bits 8..15 of EAX..EBX.
                let global = self.gpr(e, index & 3);
                e.global_get(global);
                if *index >= 4 {
                    e.i32_const(8);
                    e.func.instruction(&Instruction::I32ShrU);
                }
                e.mask(OperandSize::Bits8);
            }
            Operand::Segment {
                index,
                indirect: false,
                ..
            } => {
                let segment = self.segment_global(e, *index)?;
                e.global_get(segment);
            }
            Operand::Segment {
                size,
                indirect: true,
                ..
            }
            | Operand::ScaledIndexBase {
                size,
                indirect: true,
                ..
            }
            | Operand::MemoryOffset { size, .. } => {
                self.operand_address(e, op)?;
                e.load(*size)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn stack_to_operand(&self, e: &mut Emitter, op: &Operand) -> Result<bool, AssembleError> {
        match op {
            Operand::Register {
                index,
                size: size @ (OperandSize::Bits8 | OperandSize::Bits16),
                indirect: false,
                ..
            } => {
                let (global, shift) = if *size == OperandSize::Bits8 {
                    (self.gpr(e, index & 3), if *index >= 4 { 8 } else { 0 })
                } else {
                    (self.gpr(e, *index), 0)
                };
                let keep = !(size.mask() << shift);
                e.mask(*size);
                if shift != 0 {
                    e.u32_const(shift);
                    e.func.instruction(&Instruction::I32Shl);
                }
                e.local_set(locals::VALUE);
                e.global_get(global);
                e.u32_const(keep);
                e.func.instruction(&Instruction::I32And);
                e.local_get(locals::VALUE);
                e.func.instruction(&Instruction::I32Or);
                e.global_set(global);
            }
            Operand::Segment {
                index,
                indirect: false,
                ..
            } => {
                let segment = self.segment_global(e, *index)?;
                e.mask(OperandSize::Bits16);
                e.global_set(segment);
            }
            Operand::Segment {
                size,
                indirect: true,
                ..
            }
            | Operand::ScaledIndexBase {
                size,
                indirect: true,
                ..
            }
            | Operand::MemoryOffset { size, .. } => {
                e.local_set(locals::VALUE);
                self.operand_address(e, op)?;
                e.local_get(locals::VALUE);
                e.store(*size)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn operand_address(&self, e: &mut Emitter, op: &Operand) -> Result<bool, AssembleError> {
        match op {
            Operand::ScaledIndexBase {
                base,
                index,
                scale,
                displacement,
                ..
            } => {
                let mut terms = 0;
                if let Some(base) = base {
                    let global = self.gpr(e, *base);
                    e.global_get(global);
                    terms += 1;
                }
                if let Some(index) = index {
                    let global = self.gpr(e, *index);
                    e.global_get(global);
                    if *scale > 1 {
                        e.u32_const(u32::from(*scale).trailing_zeros());
                        e.func.instruction(&Instruction::I32Shl);
                    }
                    terms += 1;
                }
                if let Some(disp) = displacement {
                    e.i32_const(*disp);
                    terms += 1;
                }
                if terms == 0 {
                    e.i32_const(0);
                }
                for _ in 1..terms {
                    e.func.instruction(&Instruction::I32Add);
                }
            }
            Operand::Segment {
                index,
                indirect: true,
                displacement,
                ..
            } => self.build_segment_operand(e, *index, *displacement)?,
            Operand::MemoryOffset { value, .. } => e.u32_const(*value),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn flag_test(&self, e: &mut Emitter, inst: &X86Instruction) -> Result<(), AssembleError> {
        let cond = match inst.mnemonic {
            Mnemonic::Jcc(cond) | Mnemonic::Setcc(cond) => cond,
            Mnemonic::Into => Cond::O,
            Mnemonic::Jecxz => {
                let ecx = self.gpr(e, reg::ECX);
                e.global_get(ecx);
                e.func.instruction(&Instruction::I32Eqz);
                return Ok(());
            }
            _ => return Err(e.unsupported()),
        };

        // Even condition codes test a predicate; odd ones negate it.
        match cond {
            Cond::O | Cond::No => self.get_flag(e, Flag::Of),
            Cond::B | Cond::Ae => self.get_flag(e, Flag::Cf),
            Cond::E | Cond::Ne => self.get_flag(e, Flag::Zf),
            Cond::Be | Cond::A => {
                self.get_flag(e, Flag::Cf);
                self.get_flag(e, Flag::Zf);
                e.func.instruction(&Instruction::I32Or);
            }
            Cond::S | Cond::Ns => self.get_flag(e, Flag::Sf),
            Cond::P | Cond::Np => self.get_flag(e, Flag::Pf),
            Cond::L | Cond::Ge => {
                self.get_flag(e, Flag::Sf);
                self.get_flag(e, Flag::Of);
                e.func.instruction(&Instruction::I32Ne);
            }
            Cond::Le | Cond::G => {
                self.get_flag(e, Flag::Zf);
                self.get_flag(e, Flag::Sf);
                self.get_flag(e, Flag::Of);
                e.func.instruction(&Instruction::I32Ne);
                e.func.instruction(&Instruction::I32Or);
            }
        }
        if cond.cc() & 1 == 1 {
            e.func.instruction(&Instruction::I32Eqz);
        }
        Ok(())
    }

    fn build_instruction(
        &self,
        e: &mut Emitter,
        inst: &X86Instruction,
    ) -> Result<bool, AssembleError> {
        match inst.mnemonic {
            Mnemonic::Add
            | Mnemonic::Or
            | Mnemonic::Adc
            | Mnemonic::Sbb
            | Mnemonic::And
            | Mnemonic::Sub
            | Mnemonic::Xor
            | Mnemonic::Cmp
            | Mnemonic::Test => self.build_binary(e, inst)?,
            Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg | Mnemonic::Not => {
                self.build_unary(e, inst)?
            }
            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => self.build_shift(e, inst)?,
            Mnemonic::Imul | Mnemonic::Mul => self.build_multiply(e, inst)?,
            Mnemonic::Div | Mnemonic::Idiv => self.build_divide(e, inst)?,
            Mnemonic::Movzx | Mnemonic::Movsx => {
                let [dst, src] = inst.operands.as_slice() else {
                    return Err(e.unsupported());
                };
                let src_size = operand_size(e, src)?;
                e.load_operand(self, src)?;
                if inst.mnemonic == Mnemonic::Movsx {
                    e.sign_extend(src_size);
                    e.mask(operand_size(e, dst)?);
                }
                e.store_operand(self, dst)?;
            }
            Mnemonic::Lea => {
                let [dst, src] = inst.operands.as_slice() else {
                    return Err(e.unsupported());
                };
                e.address_of(self, src)?;
                e.mask(operand_size(e, dst)?);
                e.store_operand(self, dst)?;
            }
            Mnemonic::Xchg => {
                let [a, b] = inst.operands.as_slice() else {
                    return Err(e.unsupported());
                };
                self.stage(e, a, b)?;
                // The r/m side goes first: its address may use the register being swapped.
                e.local_get(locals::RHS);
                e.store_operand(self, a)?;
                e.local_get(locals::LHS);
                e.store_operand(self, b)?;
            }
            Mnemonic::Cmpxchg => {
                let [dst, src] = inst.operands.as_slice() else {
                    return Err(e.unsupported());
                };
                let size = operand_size(e, dst)?;
                let acc = Operand::reg(reg::EAX, size);
                self.stage(e, &acc, dst)?;
                e.local_get(locals::LHS);
                e.local_get(locals::RHS);
                e.func.instruction(&Instruction::I32Sub);
                self.finish_result(e, None, size)?;

                e.local_get(locals::LHS);
                e.local_get(locals::RHS);
                e.func.instruction(&Instruction::I32Eq);
                e.if_();
                e.load_operand(self, src)?;
                e.store_operand(self, dst)?;
                e.else_();
                e.local_get(locals::RHS);
                e.store_operand(self, &acc)?;
                e.end();
            }
            Mnemonic::Push
            | Mnemonic::Pop
            | Mnemonic::Pushad
            | Mnemonic::Popad
            | Mnemonic::Pushfd
            | Mnemonic::Popfd
            | Mnemonic::Leave => self.build_stack(e, inst)?,
            Mnemonic::Cdq => {
                if inst.prefixes.contains(Prefixes::OPERAND_SIZE) {
                    // CWD
                    self.load_reg(e, reg::EAX, OperandSize::Bits16)?;
                    e.sign_extend(OperandSize::Bits16);
                    e.i32_const(15);
                    e.func.instruction(&Instruction::I32ShrS);
                    e.mask(OperandSize::Bits16);
                    self.store_reg(e, reg::EDX, OperandSize::Bits16)?;
                } else {
                    self.load_reg(e, reg::EAX, OperandSize::Bits32)?;
                    e.i32_const(31);
                    e.func.instruction(&Instruction::I32ShrS);
                    self.store_reg(e, reg::EDX, OperandSize::Bits32)?;
                }
            }
            Mnemonic::Cld => self.set_flag_const(e, Flag::Df, false),
            Mnemonic::Std => self.set_flag_const(e, Flag::Df, true),
            Mnemonic::Movs | Mnemonic::Stos => self.build_string(e, inst)?,
            Mnemonic::Setcc(_) => {
                let [dst] = inst.operands.as_slice() else {
                    return Err(e.unsupported());
                };
                self.flag_test(e, inst)?;
                e.store_operand(self, dst)?;
            }
            Mnemonic::Cpuid => {
                for index in [reg::EAX, reg::EBX, reg::ECX, reg::EDX] {
                    let global = self.gpr(e, index);
                    e.i32_const(0);
                    e.global_set(global);
                }
            }
            Mnemonic::Xgetbv => {
                for index in [reg::EAX, reg::EDX] {
                    let global = self.gpr(e, index);
                    e.i32_const(0);
                    e.global_set(global);
                }
            }
            Mnemonic::Movlpd | Mnemonic::Xorps => {
                warn!(
                    address = inst.address,
                    mnemonic = %inst.mnemonic,
                    "vector instruction assembled as a no-op"
                );
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}
