//! Data-driven opcode table.
//!
//! Entries are keyed by `(opcode, Option<ModRM.reg>)`. Plain opcodes use `reg = None`; group
//! opcodes (`0x80`, `0xff`, ...) have one entry per `reg` value they accept and the decoder reads
//! the ModRM byte before looking them up. Two-byte opcodes live in the `0x0f00..=0x0fff` space.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::inst::{Cond, Mnemonic};

/// Operation width selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Word,
    Dword,
    /// 32-bit, or 16-bit under the operand-size override.
    Vz,
    Xmm,
}

/// Immediate encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Imm {
    /// imm8 sign-extended to the operation width.
    Ib,
    /// imm8 zero-extended (shift counts, interrupt vectors).
    Ub,
    /// imm16, or imm32 without the operand-size override.
    Iz,
    /// imm16.
    Iw,
}

/// How an opcode's operands are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    None,
    /// `r/m, reg`
    RmReg(Width),
    /// `reg, r/m`
    RegRm(Width),
    /// `reg(Vz), r/m(width)` for zero/sign extension.
    RegRmWiden(Width),
    /// `r/m, Sreg`
    RmSreg,
    /// `Sreg, r/m`
    SregRm,
    /// `AL/eAX, imm`
    AccImm(Width, Imm),
    /// `r/m, imm`
    RmImm(Width, Imm),
    /// `reg, r/m, imm`
    RegRmImm(Width, Imm),
    /// Register encoded in the low three opcode bits.
    OpReg(Width),
    /// `reg(opcode), imm`
    OpRegImm(Width, Imm),
    /// `reg(opcode), eAX`
    OpRegAcc(Width),
    /// A single immediate sized by the operation width.
    Imm(Imm),
    /// A fixed immediate operand (e.g. `INT3`).
    ImmConst(i64),
    /// Relative branch displacement.
    Rel(Imm),
    /// `r/m`
    Rm(Width),
    /// `r/m, 1`
    RmOne(Width),
    /// `r/m, CL`
    RmCl(Width),
    /// `AL/eAX, moffs`
    AccMoffs(Width),
    /// `moffs, AL/eAX`
    MoffsAcc(Width),
    /// `[edi], [esi]`
    Movs(Width),
    /// `[edi], AL/eAX`
    Stos(Width),
    /// `xmm, xmm/m`
    XmmRm,
    /// `xmm/m, xmm`
    RmXmm,
    /// `ptr16:32` far pointer, decoded as `selector, offset`.
    FarPtr,
    /// A fixed ModRM byte that carries no operand (`XGETBV` is `0F 01 D0`).
    ModrmExact(u8),
}

impl Shape {
    pub fn has_modrm(self) -> bool {
        matches!(
            self,
            Shape::RmReg(_)
                | Shape::RegRm(_)
                | Shape::RegRmWiden(_)
                | Shape::RmSreg
                | Shape::SregRm
                | Shape::RmImm(..)
                | Shape::RegRmImm(..)
                | Shape::Rm(_)
                | Shape::RmOne(_)
                | Shape::RmCl(_)
                | Shape::XmmRm
                | Shape::RmXmm
                | Shape::ModrmExact(_)
        )
    }

    /// The only ModRM byte a [`Shape::ModrmExact`] entry accepts.
    pub fn exact_modrm(self) -> Option<u8> {
        match self {
            Shape::ModrmExact(byte) => Some(byte),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpcodeKey {
    pub opcode: u16,
    pub reg: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpcodeSpec {
    pub mnemonic: Mnemonic,
    pub shape: Shape,
    /// Destination is repeated as the first source (`[dst, dst, src]`).
    pub rmw: bool,
}

struct OpcodeIndex {
    entries: BTreeMap<OpcodeKey, OpcodeSpec>,
    groups: BTreeSet<u16>,
}

struct TableBuilder {
    entries: BTreeMap<OpcodeKey, OpcodeSpec>,
}

impl TableBuilder {
    fn put(&mut self, opcode: u16, reg: Option<u8>, mnemonic: Mnemonic, shape: Shape, rmw: bool) {
        self.entries.insert(
            OpcodeKey { opcode, reg },
            OpcodeSpec {
                mnemonic,
                shape,
                rmw,
            },
        );
    }

    fn op(&mut self, opcode: u16, mnemonic: Mnemonic, shape: Shape) {
        self.put(opcode, None, mnemonic, shape, false);
    }

    fn rmw(&mut self, opcode: u16, mnemonic: Mnemonic, shape: Shape) {
        self.put(opcode, None, mnemonic, shape, true);
    }

    fn group(&mut self, opcode: u16, reg: u8, mnemonic: Mnemonic, shape: Shape, rmw: bool) {
        self.put(opcode, Some(reg), mnemonic, shape, rmw);
    }

    /// Eight consecutive opcodes with the register in the low three bits.
    fn regs(&mut self, base: u16, mnemonic: Mnemonic, shape: Shape) {
        for i in 0..8 {
            self.op(base + i, mnemonic, shape);
        }
    }

    /// Sixteen consecutive opcodes with the condition in the low four bits.
    fn conds(&mut self, base: u16, mnemonic: Mnemonic, shape: Shape) {
        for cond in Cond::ALL {
            self.op(base + u16::from(cond.cc()), mnemonic.with_cond(cond), shape);
        }
    }
}

const ALU_OPS: [Mnemonic; 8] = [
    Mnemonic::Add,
    Mnemonic::Or,
    Mnemonic::Adc,
    Mnemonic::Sbb,
    Mnemonic::And,
    Mnemonic::Sub,
    Mnemonic::Xor,
    Mnemonic::Cmp,
];

fn build_index() -> OpcodeIndex {
    use Mnemonic as M;
    use Shape as S;
    use Width::{Byte, Dword, Vz, Word};

    let mut t = TableBuilder {
        entries: BTreeMap::new(),
    };

    // 00..3d: the eight classic ALU ops, six encodings each.
    for (i, m) in ALU_OPS.into_iter().enumerate() {
        let base = (i as u16) * 8;
        let rmw = m != M::Cmp;
        t.put(base, None, m, S::RmReg(Byte), rmw);
        t.put(base + 1, None, m, S::RmReg(Vz), rmw);
        t.put(base + 2, None, m, S::RegRm(Byte), rmw);
        t.put(base + 3, None, m, S::RegRm(Vz), rmw);
        t.put(base + 4, None, m, S::AccImm(Byte, Imm::Ib), rmw);
        t.put(base + 5, None, m, S::AccImm(Vz, Imm::Iz), rmw);

        t.group(0x80, i as u8, m, S::RmImm(Byte, Imm::Ib), rmw);
        t.group(0x81, i as u8, m, S::RmImm(Vz, Imm::Iz), rmw);
        t.group(0x83, i as u8, m, S::RmImm(Vz, Imm::Ib), rmw);
    }

    t.regs(0x40, M::Inc, S::OpReg(Vz));
    t.regs(0x48, M::Dec, S::OpReg(Vz));
    t.regs(0x50, M::Push, S::OpReg(Vz));
    t.regs(0x58, M::Pop, S::OpReg(Vz));
    t.op(0x60, M::Pushad, S::None);
    t.op(0x61, M::Popad, S::None);
    t.op(0x68, M::Push, S::Imm(Imm::Iz));
    t.op(0x69, M::Imul, S::RegRmImm(Vz, Imm::Iz));
    t.op(0x6a, M::Push, S::Imm(Imm::Ib));
    t.op(0x6b, M::Imul, S::RegRmImm(Vz, Imm::Ib));
    t.conds(0x70, M::Jcc(Cond::O), S::Rel(Imm::Ib));

    t.op(0x84, M::Test, S::RmReg(Byte));
    t.op(0x85, M::Test, S::RmReg(Vz));
    t.op(0x86, M::Xchg, S::RmReg(Byte));
    t.op(0x87, M::Xchg, S::RmReg(Vz));
    t.op(0x88, M::Mov, S::RmReg(Byte));
    t.op(0x89, M::Mov, S::RmReg(Vz));
    t.op(0x8a, M::Mov, S::RegRm(Byte));
    t.op(0x8b, M::Mov, S::RegRm(Vz));
    t.op(0x8c, M::Mov, S::RmSreg);
    t.op(0x8d, M::Lea, S::RegRm(Vz));
    t.op(0x8e, M::Mov, S::SregRm);
    t.group(0x8f, 0, M::Pop, S::Rm(Vz), false);

    t.regs(0x90, M::Xchg, S::OpRegAcc(Vz));
    // `xchg eax, eax` is the canonical NOP.
    t.op(0x90, M::Nop, S::None);
    t.op(0x99, M::Cdq, S::None);
    t.op(0x9a, M::Call, S::FarPtr);
    t.op(0x9c, M::Pushfd, S::None);
    t.op(0x9d, M::Popfd, S::None);

    t.op(0xa0, M::Mov, S::AccMoffs(Byte));
    t.op(0xa1, M::Mov, S::AccMoffs(Vz));
    t.op(0xa2, M::Mov, S::MoffsAcc(Byte));
    t.op(0xa3, M::Mov, S::MoffsAcc(Vz));
    t.op(0xa4, M::Movs, S::Movs(Byte));
    t.op(0xa5, M::Movs, S::Movs(Vz));
    t.op(0xa8, M::Test, S::AccImm(Byte, Imm::Ib));
    t.op(0xa9, M::Test, S::AccImm(Vz, Imm::Iz));
    t.op(0xaa, M::Stos, S::Stos(Byte));
    t.op(0xab, M::Stos, S::Stos(Vz));

    t.regs(0xb0, M::Mov, S::OpRegImm(Byte, Imm::Ib));
    t.regs(0xb8, M::Mov, S::OpRegImm(Vz, Imm::Iz));

    for (reg, m) in [(4u8, M::Shl), (5, M::Shr), (6, M::Shl), (7, M::Sar)] {
        t.group(0xc0, reg, m, S::RmImm(Byte, Imm::Ub), true);
        t.group(0xc1, reg, m, S::RmImm(Vz, Imm::Ub), true);
        t.group(0xd0, reg, m, S::RmOne(Byte), true);
        t.group(0xd1, reg, m, S::RmOne(Vz), true);
        t.group(0xd2, reg, m, S::RmCl(Byte), true);
        t.group(0xd3, reg, m, S::RmCl(Vz), true);
    }

    t.op(0xc2, M::Ret, S::Imm(Imm::Iw));
    t.op(0xc3, M::Ret, S::None);
    t.group(0xc6, 0, M::Mov, S::RmImm(Byte, Imm::Ib), false);
    t.group(0xc7, 0, M::Mov, S::RmImm(Vz, Imm::Iz), false);
    t.op(0xc9, M::Leave, S::None);
    // RETF is treated as a near return.
    t.op(0xca, M::Ret, S::Imm(Imm::Iw));
    t.op(0xcb, M::Ret, S::None);
    t.op(0xcc, M::Int, S::ImmConst(3));
    t.op(0xcd, M::Int, S::Imm(Imm::Ub));
    t.op(0xce, M::Into, S::None);

    t.op(0xe3, M::Jecxz, S::Rel(Imm::Ib));
    t.op(0xe8, M::Call, S::Rel(Imm::Iz));
    t.op(0xe9, M::Jmp, S::Rel(Imm::Iz));
    t.op(0xea, M::Jmp, S::FarPtr);
    t.op(0xeb, M::Jmp, S::Rel(Imm::Ib));

    for (opcode, width, imm) in [(0xf6u16, Byte, Imm::Ib), (0xf7, Vz, Imm::Iz)] {
        t.group(opcode, 0, M::Test, S::RmImm(width, imm), false);
        t.group(opcode, 2, M::Not, S::Rm(width), false);
        t.group(opcode, 3, M::Neg, S::Rm(width), false);
        t.group(opcode, 4, M::Mul, S::Rm(width), false);
        t.group(opcode, 5, M::Imul, S::Rm(width), false);
        t.group(opcode, 6, M::Div, S::Rm(width), false);
        t.group(opcode, 7, M::Idiv, S::Rm(width), false);
    }

    t.op(0xfc, M::Cld, S::None);
    t.op(0xfd, M::Std, S::None);
    t.group(0xfe, 0, M::Inc, S::Rm(Byte), false);
    t.group(0xfe, 1, M::Dec, S::Rm(Byte), false);
    t.group(0xff, 0, M::Inc, S::Rm(Vz), false);
    t.group(0xff, 1, M::Dec, S::Rm(Vz), false);
    t.group(0xff, 2, M::Call, S::Rm(Dword), false);
    t.group(0xff, 4, M::Jmp, S::Rm(Dword), false);
    t.group(0xff, 6, M::Push, S::Rm(Vz), false);

    // Two-byte opcodes.
    t.group(0x0f01, 2, M::Xgetbv, S::ModrmExact(0xd0), false);
    t.op(0x0f12, M::Movlpd, S::XmmRm);
    t.op(0x0f13, M::Movlpd, S::RmXmm);
    t.rmw(0x0f57, M::Xorps, S::XmmRm);
    t.conds(0x0f80, M::Jcc(Cond::O), S::Rel(Imm::Iz));
    t.conds(0x0f90, M::Setcc(Cond::O), S::Rm(Byte));
    t.op(0x0fa2, M::Cpuid, S::None);
    t.rmw(0x0faf, M::Imul, S::RegRm(Vz));
    t.op(0x0fb0, M::Cmpxchg, S::RmReg(Byte));
    t.op(0x0fb1, M::Cmpxchg, S::RmReg(Vz));
    t.op(0x0fb6, M::Movzx, S::RegRmWiden(Byte));
    t.op(0x0fb7, M::Movzx, S::RegRmWiden(Word));
    t.op(0x0fbe, M::Movsx, S::RegRmWiden(Byte));
    t.op(0x0fbf, M::Movsx, S::RegRmWiden(Word));

    let groups = t
        .entries
        .keys()
        .filter(|key| key.reg.is_some())
        .map(|key| key.opcode)
        .collect();
    OpcodeIndex {
        entries: t.entries,
        groups,
    }
}

fn index() -> &'static OpcodeIndex {
    static INDEX: OnceLock<OpcodeIndex> = OnceLock::new();
    INDEX.get_or_init(build_index)
}

/// Whether `opcode` selects its mnemonic through the ModRM `reg` field.
pub fn is_group(opcode: u16) -> bool {
    index().groups.contains(&opcode)
}

/// Look up an opcode; group opcodes must pass their ModRM `reg` field.
pub fn lookup(opcode: u16, reg: Option<u8>) -> Option<OpcodeSpec> {
    index().entries.get(&OpcodeKey { opcode, reg }).copied()
}

/// Every table entry, in ascending key order.
pub fn entries() -> impl Iterator<Item = (OpcodeKey, OpcodeSpec)> {
    index().entries.iter().map(|(k, v)| (*k, *v))
}
