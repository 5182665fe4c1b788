//! Canonical operand and instruction model.
//!
//! Every later pass (chunk discovery, reference fixup, wasm assembly) works on these types only;
//! nothing downstream looks at raw bytes again.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Module id carried by resolved branch operands (`[module, chunk, index]`).
pub const PROGRAM_MODULE_ID: i64 = 1;

/// x86 register numbering as used in ModRM/SIB and register-in-opcode encodings.
pub mod reg {
    pub const EAX: u8 = 0;
    pub const ECX: u8 = 1;
    pub const EDX: u8 = 2;
    pub const EBX: u8 = 3;
    pub const ESP: u8 = 4;
    pub const EBP: u8 = 5;
    pub const ESI: u8 = 6;
    pub const EDI: u8 = 7;

    pub const ES: u8 = 0;
    pub const CS: u8 = 1;
    pub const SS: u8 = 2;
    pub const DS: u8 = 3;
    pub const FS: u8 = 4;
    pub const GS: u8 = 5;

    pub const GPR32_NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
    pub const GPR16_NAMES: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
    pub const GPR8_NAMES: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];
    pub const SEGMENT_NAMES: [&str; 6] = ["es", "cs", "ss", "ds", "fs", "gs"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperandSize {
    Bits8,
    Bits16,
    Bits32,
    Bits128,
}

impl OperandSize {
    pub const fn bits(self) -> u32 {
        match self {
            OperandSize::Bits8 => 8,
            OperandSize::Bits16 => 16,
            OperandSize::Bits32 => 32,
            OperandSize::Bits128 => 128,
        }
    }

    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    /// Value mask for scalar widths. 128-bit operands saturate to the full 32-bit mask since
    /// scalar code never computes with them.
    pub const fn mask(self) -> u32 {
        match self {
            OperandSize::Bits8 => 0xff,
            OperandSize::Bits16 => 0xffff,
            OperandSize::Bits32 | OperandSize::Bits128 => 0xffff_ffff,
        }
    }

    pub const fn sign_bit(self) -> u32 {
        match self {
            OperandSize::Bits8 => 0x80,
            OperandSize::Bits16 => 0x8000,
            OperandSize::Bits32 | OperandSize::Bits128 => 0x8000_0000,
        }
    }

    fn ptr_keyword(self) -> &'static str {
        match self {
            OperandSize::Bits8 => "byte",
            OperandSize::Bits16 => "word",
            OperandSize::Bits32 => "dword",
            OperandSize::Bits128 => "xmmword",
        }
    }
}

bitflags! {
    /// Legacy prefixes seen in front of an instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Prefixes: u16 {
        const LOCK = 1 << 0;
        const REPNE = 1 << 1;
        const REP = 1 << 2;
        const OPERAND_SIZE = 1 << 3;
        const ADDRESS_SIZE = 1 << 4;
        const ES = 1 << 5;
        const CS = 1 << 6;
        const SS = 1 << 7;
        const DS = 1 << 8;
        const FS = 1 << 9;
        const GS = 1 << 10;
    }
}

impl Prefixes {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0xf0 => Prefixes::LOCK,
            0xf2 => Prefixes::REPNE,
            0xf3 => Prefixes::REP,
            0x66 => Prefixes::OPERAND_SIZE,
            0x67 => Prefixes::ADDRESS_SIZE,
            0x26 => Prefixes::ES,
            0x2e => Prefixes::CS,
            0x36 => Prefixes::SS,
            0x3e => Prefixes::DS,
            0x64 => Prefixes::FS,
            0x65 => Prefixes::GS,
            _ => return None,
        })
    }

    /// Segment override that changes the effective address in a flat model (`FS`/`GS` only).
    pub fn base_segment(self) -> Option<u8> {
        if self.contains(Prefixes::FS) {
            Some(reg::FS)
        } else if self.contains(Prefixes::GS) {
            Some(reg::GS)
        } else {
            None
        }
    }
}

/// Condition codes in x86 `cc` encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    pub const ALL: [Cond; 16] = [
        Cond::O,
        Cond::No,
        Cond::B,
        Cond::Ae,
        Cond::E,
        Cond::Ne,
        Cond::Be,
        Cond::A,
        Cond::S,
        Cond::Ns,
        Cond::P,
        Cond::Np,
        Cond::L,
        Cond::Ge,
        Cond::Le,
        Cond::G,
    ];

    pub fn cc(self) -> u8 {
        self as u8
    }
}

const JCC_NAMES: [&str; 16] = [
    "JO", "JNO", "JB", "JAE", "JE", "JNE", "JBE", "JA", "JS", "JNS", "JP", "JNP", "JL", "JGE",
    "JLE", "JG",
];

const SETCC_NAMES: [&str; 16] = [
    "SETO", "SETNO", "SETB", "SETAE", "SETE", "SETNE", "SETBE", "SETA", "SETS", "SETNS", "SETP",
    "SETNP", "SETL", "SETGE", "SETLE", "SETG",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mnemonic {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Inc,
    Dec,
    Neg,
    Not,
    Test,
    Imul,
    Mul,
    Div,
    Idiv,
    Shl,
    Shr,
    Sar,
    Mov,
    Movzx,
    Movsx,
    Lea,
    Xchg,
    Cmpxchg,
    Push,
    Pop,
    Pushad,
    Popad,
    Pushfd,
    Popfd,
    Leave,
    Cdq,
    Nop,
    Cld,
    Std,
    Movs,
    Stos,
    Setcc(Cond),
    Jcc(Cond),
    Jecxz,
    Jmp,
    Call,
    Ret,
    Int,
    Into,
    Cpuid,
    Xgetbv,
    Movlpd,
    Xorps,
    /// Call through an import thunk, rewritten by fixup.
    Extern,
    /// Jump through an import thunk (external tail call), rewritten by fixup.
    ExternJmp,
    /// Jump whose target is only known at run time.
    IJmp,
    /// Call whose target is only known at run time.
    ICall,
}

impl Mnemonic {
    pub fn name(self) -> &'static str {
        match self {
            Mnemonic::Add => "ADD",
            Mnemonic::Or => "OR",
            Mnemonic::Adc => "ADC",
            Mnemonic::Sbb => "SBB",
            Mnemonic::And => "AND",
            Mnemonic::Sub => "SUB",
            Mnemonic::Xor => "XOR",
            Mnemonic::Cmp => "CMP",
            Mnemonic::Inc => "INC",
            Mnemonic::Dec => "DEC",
            Mnemonic::Neg => "NEG",
            Mnemonic::Not => "NOT",
            Mnemonic::Test => "TEST",
            Mnemonic::Imul => "IMUL",
            Mnemonic::Mul => "MUL",
            Mnemonic::Div => "DIV",
            Mnemonic::Idiv => "IDIV",
            Mnemonic::Shl => "SHL",
            Mnemonic::Shr => "SHR",
            Mnemonic::Sar => "SAR",
            Mnemonic::Mov => "MOV",
            Mnemonic::Movzx => "MOVZX",
            Mnemonic::Movsx => "MOVSX",
            Mnemonic::Lea => "LEA",
            Mnemonic::Xchg => "XCHG",
            Mnemonic::Cmpxchg => "CMPXCHG",
            Mnemonic::Push => "PUSH",
            Mnemonic::Pop => "POP",
            Mnemonic::Pushad => "PUSHAD",
            Mnemonic::Popad => "POPAD",
            Mnemonic::Pushfd => "PUSHFD",
            Mnemonic::Popfd => "POPFD",
            Mnemonic::Leave => "LEAVE",
            Mnemonic::Cdq => "CDQ",
            Mnemonic::Nop => "NOP",
            Mnemonic::Cld => "CLD",
            Mnemonic::Std => "STD",
            Mnemonic::Movs => "MOVS",
            Mnemonic::Stos => "STOS",
            Mnemonic::Setcc(cond) => SETCC_NAMES[cond.cc() as usize],
            Mnemonic::Jcc(cond) => JCC_NAMES[cond.cc() as usize],
            Mnemonic::Jecxz => "JECXZ",
            Mnemonic::Jmp => "JMP",
            Mnemonic::Call => "CALL",
            Mnemonic::Ret => "RET",
            Mnemonic::Int => "INT",
            Mnemonic::Into => "INTO",
            Mnemonic::Cpuid => "CPUID",
            Mnemonic::Xgetbv => "XGETBV",
            Mnemonic::Movlpd => "MOVLPD",
            Mnemonic::Xorps => "XORPS",
            Mnemonic::Extern => "EXTERN",
            Mnemonic::ExternJmp => "EXTERN.JMP",
            Mnemonic::IJmp => "IJMP",
            Mnemonic::ICall => "ICALL",
        }
    }

    /// Replace the condition of a `Jcc`/`SETcc` mnemonic; other mnemonics are returned as-is.
    pub fn with_cond(self, cond: Cond) -> Mnemonic {
        match self {
            Mnemonic::Jcc(_) => Mnemonic::Jcc(cond),
            Mnemonic::Setcc(_) => Mnemonic::Setcc(cond),
            other => other,
        }
    }

    pub fn is_conditional_jump(self) -> bool {
        matches!(self, Mnemonic::Jcc(_) | Mnemonic::Jecxz)
    }

    /// Control transfers whose operand is rewritten by reference fixup.
    pub fn is_branch(self) -> bool {
        matches!(self, Mnemonic::Jmp | Mnemonic::Call) || self.is_conditional_jump()
    }

    /// `JMP` and `RET` end the linear run being decoded.
    pub fn ends_run(self) -> bool {
        matches!(self, Mnemonic::Jmp | Mnemonic::Ret)
    }

    /// The runtime-dispatched form of a branch with a non-constant target.
    pub fn indeterminate(self) -> Option<Mnemonic> {
        match self {
            Mnemonic::Jmp => Some(Mnemonic::IJmp),
            Mnemonic::Call => Some(Mnemonic::ICall),
            _ => None,
        }
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded operand.
///
/// `indirect` means "dereference the computed address"; otherwise the operand is its own value.
/// Register indices follow x86 numbering (see [`reg`]); for 8-bit registers indices 4..=7 name
/// the high bytes `AH`..`BH`, and for 128-bit operands the index names an XMM register.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operand {
    Register {
        index: u8,
        size: OperandSize,
        indirect: bool,
        displacement: Option<i32>,
    },
    Immediate {
        value: i64,
        size: OperandSize,
        indirect: bool,
        displacement: Option<i32>,
    },
    ScaledIndexBase {
        base: Option<u8>,
        /// `None` when the SIB index field is `0b100` (no index).
        index: Option<u8>,
        scale: u8,
        displacement: Option<i32>,
        size: OperandSize,
        indirect: bool,
    },
    Segment {
        index: u8,
        size: OperandSize,
        indirect: bool,
        displacement: Option<i32>,
    },
    MemoryOffset {
        value: u32,
        size: OperandSize,
    },
    External {
        symbol: String,
    },
}

impl Operand {
    pub fn reg(index: u8, size: OperandSize) -> Self {
        Operand::Register {
            index,
            size,
            indirect: false,
            displacement: None,
        }
    }

    pub fn imm(value: i64, size: OperandSize) -> Self {
        Operand::Immediate {
            value,
            size,
            indirect: false,
            displacement: None,
        }
    }

    /// Operand width in bits; `External` has none.
    pub fn size(&self) -> Option<OperandSize> {
        match self {
            Operand::Register { size, .. }
            | Operand::Immediate { size, .. }
            | Operand::ScaledIndexBase { size, .. }
            | Operand::Segment { size, .. }
            | Operand::MemoryOffset { size, .. } => Some(*size),
            Operand::External { .. } => None,
        }
    }

    /// Value of a direct (non-dereferenced) immediate.
    pub fn direct_immediate(&self) -> Option<i64> {
        match self {
            Operand::Immediate {
                value,
                indirect: false,
                ..
            } => Some(*value),
            _ => None,
        }
    }

    /// Pointer address of an indirect immediate (`[disp32]`).
    pub fn indirect_immediate(&self) -> Option<u32> {
        match self {
            Operand::Immediate {
                value,
                indirect: true,
                displacement,
                ..
            } => Some((*value as u32).wrapping_add(displacement.unwrap_or(0) as u32)),
            _ => None,
        }
    }
}

fn write_disp(f: &mut fmt::Formatter<'_>, disp: Option<i32>) -> fmt::Result {
    match disp {
        Some(d) if d < 0 => write!(f, "-{:#x}", (d as i64).unsigned_abs()),
        Some(d) => write!(f, "+{d:#x}"),
        None => Ok(()),
    }
}

fn reg_name(index: u8, size: OperandSize) -> String {
    let i = (index & 7) as usize;
    match size {
        OperandSize::Bits8 => reg::GPR8_NAMES[i].to_string(),
        OperandSize::Bits16 => reg::GPR16_NAMES[i].to_string(),
        OperandSize::Bits32 => reg::GPR32_NAMES[i].to_string(),
        OperandSize::Bits128 => format!("xmm{index}"),
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register {
                index,
                size,
                indirect: false,
                ..
            } => f.write_str(&reg_name(*index, *size)),
            Operand::Register {
                index,
                size,
                indirect: true,
                displacement,
            } => {
                write!(
                    f,
                    "{} ptr [{}",
                    size.ptr_keyword(),
                    reg::GPR32_NAMES[(*index & 7) as usize]
                )?;
                write_disp(f, *displacement)?;
                f.write_str("]")
            }
            Operand::Immediate {
                value,
                size,
                indirect: false,
                ..
            } => write!(f, "{:#x}", (*value as u32) & size.mask()),
            Operand::Immediate {
                value,
                size,
                indirect: true,
                displacement,
            } => {
                write!(f, "{} ptr [{:#x}", size.ptr_keyword(), *value as u32)?;
                write_disp(f, *displacement)?;
                f.write_str("]")
            }
            Operand::ScaledIndexBase {
                base,
                index,
                scale,
                displacement,
                size,
                indirect,
            } => {
                if *indirect {
                    write!(f, "{} ptr ", size.ptr_keyword())?;
                }
                f.write_str("[")?;
                let mut first = true;
                if let Some(base) = base {
                    f.write_str(reg::GPR32_NAMES[(*base & 7) as usize])?;
                    first = false;
                }
                if let Some(index) = index {
                    if !first {
                        f.write_str("+")?;
                    }
                    write!(f, "{}*{scale}", reg::GPR32_NAMES[(*index & 7) as usize])?;
                    first = false;
                }
                if first {
                    write!(f, "{:#x}", displacement.unwrap_or(0) as u32)?;
                } else {
                    write_disp(f, *displacement)?;
                }
                f.write_str("]")
            }
            Operand::Segment {
                index,
                size,
                indirect,
                displacement,
            } => {
                let name = reg::SEGMENT_NAMES
                    .get(*index as usize)
                    .copied()
                    .unwrap_or("?s");
                if *indirect {
                    write!(
                        f,
                        "{} ptr {name}:[{:#x}]",
                        size.ptr_keyword(),
                        displacement.unwrap_or(0) as u32
                    )
                } else {
                    f.write_str(name)
                }
            }
            Operand::MemoryOffset { value, size } => {
                write!(f, "{} ptr [{value:#x}]", size.ptr_keyword())
            }
            Operand::External { symbol } => f.write_str(symbol),
        }
    }
}

/// Where a resolved branch lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolvedTarget {
    /// Instruction index inside the emitting chunk.
    Local { index: u32 },
    /// Instruction index inside another chunk.
    Chunk { chunk: u32, index: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub prefixes: Prefixes,
    /// One-byte opcodes are stored as-is; two-byte opcodes as `0x0f00 | second`.
    pub opcode: u16,
    pub mnemonic: Mnemonic,
    pub operands: Vec<Operand>,
    pub address: u32,
    pub next_address: u32,
}

impl Instruction {
    /// Encoded length in bytes.
    pub fn len(&self) -> u32 {
        self.next_address.wrapping_sub(self.address)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A zero-length `JMP` to `address`, used to close a spliced run that falls through into
    /// code its chunk already holds.
    pub fn fallthrough_jump(address: u32) -> Self {
        Instruction {
            prefixes: Prefixes::empty(),
            opcode: 0xe9,
            mnemonic: Mnemonic::Jmp,
            operands: vec![Operand::imm(0, OperandSize::Bits32)],
            address,
            next_address: address,
        }
    }

    pub fn is_fallthrough_jump(&self) -> bool {
        self.mnemonic == Mnemonic::Jmp && self.is_empty()
    }

    /// Absolute target of an unresolved relative branch (`next_address + displacement`).
    pub fn relative_target(&self) -> Option<u32> {
        if !self.mnemonic.is_branch() {
            return None;
        }
        match self.operands.as_slice() {
            [op] => op
                .direct_immediate()
                .map(|disp| self.next_address.wrapping_add(disp as u32)),
            _ => None,
        }
    }

    /// Offset of a far `CALL`/`JMP ptr16:32`. The selector is not modelled.
    pub fn far_target(&self) -> Option<u32> {
        if !matches!(self.mnemonic, Mnemonic::Call | Mnemonic::Jmp) {
            return None;
        }
        match self.operands.as_slice() {
            [selector, offset] => {
                selector.direct_immediate()?;
                offset.direct_immediate().map(|value| value as u32)
            }
            _ => None,
        }
    }

    /// Target of a branch rewritten by fixup into the `[module, chunk, index]` form.
    pub fn resolved_target(&self) -> Option<ResolvedTarget> {
        if !self.mnemonic.is_branch() {
            return None;
        }
        let [module, chunk, index] = self.operands.as_slice() else {
            return None;
        };
        let (Some(module), Some(chunk), Some(index)) = (
            module.direct_immediate(),
            chunk.direct_immediate(),
            index.direct_immediate(),
        ) else {
            return None;
        };
        if module != PROGRAM_MODULE_ID {
            return None;
        }
        let index = u32::try_from(index).ok()?;
        if chunk < 0 {
            Some(ResolvedTarget::Local { index })
        } else {
            Some(ResolvedTarget::Chunk {
                chunk: u32::try_from(chunk).ok()?,
                index,
            })
        }
    }

    /// Rewrite the operands into the resolved `[module, chunk, index]` form.
    pub fn set_resolved_target(&mut self, target: ResolvedTarget) {
        let (chunk, index) = match target {
            ResolvedTarget::Local { index } => (-1, index),
            ResolvedTarget::Chunk { chunk, index } => (i64::from(chunk), index),
        };
        self.operands = vec![
            Operand::imm(PROGRAM_MODULE_ID, OperandSize::Bits32),
            Operand::imm(chunk, OperandSize::Bits32),
            Operand::imm(i64::from(index), OperandSize::Bits32),
        ];
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string_op = matches!(self.mnemonic, Mnemonic::Movs | Mnemonic::Stos);
        if self.prefixes.contains(Prefixes::REP) && string_op {
            f.write_str("REP ")?;
        }
        write!(f, "{}", self.mnemonic)?;
        if let [selector, offset] = self.operands.as_slice() {
            if self.far_target().is_some() {
                return write!(f, " FAR {selector}:{offset}");
            }
        }
        for (i, op) in self.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            write!(f, "{op}")?;
        }
        Ok(())
    }
}
