//! Single-instruction decoder.
//!
//! [`decode`] is a pure function of its input bytes: it consumes prefixes, the (possibly
//! two-byte) opcode, ModRM/SIB, displacement and immediate bytes, and returns the canonical
//! [`Instruction`] together with the number of bytes consumed.

use thiserror::Error;

use crate::inst::{reg, Instruction, Operand, OperandSize, Prefixes};
use crate::opcode_tables::{self, Imm, Shape, Width};

/// Architectural maximum instruction length.
pub const MAX_INST_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {opcode:#x} at {address:#010x}")]
    UnknownOpcode { address: u32, opcode: u16 },
    #[error("instruction at {address:#010x} runs past the end of the buffer")]
    UnexpectedEof { address: u32 },
    #[error("instruction at {address:#010x} is longer than 15 bytes")]
    TooLong { address: u32 },
}

impl DecodeError {
    pub fn address(&self) -> u32 {
        match *self {
            DecodeError::UnknownOpcode { address, .. }
            | DecodeError::UnexpectedEof { address }
            | DecodeError::TooLong { address } => address,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ModRm {
    mod_bits: u8,
    reg: u8,
    rm: u8,
}

impl ModRm {
    fn byte(self) -> u8 {
        (self.mod_bits << 6) | (self.reg << 3) | self.rm
    }
}

fn parse_modrm(byte: u8) -> ModRm {
    ModRm {
        mod_bits: (byte >> 6) & 0x3,
        reg: (byte >> 3) & 0x7,
        rm: byte & 0x7,
    }
}

fn parse_sib(byte: u8) -> (u8, u8, u8) {
    let scale_bits = (byte >> 6) & 0x3;
    let index = (byte >> 3) & 0x7;
    let base = byte & 0x7;
    (scale_bits, index, base)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
    address: u32,
}

impl Cursor<'_> {
    fn peek_u8(&self) -> Result<u8, DecodeError> {
        self.bytes
            .get(self.offset)
            .copied()
            .ok_or(DecodeError::UnexpectedEof {
                address: self.address,
            })
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = self.peek_u8()?;
        self.offset += 1;
        Ok(b)
    }

    fn read_le(&mut self, len: usize) -> Result<u32, DecodeError> {
        let end = self.offset + len;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(DecodeError::UnexpectedEof {
                address: self.address,
            })?;
        let mut v = 0u32;
        for (i, b) in slice.iter().enumerate() {
            v |= u32::from(*b) << (i * 8);
        }
        self.offset = end;
        Ok(v)
    }
}

/// Decode one instruction located at virtual address `address`.
pub fn decode(bytes: &[u8], address: u32) -> Result<(Instruction, usize), DecodeError> {
    let mut cur = Cursor {
        bytes,
        offset: 0,
        address,
    };

    let mut prefixes = Prefixes::empty();
    while let Some(prefix) = Prefixes::from_byte(cur.peek_u8()?) {
        prefixes |= prefix;
        cur.offset += 1;
        if cur.offset >= MAX_INST_LEN {
            return Err(DecodeError::TooLong { address });
        }
    }

    let first = cur.read_u8()?;
    let opcode = if first == 0x0f {
        0x0f00 | u16::from(cur.read_u8()?)
    } else {
        u16::from(first)
    };

    let reg_sel = if opcode_tables::is_group(opcode) {
        Some((cur.peek_u8()? >> 3) & 0x7)
    } else {
        None
    };
    let spec = opcode_tables::lookup(opcode, reg_sel)
        .ok_or(DecodeError::UnknownOpcode { address, opcode })?;

    let mut operands = OperandDecoder {
        cur: &mut cur,
        prefixes,
        opcode,
    };
    let mut ops = operands.decode(spec.shape)?;
    if spec.rmw {
        if let Some(dst) = ops.first().cloned() {
            ops.insert(0, dst);
        }
    }

    let len = cur.offset;
    if len > MAX_INST_LEN {
        return Err(DecodeError::TooLong { address });
    }

    Ok((
        Instruction {
            prefixes,
            opcode,
            mnemonic: spec.mnemonic,
            operands: ops,
            address,
            next_address: address.wrapping_add(len as u32),
        },
        len,
    ))
}

struct OperandDecoder<'c, 'a> {
    cur: &'c mut Cursor<'a>,
    prefixes: Prefixes,
    opcode: u16,
}

impl OperandDecoder<'_, '_> {
    fn size(&self, width: Width) -> OperandSize {
        match width {
            Width::Byte => OperandSize::Bits8,
            Width::Word => OperandSize::Bits16,
            Width::Dword => OperandSize::Bits32,
            Width::Vz if self.prefixes.contains(Prefixes::OPERAND_SIZE) => OperandSize::Bits16,
            Width::Vz => OperandSize::Bits32,
            Width::Xmm => OperandSize::Bits128,
        }
    }

    fn opcode_reg(&self) -> u8 {
        (self.opcode & 0x7) as u8
    }

    fn modrm(&mut self) -> Result<ModRm, DecodeError> {
        Ok(parse_modrm(self.cur.read_u8()?))
    }

    fn immediate(&mut self, imm: Imm, size: OperandSize) -> Result<Operand, DecodeError> {
        let value = match imm {
            Imm::Ib => i64::from(self.cur.read_u8()? as i8),
            Imm::Ub => i64::from(self.cur.read_u8()?),
            Imm::Iw => i64::from(self.cur.read_le(2)? as u16),
            Imm::Iz if size == OperandSize::Bits16 => i64::from(self.cur.read_le(2)? as u16 as i16),
            Imm::Iz => i64::from(self.cur.read_le(4)? as i32),
        };
        Ok(Operand::imm(value, size))
    }

    /// `moffs` operand; `FS`/`GS` overrides make it segment-relative.
    fn moffs(&mut self, size: OperandSize) -> Result<Operand, DecodeError> {
        let value = self.cur.read_le(4)?;
        Ok(match self.prefixes.base_segment() {
            Some(index) => Operand::Segment {
                index,
                size,
                indirect: true,
                displacement: Some(value as i32),
            },
            None => Operand::MemoryOffset { value, size },
        })
    }

    fn rm_operand(&mut self, modrm: ModRm, size: OperandSize) -> Result<Operand, DecodeError> {
        if modrm.mod_bits == 3 {
            return Ok(Operand::reg(modrm.rm, size));
        }

        if modrm.rm == 4 {
            let (scale_bits, index_code, base_code) = parse_sib(self.cur.read_u8()?);
            let index = (index_code != 4).then_some(index_code);
            let (base, mut displacement) = if base_code == 5 && modrm.mod_bits == 0 {
                (None, Some(self.cur.read_le(4)? as i32))
            } else {
                (Some(base_code), None)
            };
            if let Some(disp) = self.displacement(modrm)? {
                displacement = Some(displacement.unwrap_or(0).wrapping_add(disp));
            }
            return Ok(Operand::ScaledIndexBase {
                base,
                index,
                scale: 1u8 << scale_bits,
                displacement,
                size,
                indirect: true,
            });
        }

        if modrm.rm == 5 && modrm.mod_bits == 0 {
            // Absolute disp32.
            let disp = self.cur.read_le(4)?;
            return Ok(match self.prefixes.base_segment() {
                Some(index) => Operand::Segment {
                    index,
                    size,
                    indirect: true,
                    displacement: Some(disp as i32),
                },
                None => Operand::Immediate {
                    value: i64::from(disp),
                    size,
                    indirect: true,
                    displacement: None,
                },
            });
        }

        Ok(Operand::Register {
            index: modrm.rm,
            size,
            indirect: true,
            displacement: self.displacement(modrm)?,
        })
    }

    fn displacement(&mut self, modrm: ModRm) -> Result<Option<i32>, DecodeError> {
        Ok(match modrm.mod_bits {
            1 => Some(i32::from(self.cur.read_u8()? as i8)),
            2 => Some(self.cur.read_le(4)? as i32),
            _ => None,
        })
    }

    fn decode(&mut self, shape: Shape) -> Result<Vec<Operand>, DecodeError> {
        let acc = |size| Operand::reg(reg::EAX, size);
        Ok(match shape {
            Shape::None => Vec::new(),
            Shape::RmReg(w) => {
                let m = self.modrm()?;
                let size = self.size(w);
                vec![self.rm_operand(m, size)?, Operand::reg(m.reg, size)]
            }
            Shape::RegRm(w) => {
                let m = self.modrm()?;
                let size = self.size(w);
                vec![Operand::reg(m.reg, size), self.rm_operand(m, size)?]
            }
            Shape::RegRmWiden(w) => {
                let m = self.modrm()?;
                let dst = Operand::reg(m.reg, self.size(Width::Vz));
                let src_size = self.size(w);
                vec![dst, self.rm_operand(m, src_size)?]
            }
            Shape::RmSreg => {
                let m = self.modrm()?;
                let size = if m.mod_bits == 3 {
                    self.size(Width::Vz)
                } else {
                    OperandSize::Bits16
                };
                vec![self.rm_operand(m, size)?, segment(m.reg)]
            }
            Shape::SregRm => {
                let m = self.modrm()?;
                vec![segment(m.reg), self.rm_operand(m, OperandSize::Bits16)?]
            }
            Shape::AccImm(w, imm) => {
                let size = self.size(w);
                vec![acc(size), self.immediate(imm, size)?]
            }
            Shape::RmImm(w, imm) => {
                let m = self.modrm()?;
                let size = self.size(w);
                let rm = self.rm_operand(m, size)?;
                let imm_size = if imm == Imm::Ub { OperandSize::Bits8 } else { size };
                vec![rm, self.immediate(imm, imm_size)?]
            }
            Shape::RegRmImm(w, imm) => {
                let m = self.modrm()?;
                let size = self.size(w);
                let rm = self.rm_operand(m, size)?;
                vec![Operand::reg(m.reg, size), rm, self.immediate(imm, size)?]
            }
            Shape::OpReg(w) => vec![Operand::reg(self.opcode_reg(), self.size(w))],
            Shape::OpRegImm(w, imm) => {
                let size = self.size(w);
                vec![
                    Operand::reg(self.opcode_reg(), size),
                    self.immediate(imm, size)?,
                ]
            }
            Shape::OpRegAcc(w) => {
                let size = self.size(w);
                vec![Operand::reg(self.opcode_reg(), size), acc(size)]
            }
            Shape::Imm(imm) => {
                let size = match imm {
                    Imm::Ub => OperandSize::Bits8,
                    Imm::Iw => OperandSize::Bits16,
                    Imm::Ib | Imm::Iz => self.size(Width::Vz),
                };
                vec![self.immediate(imm, size)?]
            }
            Shape::ImmConst(value) => vec![Operand::imm(value, OperandSize::Bits8)],
            Shape::Rel(imm) => {
                let size = match imm {
                    Imm::Ib | Imm::Ub => OperandSize::Bits8,
                    Imm::Iw => OperandSize::Bits16,
                    Imm::Iz => self.size(Width::Vz),
                };
                vec![self.immediate(imm, size)?]
            }
            Shape::Rm(w) => {
                let m = self.modrm()?;
                let size = self.size(w);
                vec![self.rm_operand(m, size)?]
            }
            Shape::RmOne(w) => {
                let m = self.modrm()?;
                let size = self.size(w);
                vec![self.rm_operand(m, size)?, Operand::imm(1, OperandSize::Bits8)]
            }
            Shape::RmCl(w) => {
                let m = self.modrm()?;
                let size = self.size(w);
                vec![
                    self.rm_operand(m, size)?,
                    Operand::reg(reg::ECX, OperandSize::Bits8),
                ]
            }
            Shape::AccMoffs(w) => {
                let size = self.size(w);
                vec![acc(size), self.moffs(size)?]
            }
            Shape::MoffsAcc(w) => {
                let size = self.size(w);
                vec![self.moffs(size)?, acc(size)]
            }
            Shape::Movs(w) => {
                let size = self.size(w);
                vec![string_ptr(reg::EDI, size), string_ptr(reg::ESI, size)]
            }
            Shape::Stos(w) => {
                let size = self.size(w);
                vec![string_ptr(reg::EDI, size), acc(size)]
            }
            Shape::XmmRm => {
                let m = self.modrm()?;
                let rm = self.rm_operand(m, OperandSize::Bits128)?;
                vec![Operand::reg(m.reg, OperandSize::Bits128), rm]
            }
            Shape::RmXmm => {
                let m = self.modrm()?;
                let rm = self.rm_operand(m, OperandSize::Bits128)?;
                vec![rm, Operand::reg(m.reg, OperandSize::Bits128)]
            }
            Shape::FarPtr => {
                let offset = self.immediate(Imm::Iz, self.size(Width::Vz))?;
                let selector = self.immediate(Imm::Iw, OperandSize::Bits16)?;
                vec![selector, offset]
            }
            Shape::ModrmExact(byte) => {
                let m = self.modrm()?;
                if m.byte() != byte {
                    return Err(DecodeError::UnknownOpcode {
                        address: self.cur.address,
                        opcode: self.opcode,
                    });
                }
                Vec::new()
            }
        })
    }
}

fn segment(index: u8) -> Operand {
    Operand::Segment {
        index,
        size: OperandSize::Bits16,
        indirect: false,
        displacement: None,
    }
}

fn string_ptr(index: u8, size: OperandSize) -> Operand {
    Operand::Register {
        index,
        size,
        indirect: true,
        displacement: None,
    }
}
