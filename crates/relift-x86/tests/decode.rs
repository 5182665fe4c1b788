use relift_x86::{decode, reg, Cond, DecodeError, Mnemonic, Operand, OperandSize, Prefixes};

fn decode_at(bytes: &[u8], address: u32) -> relift_x86::Instruction {
    let (inst, len) = decode(bytes, address).unwrap();
    assert_eq!(inst.len() as usize, len);
    inst
}

#[test]
fn mov_eax_imm32() {
    let inst = decode_at(&[0xb8, 0x05, 0x00, 0x00, 0x00], 0x1000);
    assert_eq!(inst.mnemonic, Mnemonic::Mov);
    assert_eq!(inst.opcode, 0xb8);
    assert_eq!(
        inst.operands,
        vec![
            Operand::reg(reg::EAX, OperandSize::Bits32),
            Operand::imm(5, OperandSize::Bits32)
        ]
    );
    assert_eq!(inst.next_address, 0x1005);
}

#[test]
fn add_imm8_is_sign_extended_and_duplicates_destination() {
    // add eax, -1
    let inst = decode_at(&[0x83, 0xc0, 0xff], 0x1000);
    assert_eq!(inst.mnemonic, Mnemonic::Add);
    assert_eq!(
        inst.operands,
        vec![
            Operand::reg(reg::EAX, OperandSize::Bits32),
            Operand::reg(reg::EAX, OperandSize::Bits32),
            Operand::imm(-1, OperandSize::Bits32)
        ]
    );
}

#[test]
fn cmp_keeps_two_operands() {
    // cmp ecx, edx
    let inst = decode_at(&[0x39, 0xd1], 0x1000);
    assert_eq!(inst.mnemonic, Mnemonic::Cmp);
    assert_eq!(
        inst.operands,
        vec![
            Operand::reg(reg::ECX, OperandSize::Bits32),
            Operand::reg(reg::EDX, OperandSize::Bits32)
        ]
    );
}

#[test]
fn dec_ecx_register_in_opcode() {
    let inst = decode_at(&[0x49], 0x2000);
    assert_eq!(inst.mnemonic, Mnemonic::Dec);
    assert_eq!(
        inst.operands,
        vec![Operand::reg(reg::ECX, OperandSize::Bits32)]
    );
    assert_eq!(inst.len(), 1);
}

#[test]
fn short_jcc_stores_raw_displacement() {
    let inst = decode_at(&[0x75, 0xfd], 0x1001);
    assert_eq!(inst.mnemonic, Mnemonic::Jcc(Cond::Ne));
    assert_eq!(inst.operands, vec![Operand::imm(-3, OperandSize::Bits8)]);
    assert_eq!(inst.relative_target(), Some(0x1000));
}

#[test]
fn near_jcc_two_byte_opcode() {
    // jg +0x10
    let inst = decode_at(&[0x0f, 0x8f, 0x10, 0x00, 0x00, 0x00], 0x1000);
    assert_eq!(inst.opcode, 0x0f8f);
    assert_eq!(inst.mnemonic, Mnemonic::Jcc(Cond::G));
    assert_eq!(inst.relative_target(), Some(0x1016));
}

#[test]
fn call_rel32_target() {
    let inst = decode_at(&[0xe8, 0xfb, 0x0f, 0x00, 0x00], 0x1000);
    assert_eq!(inst.mnemonic, Mnemonic::Call);
    assert_eq!(inst.relative_target(), Some(0x2000));
}

#[test]
fn call_through_absolute_pointer_is_indirect_immediate() {
    let inst = decode_at(&[0xff, 0x15, 0x00, 0x20, 0x40, 0x00], 0x401000);
    assert_eq!(inst.mnemonic, Mnemonic::Call);
    assert_eq!(
        inst.operands,
        vec![Operand::Immediate {
            value: 0x402000,
            size: OperandSize::Bits32,
            indirect: true,
            displacement: None,
        }]
    );
    assert_eq!(inst.operands[0].indirect_immediate(), Some(0x402000));
    assert_eq!(inst.relative_target(), None);
}

#[test]
fn far_call_and_jump_decode_selector_and_offset() {
    // call 0x8:0x401000
    let call = decode_at(&[0x9a, 0x00, 0x10, 0x40, 0x00, 0x08, 0x00], 0x1000);
    assert_eq!(call.mnemonic, Mnemonic::Call);
    assert_eq!(
        call.operands,
        vec![
            Operand::imm(8, OperandSize::Bits16),
            Operand::imm(0x401000, OperandSize::Bits32)
        ]
    );
    assert_eq!(call.next_address, 0x1007);
    assert_eq!(call.far_target(), Some(0x401000));
    assert_eq!(call.relative_target(), None);
    assert_eq!(call.to_string(), "CALL FAR 0x8:0x401000");

    // jmp 0x33:0x402000
    let jmp = decode_at(&[0xea, 0x00, 0x20, 0x40, 0x00, 0x33, 0x00], 0x1000);
    assert_eq!(jmp.mnemonic, Mnemonic::Jmp);
    assert_eq!(jmp.far_target(), Some(0x402000));
    assert_eq!(jmp.to_string(), "JMP FAR 0x33:0x402000");

    // The near forms have no far target.
    assert_eq!(decode_at(&[0xff, 0xe0], 0x1000).far_target(), None);
}

#[test]
fn far_returns_decode_as_ret() {
    let retf = decode_at(&[0xcb], 0x1000);
    assert_eq!(retf.mnemonic, Mnemonic::Ret);
    assert!(retf.operands.is_empty());

    let retf_imm = decode_at(&[0xca, 0x08, 0x00], 0x1000);
    assert_eq!(retf_imm.mnemonic, Mnemonic::Ret);
    assert_eq!(retf_imm.operands, vec![Operand::imm(8, OperandSize::Bits16)]);
    assert_eq!(retf_imm.next_address, 0x1003);
}

#[test]
fn xgetbv_needs_its_exact_modrm() {
    let inst = decode_at(&[0x0f, 0x01, 0xd0], 0x1000);
    assert_eq!(inst.mnemonic, Mnemonic::Xgetbv);
    assert!(inst.operands.is_empty());

    // lgdt [eax] shares /2 but takes a memory operand.
    assert_eq!(
        decode(&[0x0f, 0x01, 0x10], 0x1000),
        Err(DecodeError::UnknownOpcode {
            address: 0x1000,
            opcode: 0x0f01
        })
    );
    // 0F 01 D1 is XSETBV.
    assert_eq!(
        decode(&[0x0f, 0x01, 0xd1], 0x1000),
        Err(DecodeError::UnknownOpcode {
            address: 0x1000,
            opcode: 0x0f01
        })
    );
}

#[test]
fn jmp_register_is_direct_register_operand() {
    let inst = decode_at(&[0xff, 0xe0], 0x1000);
    assert_eq!(inst.mnemonic, Mnemonic::Jmp);
    assert_eq!(
        inst.operands,
        vec![Operand::reg(reg::EAX, OperandSize::Bits32)]
    );
}

#[test]
fn operand_size_override_narrows_immediates() {
    let inst = decode_at(&[0x66, 0xb8, 0x34, 0x12], 0x1000);
    assert!(inst.prefixes.contains(Prefixes::OPERAND_SIZE));
    assert_eq!(
        inst.operands,
        vec![
            Operand::reg(reg::EAX, OperandSize::Bits16),
            Operand::imm(0x1234, OperandSize::Bits16)
        ]
    );
    assert_eq!(inst.len(), 4);

    let inst = decode_at(&[0x66, 0x05, 0x34, 0x12], 0x1000);
    assert_eq!(inst.mnemonic, Mnemonic::Add);
    assert_eq!(inst.len(), 4);
}

#[test]
fn shift_group_selects_by_reg_field() {
    // shr eax, 4
    let inst = decode_at(&[0xc1, 0xe8, 0x04], 0x1000);
    assert_eq!(inst.mnemonic, Mnemonic::Shr);
    assert_eq!(
        inst.operands,
        vec![
            Operand::reg(reg::EAX, OperandSize::Bits32),
            Operand::reg(reg::EAX, OperandSize::Bits32),
            Operand::imm(4, OperandSize::Bits8)
        ]
    );

    // sar byte ptr [ebx], cl
    let inst = decode_at(&[0xd2, 0x3b], 0x1000);
    assert_eq!(inst.mnemonic, Mnemonic::Sar);
    assert_eq!(inst.operands[2], Operand::reg(reg::ECX, OperandSize::Bits8));
}

#[test]
fn fs_moffs_becomes_segment_relative() {
    // mov eax, fs:[0]
    let inst = decode_at(&[0x64, 0xa1, 0x00, 0x00, 0x00, 0x00], 0x1000);
    assert_eq!(
        inst.operands[1],
        Operand::Segment {
            index: reg::FS,
            size: OperandSize::Bits32,
            indirect: true,
            displacement: Some(0),
        }
    );
}

#[test]
fn moffs_without_override() {
    let inst = decode_at(&[0xa3, 0x78, 0x56, 0x34, 0x12], 0x1000);
    assert_eq!(
        inst.operands,
        vec![
            Operand::MemoryOffset {
                value: 0x1234_5678,
                size: OperandSize::Bits32
            },
            Operand::reg(reg::EAX, OperandSize::Bits32)
        ]
    );
}

#[test]
fn movzx_widens_source() {
    let inst = decode_at(&[0x0f, 0xb6, 0xc1], 0x1000);
    assert_eq!(inst.mnemonic, Mnemonic::Movzx);
    assert_eq!(
        inst.operands,
        vec![
            Operand::reg(reg::EAX, OperandSize::Bits32),
            Operand::reg(reg::ECX, OperandSize::Bits8)
        ]
    );
}

#[test]
fn nop_shadows_xchg_eax_eax() {
    assert_eq!(decode_at(&[0x90], 0).mnemonic, Mnemonic::Nop);
    let xchg = decode_at(&[0x91], 0);
    assert_eq!(xchg.mnemonic, Mnemonic::Xchg);
    assert_eq!(
        xchg.operands,
        vec![
            Operand::reg(reg::ECX, OperandSize::Bits32),
            Operand::reg(reg::EAX, OperandSize::Bits32)
        ]
    );
}

#[test]
fn int3_has_fixed_vector() {
    let inst = decode_at(&[0xcc], 0);
    assert_eq!(inst.mnemonic, Mnemonic::Int);
    assert_eq!(inst.operands, vec![Operand::imm(3, OperandSize::Bits8)]);
}

#[test]
fn display_uses_intel_syntax() {
    let inst = decode_at(&[0x8b, 0x44, 0x24, 0x04], 0x1000);
    assert_eq!(inst.to_string(), "MOV eax, dword ptr [esp+0x4]");

    let inst = decode_at(&[0xf3, 0xab], 0x1000);
    assert_eq!(inst.to_string(), "REP STOS dword ptr [edi], eax");

    let inst = decode_at(&[0x80, 0x7d, 0xf8, 0x2a], 0x1000);
    assert_eq!(inst.to_string(), "CMP byte ptr [ebp-0x8], 0x2a");
}

#[test]
fn unknown_opcode_reports_address_and_opcode() {
    assert_eq!(
        decode(&[0x0f, 0x0b], 0x4010),
        Err(DecodeError::UnknownOpcode {
            address: 0x4010,
            opcode: 0x0f0b
        })
    );
    assert_eq!(
        decode(&[0xd8, 0xc0], 0x10),
        Err(DecodeError::UnknownOpcode {
            address: 0x10,
            opcode: 0xd8
        })
    );
}

#[test]
fn truncated_buffer_is_unexpected_eof() {
    assert_eq!(
        decode(&[0xb8, 0x05], 0x20),
        Err(DecodeError::UnexpectedEof { address: 0x20 })
    );
    assert_eq!(
        decode(&[], 0x20),
        Err(DecodeError::UnexpectedEof { address: 0x20 })
    );
}

#[test]
fn prefix_flood_is_too_long() {
    let mut bytes = vec![0x66; 15];
    bytes.push(0x90);
    assert_eq!(
        decode(&bytes, 0x30),
        Err(DecodeError::TooLong { address: 0x30 })
    );
}

#[test]
fn instruction_serializes_to_json() {
    let inst = decode_at(&[0x8b, 0x44, 0x24, 0x04], 0x1000);
    let json = serde_json::to_string(&inst).unwrap();
    let back: relift_x86::Instruction = serde_json::from_str(&json).unwrap();
    assert_eq!(back, inst);
}
