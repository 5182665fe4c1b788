use relift_chunks::{discover, AddrRange, DiscoveryError, DiscoveryLimits, Image, Program};
use relift_x86::{DecodeError, Mnemonic, Operand, OperandSize};

const BASE: u32 = 0x1000;

fn discover_flat(code: &[u8], entries: &[u32]) -> Program {
    let image = Image::flat(BASE, code.to_vec());
    discover(&image, entries, DiscoveryLimits::default()).unwrap()
}

fn mnemonics(program: &Program, chunk: usize) -> Vec<Mnemonic> {
    program.chunks[chunk]
        .instructions
        .iter()
        .map(|inst| inst.mnemonic)
        .collect()
}

/// Every covered address of a chunk falls inside exactly one of its instructions.
fn assert_coverage_invariant(program: &Program) {
    for chunk in &program.chunks {
        for range in &chunk.covered_ranges {
            for address in range.start..range.end {
                let owners = chunk
                    .instructions
                    .iter()
                    .filter(|inst| inst.address <= address && address < inst.next_address)
                    .count();
                assert_eq!(
                    owners, 1,
                    "{} covers {address:#x} with {owners} instructions",
                    chunk.name
                );
            }
        }
        for inst in &chunk.instructions {
            if !inst.is_empty() {
                assert!(chunk.covers(inst.address), "{inst} outside {}", chunk.name);
            }
        }
    }
}

#[test]
fn straight_line_code_is_one_chunk() {
    // mov eax, 5; add eax, 3; ret
    let code = [0xb8, 0x05, 0x00, 0x00, 0x00, 0x83, 0xc0, 0x03, 0xc3];
    let program = discover_flat(&code, &[BASE]);

    assert_eq!(program.chunks.len(), 1);
    let chunk = &program.chunks[0];
    assert_eq!(chunk.name, "FUN_00001000");
    assert_eq!(chunk.entry, BASE);
    assert_eq!(
        mnemonics(&program, 0),
        vec![Mnemonic::Mov, Mnemonic::Add, Mnemonic::Ret]
    );
    assert_eq!(
        chunk.covered_ranges,
        vec![AddrRange {
            start: 0x1000,
            end: 0x1009
        }]
    );
    assert!(program.pending.is_empty());
    assert!(!program.resolved);
    assert_coverage_invariant(&program);
}

#[test]
fn backward_loop_stays_in_its_run() {
    // mov ecx, 3; dec ecx; jnz -3; ret
    let code = [0xb9, 0x03, 0x00, 0x00, 0x00, 0x49, 0x75, 0xfd, 0xc3];
    let program = discover_flat(&code, &[BASE]);

    assert_eq!(program.chunks.len(), 1);
    assert_eq!(program.chunks[0].covered_ranges.len(), 1);
    assert_eq!(
        mnemonics(&program, 0),
        vec![
            Mnemonic::Mov,
            Mnemonic::Dec,
            Mnemonic::Jcc(relift_x86::Cond::Ne),
            Mnemonic::Ret
        ]
    );
    assert_coverage_invariant(&program);
}

#[test]
fn forward_conditional_target_is_spliced_after_the_run() {
    // 1000: test eax, eax
    // 1002: je 1005
    // 1004: ret
    // 1005: inc eax
    // 1006: ret
    let code = [0x85, 0xc0, 0x74, 0x01, 0xc3, 0x40, 0xc3];
    let program = discover_flat(&code, &[BASE]);

    assert_eq!(program.chunks.len(), 1);
    let chunk = &program.chunks[0];
    assert_eq!(
        chunk.covered_ranges,
        vec![
            AddrRange {
                start: 0x1000,
                end: 0x1005
            },
            AddrRange {
                start: 0x1005,
                end: 0x1007
            },
        ]
    );
    assert_eq!(chunk.index_of(0x1005), Some(3));
    assert_coverage_invariant(&program);
}

#[test]
fn spliced_run_reaching_covered_code_ends_in_fallthrough_jump() {
    // 1000: dec eax        <- je target
    // 1001: nop
    // 1002: nop
    // 1003: test eax, eax  <- entry
    // 1005: je 1000
    // 1007: ret
    let code = [0x48, 0x90, 0x90, 0x85, 0xc0, 0x74, 0xf9, 0xc3];
    let program = discover_flat(&code, &[0x1003]);

    assert_eq!(program.chunks.len(), 1);
    let chunk = &program.chunks[0];
    assert_eq!(chunk.name, "FUN_00001003");
    assert_eq!(chunk.instructions.len(), 7);

    let last = chunk.instructions.last().unwrap();
    assert!(last.is_fallthrough_jump());
    assert_eq!(last.address, 0x1003);
    assert_eq!(last.relative_target(), Some(0x1003));

    // The synthetic jump is never a lookup result.
    assert_eq!(chunk.index_of(0x1003), Some(0));
    assert_eq!(
        chunk.covered_ranges[1],
        AddrRange {
            start: 0x1000,
            end: 0x1003
        }
    );
    assert_coverage_invariant(&program);
}

#[test]
fn direct_call_opens_a_new_chunk() {
    // 1000: call 1006
    // 1005: ret
    // 1006: mov eax, 7
    // 100b: ret
    let code = [
        0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0xb8, 0x07, 0x00, 0x00, 0x00, 0xc3,
    ];
    let program = discover_flat(&code, &[BASE]);

    assert_eq!(program.chunks.len(), 2);
    assert_eq!(program.chunks[1].entry, 0x1006);
    assert_eq!(program.chunks[1].id, 1);
    assert_eq!(program.chunk_by_entry(0x1006).map(|c| c.id), Some(1));
    assert_coverage_invariant(&program);
}

#[test]
fn direct_jump_opens_a_new_chunk() {
    // 1000: jmp 1003
    // 1002: int3 (never reached)
    // 1003: ret
    let code = [0xeb, 0x01, 0xcc, 0xc3];
    let program = discover_flat(&code, &[BASE]);

    assert_eq!(program.chunks.len(), 2);
    assert_eq!(mnemonics(&program, 0), vec![Mnemonic::Jmp]);
    assert_eq!(program.chunks[1].entry, 0x1003);
    assert!(!program.is_covered(0x1002));
}

#[test]
fn call_through_code_pointer_is_rewritten_to_a_direct_call() {
    let mut code = vec![0u8; 0x18];
    // 1000: call dword ptr [0x1010]
    code[..6].copy_from_slice(&[0xff, 0x15, 0x10, 0x10, 0x00, 0x00]);
    // 1006: ret
    code[6] = 0xc3;
    // 1010: dd 0x1014
    code[0x10..0x14].copy_from_slice(&0x1014u32.to_le_bytes());
    // 1014: ret
    code[0x14] = 0xc3;

    let program = discover_flat(&code, &[BASE]);
    assert_eq!(program.chunks.len(), 2);

    let call = &program.chunks[0].instructions[0];
    assert_eq!(call.mnemonic, Mnemonic::Call);
    assert_eq!(call.operands, vec![Operand::imm(0x0e, OperandSize::Bits32)]);
    assert_eq!(call.relative_target(), Some(0x1014));
    assert_eq!(call.next_address, 0x1006);
    assert_eq!(program.chunks[1].entry, 0x1014);
}

#[test]
fn unmapped_code_pointer_is_left_for_fixup() {
    let mut code = vec![0u8; 0x18];
    // 1000: call dword ptr [0x1010]
    code[..6].copy_from_slice(&[0xff, 0x15, 0x10, 0x10, 0x00, 0x00]);
    // 1006: ret
    code[6] = 0xc3;
    // 1010: dd 0x12345678, neither a thunk nor a mapped address
    code[0x10..0x14].copy_from_slice(&0x1234_5678u32.to_le_bytes());

    let program = discover_flat(&code, &[BASE]);
    assert_eq!(program.chunks.len(), 1);
    let call = &program.chunks[0].instructions[0];
    assert_eq!(call.mnemonic, Mnemonic::Call);
    assert_eq!(call.operands[0].indirect_immediate(), Some(0x1010));
}

#[test]
fn entries_inside_covered_code_are_skipped() {
    let code = [0x90, 0x90, 0xc3];
    let program = discover_flat(&code, &[BASE, 0x1001, BASE]);
    assert_eq!(program.chunks.len(), 1);
}

#[test]
fn overlapping_entries_both_get_chunks() {
    // Entry 0x1001 is visited first, so 0x1000 is still uncovered when it is popped.
    let code = [0x90, 0x90, 0xc3];
    let program = discover_flat(&code, &[0x1001, BASE]);

    assert_eq!(program.chunks.len(), 2);
    assert!(program.chunks[1].covers(0x1001));
    assert_eq!(program.chunk_covering(0x1001).map(|c| c.id), Some(0));
    assert_coverage_invariant(&program);
}

#[test]
fn jump_out_of_the_image_is_unmapped() {
    let image = Image::flat(BASE, vec![0xeb, 0x10]);
    let err = discover(&image, &[BASE], DiscoveryLimits::default()).unwrap_err();
    assert_eq!(err, DiscoveryError::Unmapped { address: 0x1012 });
}

#[test]
fn decode_failure_aborts_discovery() {
    // ud2
    let image = Image::flat(BASE, vec![0x90, 0x0f, 0x0b]);
    let err = discover(&image, &[BASE], DiscoveryLimits::default()).unwrap_err();
    assert_eq!(
        err,
        DiscoveryError::Decode(DecodeError::UnknownOpcode {
            address: 0x1001,
            opcode: 0x0f0b
        })
    );
}

#[test]
fn running_off_the_section_is_an_eof() {
    let image = Image::flat(BASE, vec![0x90, 0xb8, 0x01]);
    let err = discover(&image, &[BASE], DiscoveryLimits::default()).unwrap_err();
    assert!(matches!(
        err,
        DiscoveryError::Decode(DecodeError::UnexpectedEof { address: 0x1001 })
    ));
}

#[test]
fn limits_bound_discovery() {
    let code = [
        0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0xb8, 0x07, 0x00, 0x00, 0x00, 0xc3,
    ];
    let image = Image::flat(BASE, code.to_vec());

    let limits = DiscoveryLimits {
        max_chunks: 1,
        ..DiscoveryLimits::default()
    };
    assert_eq!(
        discover(&image, &[BASE], limits).unwrap_err(),
        DiscoveryError::LimitExceeded {
            limit: "max_chunks",
            address: 0x1006
        }
    );

    let limits = DiscoveryLimits {
        max_chunk_instructions: 1,
        ..DiscoveryLimits::default()
    };
    assert!(matches!(
        discover(&image, &[BASE], limits).unwrap_err(),
        DiscoveryError::LimitExceeded {
            limit: "max_chunk_instructions",
            ..
        }
    ));
}

#[test]
fn limits_deserialize_with_defaults() {
    let limits: DiscoveryLimits = serde_json::from_str(r#"{"max_chunks": 4}"#).unwrap();
    assert_eq!(limits.max_chunks, 4);
    assert_eq!(
        limits.max_chunk_instructions,
        DiscoveryLimits::default().max_chunk_instructions
    );
}

#[test]
fn discovery_is_deterministic() {
    let code = [
        0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0x85, 0xc0, 0x74, 0x01, 0xc3, 0x40, 0xc3,
    ];
    let a = discover_flat(&code, &[BASE]);
    let b = discover_flat(&code, &[BASE]);
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}
