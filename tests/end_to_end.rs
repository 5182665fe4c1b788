mod harness;

use harness::{init_tracing, initial_state, ExternCall, BASE, STACK_TOP};
use relift::chunks::{Image, ImportEntry, ImportModule, ImportTable};
use relift::wasm::{AssembleError, FunctionImport};
use relift::x86::reg;
use relift::{RecompileError, RecompileOptions, Recompiler};

const EXIT_PROCESS_THUNK: u32 = 0x7000_0010;

fn kernel32() -> ImportTable {
    ImportTable::new(vec![ImportModule {
        dll_name: "KERNEL32".to_string(),
        entries: vec![ImportEntry {
            hint_or_ordinal: 0x11,
            name: Some("ExitProcess".to_string()),
            thunk_address: EXIT_PROCESS_THUNK,
        }],
    }])
}

/// Code at [`BASE`] followed by an import slot at `BASE + 0x1000` holding the ExitProcess thunk.
fn image_with_import_slot(code: &[u8]) -> Image {
    let mut buffer = code.to_vec();
    buffer.resize(0x1000, 0xcc);
    buffer.extend_from_slice(&EXIT_PROCESS_THUNK.to_le_bytes());
    Image::flat(BASE, buffer).with_imports(kernel32())
}

#[test]
fn mov_add_ret() {
    init_tracing();
    // mov eax, 5; add eax, 3; ret
    let image = Image::flat(BASE, vec![0xb8, 0x05, 0x00, 0x00, 0x00, 0x83, 0xc0, 0x03, 0xc3]);
    let recompiled = Recompiler::new(RecompileOptions::default())
        .recompile(&image)
        .unwrap();
    assert_eq!(recompiled.modules.len(), 1);

    let mut machine = harness::machine(&image, &recompiled);
    let mut state = initial_state();
    machine.run(0, &mut state).unwrap();
    assert_eq!(state.gpr[reg::EAX as usize], 8);
    assert_eq!(state.gpr[reg::ESP as usize], STACK_TOP + 4);
}

#[test]
fn countdown_loop_runs_three_times() {
    init_tracing();
    // mov ecx, 3; dec ecx; jnz -3; ret
    let image = Image::flat(BASE, vec![0xb9, 0x03, 0x00, 0x00, 0x00, 0x49, 0x75, 0xfd, 0xc3]);
    let options = RecompileOptions::from_json(r#"{"assemble": {"debug_hooks": true}}"#).unwrap();
    let recompiled = Recompiler::new(options).recompile(&image).unwrap();

    let mut machine = harness::machine(&image, &recompiled);
    let mut state = initial_state();
    machine.run(0, &mut state).unwrap();

    let dec_hits = machine
        .host()
        .debugger_hits
        .iter()
        .filter(|&&index| index == 1)
        .count();
    assert_eq!(dec_hits, 3);
    assert_eq!(state.gpr[reg::ECX as usize], 0);
}

#[test]
fn cross_chunk_call_and_jump() {
    init_tracing();
    let image = Image::flat(
        BASE,
        vec![
            0xb8, 0x02, 0x00, 0x00, 0x00, // mov eax, 2
            0xe8, 0x06, 0x00, 0x00, 0x00, // call 0x1010
            0x83, 0xc0, 0x01, // add eax, 1
            0xeb, 0x04, // jmp 0x1013
            0x90, // nop (unreached)
            0x01, 0xc0, // 0x1010: add eax, eax
            0xc3, // ret
            0xbb, 0x09, 0x00, 0x00, 0x00, // 0x1013: mov ebx, 9
            0xc3, // ret
        ],
    );
    let recompiled = Recompiler::new(RecompileOptions::default())
        .recompile(&image)
        .unwrap();
    let names: Vec<_> = recompiled
        .program
        .chunks
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(names, ["FUN_00001000", "FUN_00001010", "FUN_00001013"]);
    assert_eq!(
        recompiled.modules[0].function_imports,
        vec![
            FunctionImport {
                module: "chunk1".to_string(),
                name: "entry".to_string(),
            },
            FunctionImport {
                module: "chunk2".to_string(),
                name: "entry".to_string(),
            },
        ]
    );

    let mut machine = harness::machine(&image, &recompiled);
    let mut state = initial_state();
    machine.run(0, &mut state).unwrap();
    assert_eq!(state.gpr[reg::EAX as usize], 5);
    assert_eq!(state.gpr[reg::EBX as usize], 9);
    assert_eq!(state.gpr[reg::ESP as usize], STACK_TOP + 4);
}

#[test]
fn extern_call_through_import_thunk() {
    init_tracing();
    // push 0x2a; call [0x2000]; add esp, 4; ret
    let image = image_with_import_slot(&[
        0x6a, 0x2a, 0xff, 0x15, 0x00, 0x20, 0x00, 0x00, 0x83, 0xc4, 0x04, 0xc3,
    ]);
    let recompiled = Recompiler::new(RecompileOptions::default())
        .recompile(&image)
        .unwrap();
    assert!(recompiled
        .listing()
        .contains("EXTERN KERNEL32::ExitProcess"));
    assert_eq!(
        recompiled.modules[0].function_imports,
        vec![FunctionImport {
            module: "KERNEL32".to_string(),
            name: "ExitProcess".to_string(),
        }]
    );

    let mut machine = harness::machine(&image, &recompiled);
    let mut state = initial_state();
    machine.run(0, &mut state).unwrap();
    assert_eq!(
        machine.host().extern_calls,
        vec![ExternCall {
            symbol: "KERNEL32::ExitProcess".to_string(),
            return_address: BASE + 8,
            first_arg: 0x2a,
        }]
    );
    assert_eq!(state.gpr[reg::ESP as usize], STACK_TOP + 4);
}

#[test]
fn extern_tail_jump_returns_to_the_caller() {
    init_tracing();
    // call 0x1010; ret; ...; 0x1010: jmp [0x2000]
    let mut code = vec![0xe8, 0x0b, 0x00, 0x00, 0x00, 0xc3];
    code.resize(0x10, 0x90);
    code.extend_from_slice(&[0xff, 0x25, 0x00, 0x20, 0x00, 0x00]);
    let image = image_with_import_slot(&code);
    let recompiled = Recompiler::new(RecompileOptions::default())
        .recompile(&image)
        .unwrap();
    assert_eq!(recompiled.modules.len(), 2);

    let mut machine = harness::machine(&image, &recompiled);
    let mut state = initial_state();
    machine.run(0, &mut state).unwrap();
    let calls = &machine.host().extern_calls;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].return_address, BASE + 5);
    assert_eq!(state.gpr[reg::ESP as usize], STACK_TOP + 4);
}

#[test]
fn extra_entries_from_json() {
    init_tracing();
    // ret; nop...; 0x1010: mov eax, 7; ret
    let mut code = vec![0xc3];
    code.resize(0x10, 0x90);
    code.extend_from_slice(&[0xb8, 0x07, 0x00, 0x00, 0x00, 0xc3]);
    let image = Image::flat(BASE, code);

    let options = RecompileOptions::from_json(
        r#"{
            "limits": {"max_chunks": 8},
            "extra_entries": [4112]
        }"#,
    )
    .unwrap();
    assert_eq!(options.limits.max_chunks, 8);
    assert_eq!(options.limits.max_chunk_instructions, 65_536);
    assert!(!options.assemble.debug_hooks);

    let recompiler = Recompiler::new(options);
    let recompiled = recompiler.recompile(&image).unwrap();
    assert_eq!(recompiled.program.chunks.len(), 2);
    assert_eq!(recompiled.program.chunks[1].entry, 0x1010);

    let mut machine = harness::machine(&image, &recompiled);
    let mut state = initial_state();
    machine.run(1, &mut state).unwrap();
    assert_eq!(state.gpr[reg::EAX as usize], 7);
}

#[test]
fn listing_marks_branch_targets() {
    let image = Image::flat(BASE, vec![0xb9, 0x03, 0x00, 0x00, 0x00, 0x49, 0x75, 0xfd, 0xc3]);
    let recompiled = Recompiler::new(RecompileOptions::default())
        .recompile(&image)
        .unwrap();
    let listing = recompiled.listing();
    assert!(listing.starts_with("FUN_00001000 (chunk 0):\n"));
    let dec = listing
        .lines()
        .find(|line| line.contains("00001005"))
        .unwrap();
    assert!(dec.starts_with('>'));
}

#[test]
fn errors_carry_their_stage() {
    let recompiler = Recompiler::new(RecompileOptions::default());

    // jmp 0x2000, outside the only section.
    let image = Image::flat(BASE, vec![0xe9, 0xfb, 0x0f, 0x00, 0x00]);
    let err = recompiler.recompile(&image).unwrap_err();
    assert!(matches!(err, RecompileError::Discovery(_)));

    // call [0x2000] where the slot holds neither a thunk nor a mapped address.
    let mut code = vec![0xff, 0x15, 0x00, 0x20, 0x00, 0x00, 0xc3];
    code.resize(0x1000, 0xcc);
    code.extend_from_slice(&0x1234_5678u32.to_le_bytes());
    let image = Image::flat(BASE, code).with_imports(kernel32());
    let err = recompiler.recompile(&image).unwrap_err();
    assert!(matches!(err, RecompileError::Fixup(_)));

    let image = Image::flat(BASE, vec![0xc3]);
    let program = recompiler.discover(&image).unwrap();
    let err = recompiler.assemble(&program).unwrap_err();
    assert!(matches!(
        err,
        RecompileError::Program(AssembleError::UnresolvedProgram)
    ));
}
