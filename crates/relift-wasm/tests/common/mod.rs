#![allow(dead_code)]

use relift_chunks::{discover, fixup, DiscoveryLimits, Image, Program};
use relift_wasm::test_utils::{self, validate_wasm};
use relift_wasm::{assemble, AssembleOptions, AssembledChunk, CpuState, X86};

pub use relift_wasm::test_utils::{initial_state, STACK_TOP};

pub const BASE: u32 = 0x1000;

pub fn resolved(code: &[u8]) -> (Image, Program) {
    let image = Image::flat(BASE, code.to_vec());
    let mut program = discover(&image, &[BASE], DiscoveryLimits::default()).unwrap();
    fixup(&mut program, &image).unwrap();
    (image, program)
}

/// Discover, fix up and assemble `code` mapped at [`BASE`], validating every module.
pub fn assemble_code(code: &[u8], options: &AssembleOptions) -> Vec<AssembledChunk> {
    let (_, program) = resolved(code);
    let chunks: Vec<_> = program
        .chunks
        .iter()
        .map(|chunk| assemble(chunk, &X86, options).unwrap())
        .collect();
    for chunk in &chunks {
        validate_wasm(&chunk.bytes);
    }
    chunks
}

/// Host machine with `code` mapped at [`BASE`].
pub fn machine(code: &[u8], chunks: &[AssembledChunk]) -> test_utils::Machine {
    test_utils::Machine::new(&[(BASE, code)], chunks)
}

/// Assemble and run `code` from its entry with `state`, returning the machine for inspection.
pub fn run_code(code: &[u8], state: &mut CpuState) -> test_utils::Machine {
    let chunks = assemble_code(code, &AssembleOptions::default());
    let mut machine = machine(code, &chunks);
    machine.run(0, state).unwrap();
    machine
}
