#![allow(dead_code)]

use relift::chunks::Image;
use relift::wasm::test_utils;
use relift::Recompiled;

pub use relift::wasm::test_utils::{initial_state, ExternCall, Machine, STACK_TOP};

pub const BASE: u32 = 0x1000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Map the image sections at their addresses and instantiate every recompiled module.
pub fn machine(image: &Image, recompiled: &Recompiled) -> test_utils::Machine {
    let segments: Vec<(u32, &[u8])> = image
        .sections
        .iter()
        .map(|section| {
            let start = section.file_offset as usize;
            let len = (section.addr_end - section.addr_start) as usize;
            let end = (start + len).min(image.buffer.len());
            (section.addr_start, &image.buffer[start..end])
        })
        .collect();
    Machine::new(&segments, &recompiled.modules)
}
