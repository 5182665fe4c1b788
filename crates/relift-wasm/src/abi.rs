//! Import/export names shared by generated modules and the runtime that links them.

use bitflags::bitflags;
use relift_x86::reg;
use serde::{Deserialize, Serialize};

/// Module name of the imported linear memory.
pub const IMPORT_MODULE: &str = "env";

/// Imported linear memory. Guest virtual addresses are used as offsets unchanged.
pub const IMPORT_MEMORY: &str = "memory";

/// Module name of the register globals (architectural registers and scratch slots).
pub const REGISTERS_MODULE: &str = "registers";

/// Module name of the segment-register globals.
pub const SEGMENTS_MODULE: &str = "segments";

/// Module name of the runtime hooks.
pub const SYSTEM_MODULE: &str = "system";

/// `system.debugger() -> ()`, called before every instruction when debug hooks are enabled.
/// The instruction index is in `registers.t2`.
pub const IMPORT_DEBUGGER: &str = "debugger";

/// `system.indirectDispatch() -> ()`: transfer control to the code address in `registers.t1`.
pub const IMPORT_INDIRECT_DISPATCH: &str = "indirectDispatch";

/// `system.interrupt() -> ()`: raise the software interrupt whose vector is in `registers.t1`.
pub const IMPORT_INTERRUPT: &str = "interrupt";

/// Name of the single exported function, and of each `chunk<N>` import.
pub const EXPORT_ENTRY: &str = "entry";

/// Scratch globals appended after the architecture's registers.
///
/// - `link`: instruction index the dispatch loop resumes at on entry.
/// - `t1`: result of the last arithmetic instruction, or the argument of a system hook.
/// - `t2`: instruction index passed to `system.debugger`.
pub const SCRATCH_GLOBALS: [&str; 3] = ["link", "t1", "t2"];

/// Bit 1 of EFLAGS reads as one.
pub const EFLAGS_RESERVED: u32 = 1 << 1;

/// Import module of a chunk's `entry` function.
pub fn chunk_module(id: u32) -> String {
    format!("chunk{id}")
}

/// General-purpose registers followed by the status flags, in global import order.
pub const X86_REGISTERS: [&str; 15] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "cf", "pf", "af", "zf", "sf", "df",
    "of",
];

bitflags! {
    /// Status flags at their EFLAGS bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Flags: u32 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

impl Flags {
    /// Flags in the order their globals follow the general-purpose registers.
    pub const GLOBAL_ORDER: [Flags; 7] = [
        Flags::CF,
        Flags::PF,
        Flags::AF,
        Flags::ZF,
        Flags::SF,
        Flags::DF,
        Flags::OF,
    ];
}

/// Host-side copy of every global a chunk module imports.
///
/// A runtime owns one of these per guest thread and copies it into the module globals before a
/// call and back out afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub gpr: [u32; 8],
    pub flags: Flags,
    pub segments: [u32; 6],
    pub link: u32,
    pub t1: u32,
    pub t2: u32,
}

impl CpuState {
    /// `(module, name)` of every imported global, in module order.
    pub fn global_names() -> impl Iterator<Item = (&'static str, &'static str)> {
        X86_REGISTERS
            .into_iter()
            .chain(SCRATCH_GLOBALS)
            .map(|name| (REGISTERS_MODULE, name))
            .chain(reg::SEGMENT_NAMES.into_iter().map(|name| (SEGMENTS_MODULE, name)))
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        if let Some(i) = position(&reg::GPR32_NAMES, name) {
            return Some(self.gpr[i]);
        }
        if let Some(i) = position(&X86_REGISTERS[8..], name) {
            return Some(u32::from(self.flags.contains(Flags::GLOBAL_ORDER[i])));
        }
        if let Some(i) = position(&reg::SEGMENT_NAMES, name) {
            return Some(self.segments[i]);
        }
        match name {
            "link" => Some(self.link),
            "t1" => Some(self.t1),
            "t2" => Some(self.t2),
            _ => None,
        }
    }

    /// Store `value` into the slot called `name`. Flags take any non-zero value as set.
    /// Returns `false` for an unknown name.
    pub fn set(&mut self, name: &str, value: u32) -> bool {
        if let Some(i) = position(&reg::GPR32_NAMES, name) {
            self.gpr[i] = value;
        } else if let Some(i) = position(&X86_REGISTERS[8..], name) {
            self.flags.set(Flags::GLOBAL_ORDER[i], value != 0);
        } else if let Some(i) = position(&reg::SEGMENT_NAMES, name) {
            self.segments[i] = value;
        } else {
            match name {
                "link" => self.link = value,
                "t1" => self.t1 = value,
                "t2" => self.t2 = value,
                _ => return false,
            }
        }
        true
    }

    /// Packed EFLAGS as `PUSHFD` stores it.
    pub fn eflags(&self) -> u32 {
        self.flags.bits() | EFLAGS_RESERVED
    }

    pub fn set_eflags(&mut self, eflags: u32) {
        self.flags = Flags::from_bits_truncate(eflags);
    }
}

fn position(names: &[&str], name: &str) -> Option<usize> {
    names.iter().position(|n| *n == name)
}
