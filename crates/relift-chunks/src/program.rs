use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use relift_x86::Instruction;
use serde::{Deserialize, Serialize};

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddrRange {
    pub start: u32,
    pub end: u32,
}

impl AddrRange {
    pub fn contains(&self, address: u32) -> bool {
        self.start <= address && address < self.end
    }
}

pub fn chunk_name(entry: u32) -> String {
    format!("FUN_{entry:08X}")
}

/// A recovered function-like unit: straight-line code plus the conditional sub-blocks spliced
/// into it. Each chunk becomes one wasm module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: u32,
    pub name: String,
    pub entry: u32,
    pub instructions: Vec<Instruction>,
    pub covered_ranges: Vec<AddrRange>,
    /// Instruction indices reachable by a resolved branch. Filled in by fixup.
    pub branch_targets: BTreeSet<u32>,
}

impl Chunk {
    pub fn new(id: u32, entry: u32) -> Self {
        Self {
            id,
            name: chunk_name(entry),
            entry,
            instructions: Vec::new(),
            covered_ranges: Vec::new(),
            branch_targets: BTreeSet::new(),
        }
    }

    pub fn covers(&self, address: u32) -> bool {
        self.covered_ranges.iter().any(|r| r.contains(address))
    }

    /// Index of the instruction that starts at `address`. Fall-through jumps are never targets.
    pub fn index_of(&self, address: u32) -> Option<u32> {
        self.instructions
            .iter()
            .position(|inst| inst.address == address && !inst.is_fallthrough_jump())
            .map(|i| i as u32)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (chunk {}):", self.name, self.id)?;
        for (i, inst) in self.instructions.iter().enumerate() {
            let marker = if self.branch_targets.contains(&(i as u32)) {
                '>'
            } else {
                ' '
            };
            writeln!(f, "{marker}{i:>5}  {:08x}  {inst}", inst.address)?;
        }
        Ok(())
    }
}

/// The chunk set for one image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub chunks: Vec<Chunk>,
    /// Entry addresses waiting to be visited.
    pub pending: VecDeque<u32>,
    /// Every range covered by any chunk, in discovery order.
    pub covered: Vec<AddrRange>,
    /// Set once reference fixup has rewritten every branch operand.
    pub resolved: bool,
}

impl Program {
    pub fn is_covered(&self, address: u32) -> bool {
        self.covered.iter().any(|r| r.contains(address))
    }

    pub fn chunk(&self, id: u32) -> Option<&Chunk> {
        self.chunks.get(id as usize)
    }

    /// Lowest-id chunk whose ranges contain `address`.
    pub fn chunk_covering(&self, address: u32) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.covers(address))
    }

    pub fn chunk_by_entry(&self, entry: u32) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.entry == entry)
    }
}
