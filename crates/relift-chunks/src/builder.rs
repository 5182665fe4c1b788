use std::collections::VecDeque;

use relift_x86::{decode, DecodeError, Instruction, Mnemonic, Operand, OperandSize};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::image::Image;
use crate::program::{AddrRange, Chunk, Program};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryLimits {
    /// Maximum number of chunks before discovery gives up.
    pub max_chunks: usize,
    /// Maximum number of instructions in a single chunk.
    pub max_chunk_instructions: usize,
}

impl Default for DiscoveryLimits {
    fn default() -> Self {
        Self {
            max_chunks: 65_536,
            max_chunk_instructions: 65_536,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("address {address:#010x} is not mapped by any section")]
    Unmapped { address: u32 },
    #[error("discovery hit the {limit} limit at {address:#010x}")]
    LimitExceeded { limit: &'static str, address: u32 },
}

/// Partition the code reachable from `entries` into chunks.
///
/// Invariants of the returned [`Program`]:
/// - entries are visited in FIFO order and an entry already inside a covered range is skipped;
/// - conditional-branch targets stay in the chunk that found them (spliced after its code);
/// - direct `CALL` targets and direct `JMP` targets open new chunks;
/// - every covered address of a chunk maps to exactly one of its instructions.
pub fn discover(
    image: &Image,
    entries: &[u32],
    limits: DiscoveryLimits,
) -> Result<Program, DiscoveryError> {
    ChunkBuilder::new(image, limits).build(entries)
}

struct ChunkBuilder<'a> {
    image: &'a Image,
    limits: DiscoveryLimits,
    program: Program,
}

impl<'a> ChunkBuilder<'a> {
    fn new(image: &'a Image, limits: DiscoveryLimits) -> Self {
        Self {
            image,
            limits,
            program: Program::default(),
        }
    }

    fn build(mut self, entries: &[u32]) -> Result<Program, DiscoveryError> {
        for &entry in entries {
            self.enqueue(entry);
        }

        while let Some(entry) = self.program.pending.pop_front() {
            if self.program.is_covered(entry) {
                trace!(entry = format_args!("{entry:#010x}"), "entry already covered");
                continue;
            }
            if self.program.chunks.len() >= self.limits.max_chunks {
                return Err(DiscoveryError::LimitExceeded {
                    limit: "max_chunks",
                    address: entry,
                });
            }

            let chunk = self.build_chunk(entry)?;
            debug!(
                chunk = chunk.id,
                entry = format_args!("{entry:#010x}"),
                instructions = chunk.instructions.len(),
                ranges = chunk.covered_ranges.len(),
                "discovered chunk"
            );
            self.program.chunks.push(chunk);
        }

        Ok(self.program)
    }

    fn enqueue(&mut self, address: u32) {
        if self.program.is_covered(address) || self.program.pending.contains(&address) {
            return;
        }
        trace!(address = format_args!("{address:#010x}"), "queued chunk entry");
        self.program.pending.push_back(address);
    }

    fn build_chunk(&mut self, entry: u32) -> Result<Chunk, DiscoveryError> {
        let mut chunk = Chunk::new(self.program.chunks.len() as u32, entry);

        // Local pending ranges: the entry first, then conditional targets as runs close.
        let mut local = VecDeque::from([entry]);
        let mut first = true;
        while let Some(start) = local.pop_front() {
            if !first && self.program.is_covered(start) {
                continue;
            }
            first = false;
            trace!(chunk = chunk.id, start = format_args!("{start:#010x}"), "decoding run");
            let targets = self.decode_run(&mut chunk, start)?;
            local.extend(targets);
        }

        Ok(chunk)
    }

    /// Decode linearly from `start` until `JMP`/`RET` and return the uncovered conditional
    /// targets seen on the way.
    fn decode_run(&mut self, chunk: &mut Chunk, start: u32) -> Result<Vec<u32>, DiscoveryError> {
        let mut cursor = start;
        let mut targets = Vec::new();

        loop {
            if cursor != start && chunk.covers(cursor) {
                chunk.instructions.push(Instruction::fallthrough_jump(cursor));
                self.close_range(chunk, start, cursor);
                return Ok(targets);
            }
            if chunk.instructions.len() >= self.limits.max_chunk_instructions {
                return Err(DiscoveryError::LimitExceeded {
                    limit: "max_chunk_instructions",
                    address: cursor,
                });
            }

            let bytes = self
                .image
                .bytes_at(cursor)
                .ok_or(DiscoveryError::Unmapped { address: cursor })?;
            let (mut inst, _) = decode(bytes, cursor)?;

            if inst.mnemonic.is_conditional_jump() {
                if let Some(target) = inst.relative_target() {
                    if !self.program.is_covered(target) {
                        targets.push(target);
                    }
                }
            } else if inst.mnemonic == Mnemonic::Call {
                self.discover_call(&mut inst);
            }

            let next = inst.next_address;
            let ends_run = inst.mnemonic.ends_run();
            let jmp_target = if inst.mnemonic == Mnemonic::Jmp {
                inst.relative_target()
            } else {
                None
            };
            chunk.instructions.push(inst);

            if ends_run {
                self.close_range(chunk, start, next);
                if let Some(target) = jmp_target {
                    self.enqueue(target);
                }
                return Ok(targets);
            }
            cursor = next;
        }
    }

    fn discover_call(&mut self, inst: &mut Instruction) {
        if let Some(target) = inst.relative_target() {
            self.enqueue(target);
            return;
        }

        let Some(pointer) = inst.operands.first().and_then(Operand::indirect_immediate) else {
            return;
        };
        // Unmapped pointers are left for fixup to report.
        let Some(value) = self.image.read_u32(pointer) else {
            return;
        };
        // Thunks and values outside every section are classified by fixup.
        if self.image.imports.is_thunk(value) || self.image.section_for(value).is_none() {
            return;
        }

        let displacement = value.wrapping_sub(inst.next_address) as i32;
        trace!(
            address = format_args!("{:#010x}", inst.address),
            target = format_args!("{value:#010x}"),
            "call through code pointer"
        );
        inst.operands = vec![Operand::imm(i64::from(displacement), OperandSize::Bits32)];
        self.enqueue(value);
    }

    fn close_range(&mut self, chunk: &mut Chunk, start: u32, end: u32) {
        let range = AddrRange { start, end };
        chunk.covered_ranges.push(range);
        self.program.covered.push(range);
    }
}
