//! Reference fixup: rewrites every branch and call operand into a resolved target kind.

use relift_x86::{Instruction, Mnemonic, Operand, OperandSize, ResolvedTarget};
use thiserror::Error;
use tracing::debug;

use crate::image::Image;
use crate::program::{Chunk, Program};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixupError {
    #[error("branch at {address:#010x} reads a pointer that matches no import thunk")]
    UnresolvedImport { address: u32 },
    #[error("branch at {address:#010x} targets {target:#010x}, which no chunk covers")]
    UnresolvedBranch { address: u32, target: u32 },
    #[error(
        "branch at {address:#010x} targets {target:#010x}, which is not an instruction boundary"
    )]
    MisalignedBranch { address: u32, target: u32 },
    #[error("branch at {address:#010x} reads a code pointer {target:#010x} from memory")]
    PointerIntoChunk { address: u32, target: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rewrite {
    Extern { symbol: String, tail: bool },
    Local(u32),
    Remote { chunk: u32, index: u32 },
    Indeterminate(Mnemonic),
}

/// Resolve every `JMP`, `CALL`, `Jcc` and `JECXZ` operand of `program` in place.
///
/// Running it on an already resolved program is a no-op.
pub fn fixup(program: &mut Program, image: &Image) -> Result<(), FixupError> {
    if program.resolved {
        debug!("program already resolved");
        return Ok(());
    }

    for chunk_idx in 0..program.chunks.len() {
        for inst_idx in 0..program.chunks[chunk_idx].instructions.len() {
            let chunk = &program.chunks[chunk_idx];
            let inst = &chunk.instructions[inst_idx];
            let Some(rewrite) = resolve(program, chunk, inst, image)? else {
                continue;
            };
            apply(program, chunk_idx, inst_idx, rewrite);
        }
    }

    program.resolved = true;
    Ok(())
}

fn resolve(
    program: &Program,
    chunk: &Chunk,
    inst: &Instruction,
    image: &Image,
) -> Result<Option<Rewrite>, FixupError> {
    if !inst.mnemonic.is_branch() {
        return Ok(None);
    }

    if let Some(pointer) = inst.operands.first().and_then(Operand::indirect_immediate) {
        let value = image
            .read_u32(pointer)
            .ok_or(FixupError::UnresolvedImport {
                address: inst.address,
            })?;
        if let Some(symbol) = image.imports.symbol_for_thunk(value) {
            return Ok(Some(Rewrite::Extern {
                symbol,
                tail: inst.mnemonic == Mnemonic::Jmp,
            }));
        }
        if program.chunk_covering(value).is_some() {
            return Err(FixupError::PointerIntoChunk {
                address: inst.address,
                target: value,
            });
        }
        return Err(FixupError::UnresolvedImport {
            address: inst.address,
        });
    }

    if let Some(target) = inst.relative_target() {
        if let Some(index) = chunk.index_of(target) {
            return Ok(Some(Rewrite::Local(index)));
        }
        let owner = program
            .chunk_covering(target)
            .ok_or(FixupError::UnresolvedBranch {
                address: inst.address,
                target,
            })?;
        let index = owner.index_of(target).ok_or(FixupError::MisalignedBranch {
            address: inst.address,
            target,
        })?;
        return Ok(Some(Rewrite::Remote {
            chunk: owner.id,
            index,
        }));
    }

    // Register, SIB, segment, moffs and far targets are only known at run time. Jcc never takes
    // one.
    Ok(inst.mnemonic.indeterminate().map(Rewrite::Indeterminate))
}

fn apply(program: &mut Program, chunk_idx: usize, inst_idx: usize, rewrite: Rewrite) {
    let emitting = program.chunks[chunk_idx].id;
    match rewrite {
        Rewrite::Extern { symbol, tail } => {
            let inst = &mut program.chunks[chunk_idx].instructions[inst_idx];
            debug!(
                chunk = emitting,
                address = format_args!("{:#010x}", inst.address),
                symbol = %symbol,
                tail,
                "resolved external call"
            );
            inst.mnemonic = if tail {
                Mnemonic::ExternJmp
            } else {
                Mnemonic::Extern
            };
            inst.operands = vec![Operand::External { symbol }];
        }
        Rewrite::Local(index) => {
            let chunk = &mut program.chunks[chunk_idx];
            chunk.instructions[inst_idx].set_resolved_target(ResolvedTarget::Local { index });
            chunk.branch_targets.insert(index);
        }
        Rewrite::Remote { chunk, index } => {
            debug!(
                chunk = emitting,
                target_chunk = chunk,
                index,
                "resolved cross-chunk branch"
            );
            program.chunks[chunk_idx].instructions[inst_idx]
                .set_resolved_target(ResolvedTarget::Chunk { chunk, index });
            if let Some(target) = program.chunks.get_mut(chunk as usize) {
                target.branch_targets.insert(index);
            }
        }
        Rewrite::Indeterminate(mnemonic) => {
            let inst = &mut program.chunks[chunk_idx].instructions[inst_idx];
            debug!(
                chunk = emitting,
                address = format_args!("{:#010x}", inst.address),
                %mnemonic,
                "branch target known only at run time"
            );
            if let Some(offset) = inst.far_target() {
                inst.operands = vec![Operand::imm(i64::from(offset), OperandSize::Bits32)];
            }
            inst.mnemonic = mnemonic;
        }
    }
}
