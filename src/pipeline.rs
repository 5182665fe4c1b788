use relift_chunks::{discover, fixup, Image, Program};
use relift_wasm::{assemble, AssembleError, AssembledChunk, Architecture, X86};
use tracing::debug;

use crate::error::RecompileError;
use crate::options::RecompileOptions;

/// Output of a full run: the resolved chunk set and one module per chunk, in chunk order.
#[derive(Debug, Clone)]
pub struct Recompiled {
    pub program: Program,
    pub modules: Vec<AssembledChunk>,
}

impl Recompiled {
    /// Disassembly listing of every chunk, with branch targets marked.
    pub fn listing(&self) -> String {
        self.program
            .chunks
            .iter()
            .map(|chunk| chunk.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Runs discovery, fixup and assembly in that order.
pub struct Recompiler<A = X86> {
    options: RecompileOptions,
    arch: A,
}

impl Recompiler<X86> {
    pub fn new(options: RecompileOptions) -> Self {
        Self::with_arch(options, X86)
    }
}

impl<A: Architecture> Recompiler<A> {
    pub fn with_arch(options: RecompileOptions, arch: A) -> Self {
        Self { options, arch }
    }

    pub fn options(&self) -> &RecompileOptions {
        &self.options
    }

    /// Discover chunks from the image entry followed by the configured extra entries.
    pub fn discover(&self, image: &Image) -> Result<Program, RecompileError> {
        let mut entries = Vec::with_capacity(1 + self.options.extra_entries.len());
        entries.push(image.entry);
        entries.extend_from_slice(&self.options.extra_entries);
        Ok(discover(image, &entries, self.options.limits)?)
    }

    /// Discover and fix up; the returned program is ready for assembly.
    pub fn resolve(&self, image: &Image) -> Result<Program, RecompileError> {
        let mut program = self.discover(image)?;
        fixup(&mut program, image)?;
        Ok(program)
    }

    /// Assemble every chunk of a resolved program.
    pub fn assemble(&self, program: &Program) -> Result<Vec<AssembledChunk>, RecompileError> {
        if !program.resolved {
            return Err(AssembleError::UnresolvedProgram.into());
        }
        program
            .chunks
            .iter()
            .map(|chunk| {
                assemble(chunk, &self.arch, &self.options.assemble).map_err(|source| {
                    RecompileError::Assemble {
                        chunk: chunk.name.clone(),
                        source,
                    }
                })
            })
            .collect()
    }

    pub fn recompile(&self, image: &Image) -> Result<Recompiled, RecompileError> {
        let program = self.resolve(image)?;
        let modules = self.assemble(&program)?;
        debug!(
            chunks = program.chunks.len(),
            bytes = modules.iter().map(|m| m.bytes.len()).sum::<usize>(),
            "recompiled image"
        );
        Ok(Recompiled { program, modules })
    }
}
