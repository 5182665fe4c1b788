use relift_chunks::Chunk;
use relift_x86::{Instruction as X86Instruction, Mnemonic, Operand, ResolvedTarget};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use wasm_encoder::{
    CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection, GlobalType,
    ImportSection, Instruction, MemoryType, Module, TypeSection, ValType,
};

use crate::abi::{
    chunk_module, EXPORT_ENTRY, IMPORT_MEMORY, IMPORT_MODULE, REGISTERS_MODULE, SCRATCH_GLOBALS,
    SEGMENTS_MODULE, SYSTEM_MODULE,
};
use crate::arch::Architecture;
use crate::dispatch::DispatchLoop;
use crate::emitter::{Emitter, GlobalLayout, SystemFunc};

/// Maximum number of 64KiB pages in a wasm32 linear memory (4GiB).
pub const WASM32_MAX_PAGES: u32 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssembleOptions {
    /// Call `system.debugger` before every instruction with its index in `registers.t2`.
    pub debug_hooks: bool,
    /// Minimum size (in 64KiB pages) of the imported `env.memory`.
    pub memory_min_pages: u32,
    /// Maximum size (in 64KiB pages) of the imported `env.memory`.
    pub memory_max_pages: Option<u32>,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            debug_hooks: false,
            memory_min_pages: 1,
            memory_max_pages: None,
        }
    }
}

impl AssembleOptions {
    fn validate_memory_import(&self) -> Result<(), AssembleError> {
        let max = self.memory_max_pages.unwrap_or(WASM32_MAX_PAGES);
        if self.memory_min_pages > max || max > WASM32_MAX_PAGES {
            return Err(AssembleError::InvalidMemoryLimits {
                min_pages: self.memory_min_pages,
                max_pages: self.memory_max_pages,
            });
        }
        Ok(())
    }
}

/// A function import other than the system hooks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionImport {
    pub module: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledChunk {
    pub bytes: Vec<u8>,
    /// `chunk<N>.entry` and external imports, in first-reference order.
    pub function_imports: Vec<FunctionImport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    #[error("cannot assemble {mnemonic} at {address:#010x}")]
    UnsupportedInstruction { mnemonic: Mnemonic, address: u32 },
    #[error("program has not been through reference fixup")]
    UnresolvedProgram,
    #[error("invalid env.memory limits: min {min_pages} pages, max {max_pages:?} pages")]
    InvalidMemoryLimits {
        min_pages: u32,
        max_pages: Option<u32>,
    },
}

/// Assemble one resolved chunk into a standalone module.
pub fn assemble<A: Architecture + ?Sized>(
    chunk: &Chunk,
    arch: &A,
    options: &AssembleOptions,
) -> Result<AssembledChunk, AssembleError> {
    options.validate_memory_import()?;

    let globals = GlobalLayout::new(arch.registers().len(), arch.segments().len());
    let mut e = Emitter::new(globals);
    let mut dispatch = DispatchLoop::open(&mut e, &chunk.branch_targets);

    for (index, inst) in chunk.instructions.iter().enumerate() {
        let index = index as u32;
        dispatch.before_instruction(&mut e, index);
        e.begin_instruction(inst.mnemonic, inst.address);

        if options.debug_hooks {
            let t2 = e.globals.t2();
            e.u32_const(index);
            e.global_set(t2);
            e.call_system(SystemFunc::Debugger);
        }

        arch.preprocess(&mut e, inst)?;
        lower(&mut e, arch, &dispatch, chunk, inst)?;
        arch.postprocess(&mut e, inst)?;
    }
    dispatch.close(&mut e);

    let (body, function_imports) = e.finish();
    let bytes = encode_module(arch, options, &body, &function_imports);
    debug!(
        chunk = %chunk.name,
        bytes = bytes.len(),
        imports = function_imports.len(),
        "assembled chunk"
    );
    Ok(AssembledChunk {
        bytes,
        function_imports,
    })
}

fn lower<A: Architecture + ?Sized>(
    e: &mut Emitter,
    arch: &A,
    dispatch: &DispatchLoop,
    chunk: &Chunk,
    inst: &X86Instruction,
) -> Result<(), AssembleError> {
    match inst.mnemonic {
        Mnemonic::Jmp => {
            let target = resolved(inst)?;
            jump(e, dispatch, target);
        }
        Mnemonic::Call => {
            let (module, index) = match resolved(inst)? {
                ResolvedTarget::Local { index } => (chunk_module(chunk.id), index),
                ResolvedTarget::Chunk { chunk, index } => (chunk_module(chunk), index),
            };
            let link = e.globals.link();
            e.u32_const(index);
            e.global_set(link);
            e.call_import(&module, EXPORT_ENTRY);
        }
        m if m.is_conditional_jump() => {
            let target = resolved(inst)?;
            let skip = e.block();
            arch.flag_test(e, inst)?;
            e.func.instruction(&Instruction::I32Eqz);
            e.br_if(skip);
            jump(e, dispatch, target);
            e.end();
        }
        Mnemonic::Extern | Mnemonic::ExternJmp => {
            let Some(Operand::External { symbol }) = inst.operands.first() else {
                return Err(e.unsupported());
            };
            let Some((module, name)) = symbol.split_once("::") else {
                return Err(e.unsupported());
            };
            e.call_import(module, name);
            if inst.mnemonic == Mnemonic::ExternJmp {
                e.ret();
            }
        }
        Mnemonic::ICall => e.call_system(SystemFunc::IndirectDispatch),
        Mnemonic::IJmp => {
            e.call_system(SystemFunc::IndirectDispatch);
            e.ret();
        }
        Mnemonic::Ret => e.ret(),
        Mnemonic::Int => {
            let [vector] = inst.operands.as_slice() else {
                return Err(e.unsupported());
            };
            let t1 = e.globals.t1();
            e.load_operand(arch, vector)?;
            e.global_set(t1);
            e.call_system(SystemFunc::Interrupt);
        }
        Mnemonic::Into => {
            let skip = e.block();
            arch.flag_test(e, inst)?;
            e.func.instruction(&Instruction::I32Eqz);
            e.br_if(skip);
            let t1 = e.globals.t1();
            e.i32_const(4);
            e.global_set(t1);
            e.call_system(SystemFunc::Interrupt);
            e.end();
        }
        Mnemonic::Nop => {}
        Mnemonic::Mov => {
            let [dst, src] = inst.operands.as_slice() else {
                return Err(e.unsupported());
            };
            e.load_operand(arch, src)?;
            e.store_operand(arch, dst)?;
        }
        _ => {
            if !arch.build_instruction(e, inst)? {
                return Err(e.unsupported());
            }
        }
    }
    Ok(())
}

fn resolved(inst: &X86Instruction) -> Result<ResolvedTarget, AssembleError> {
    inst.resolved_target().ok_or(AssembleError::UnresolvedProgram)
}

/// Local targets re-enter the dispatch loop; remote ones tail-call the owning chunk.
fn jump(e: &mut Emitter, dispatch: &DispatchLoop, target: ResolvedTarget) {
    match target {
        ResolvedTarget::Local { index } => dispatch.jump(e, index),
        ResolvedTarget::Chunk { chunk, index } => {
            let link = e.globals.link();
            e.u32_const(index);
            e.global_set(link);
            e.call_import(&chunk_module(chunk), EXPORT_ENTRY);
            e.ret();
        }
    }
}

fn encode_module<A: Architecture + ?Sized>(
    arch: &A,
    options: &AssembleOptions,
    body: &Function,
    function_imports: &[FunctionImport],
) -> Vec<u8> {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    let ty_void = types.len();
    types.ty().function([], []);
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import(
        IMPORT_MODULE,
        IMPORT_MEMORY,
        MemoryType {
            minimum: u64::from(options.memory_min_pages),
            maximum: options.memory_max_pages.map(u64::from),
            memory64: false,
            shared: false,
            page_size_log2: None,
        },
    );

    let global = EntityType::Global(GlobalType {
        val_type: ValType::I32,
        mutable: true,
        shared: false,
    });
    for name in arch.registers().iter().chain(SCRATCH_GLOBALS.iter()) {
        imports.import(REGISTERS_MODULE, name, global);
    }
    for name in arch.segments() {
        imports.import(SEGMENTS_MODULE, name, global);
    }

    for func in SystemFunc::ALL {
        imports.import(SYSTEM_MODULE, func.name(), EntityType::Function(ty_void));
    }
    for import in function_imports {
        imports.import(&import.module, &import.name, EntityType::Function(ty_void));
    }
    module.section(&imports);

    let mut funcs = FunctionSection::new();
    funcs.function(ty_void);
    module.section(&funcs);

    let entry_index = (SystemFunc::ALL.len() + function_imports.len()) as u32;
    let mut exports = ExportSection::new();
    exports.export(EXPORT_ENTRY, ExportKind::Func, entry_index);
    module.section(&exports);

    let mut code = CodeSection::new();
    code.function(body);
    module.section(&code);

    module.finish()
}
