//! wasmi host for running assembled chunks in tests.
//!
//! Every chunk module is instantiated against one shared set of register globals and one linear
//! memory. `chunk<N>.entry` imports are host trampolines that call back into the instantiated
//! module, so chunks may call each other and themselves. Any other function import is treated as
//! an external library call: it is recorded together with its first stack argument and returns to
//! the caller by popping the return address.

use relift_x86::reg;
use wasmi::{
    Caller, Engine, Func, Global, Linker, Memory, MemoryType, Module, Mutability, Store, Val,
};
use wasmparser::Validator;

use crate::abi::{
    chunk_module, CpuState, EXPORT_ENTRY, IMPORT_DEBUGGER, IMPORT_INDIRECT_DISPATCH,
    IMPORT_INTERRUPT, IMPORT_MEMORY, IMPORT_MODULE, SYSTEM_MODULE,
};
use crate::assembler::AssembledChunk;

pub const STACK_TOP: u32 = 0xF000;

pub fn validate_wasm(bytes: &[u8]) {
    let mut validator = Validator::new();
    validator.validate_all(bytes).expect("generated module validates");
}

/// Zeroed state with `esp` at [`STACK_TOP`].
pub fn initial_state() -> CpuState {
    let mut state = CpuState::default();
    state.gpr[reg::ESP as usize] = STACK_TOP;
    state
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternCall {
    pub symbol: String,
    pub return_address: u32,
    pub first_arg: u32,
}

#[derive(Default)]
pub struct Host {
    memory: Option<Memory>,
    globals: Vec<(&'static str, Global)>,
    entries: Vec<Option<Func>>,
    pub debugger_hits: Vec<u32>,
    pub interrupts: Vec<u32>,
    pub indirect_targets: Vec<u32>,
    pub extern_calls: Vec<ExternCall>,
}

impl Host {
    fn debugger_hits_mut(&mut self) -> &mut Vec<u32> {
        &mut self.debugger_hits
    }

    fn indirect_targets_mut(&mut self) -> &mut Vec<u32> {
        &mut self.indirect_targets
    }

    fn interrupts_mut(&mut self) -> &mut Vec<u32> {
        &mut self.interrupts
    }
}

fn global(caller: &Caller<'_, Host>, name: &str) -> Global {
    caller
        .data()
        .globals
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, g)| *g)
        .unwrap_or_else(|| panic!("no global {name}"))
}

fn read_global(caller: &Caller<'_, Host>, name: &str) -> u32 {
    global(caller, name).get(caller).i32().expect("i32 global") as u32
}

fn read_memory_u32(caller: &Caller<'_, Host>, address: u32) -> u32 {
    let memory = caller.data().memory.expect("memory is defined");
    let mut buf = [0u8; 4];
    memory
        .read(caller, address as usize, &mut buf)
        .expect("stack read in bounds");
    u32::from_le_bytes(buf)
}

fn define_hook(
    linker: &mut Linker<Host>,
    store: &mut Store<Host>,
    name: &str,
    global_name: &'static str,
    record: fn(&mut Host) -> &mut Vec<u32>,
) {
    let hook = Func::wrap(&mut *store, move |mut caller: Caller<'_, Host>| {
        let value = read_global(&caller, global_name);
        record(caller.data_mut()).push(value);
    });
    linker
        .define(SYSTEM_MODULE, name, hook)
        .expect("system hook defined once");
}

pub struct Machine {
    pub store: Store<Host>,
    pub memory: Memory,
}

impl Machine {
    /// Map each `(address, bytes)` segment into memory and instantiate every chunk module.
    pub fn new(segments: &[(u32, &[u8])], chunks: &[AssembledChunk]) -> Self {
        let engine = Engine::default();
        let mut store = Store::new(&engine, Host::default());
        let mut linker = Linker::<Host>::new(&engine);

        let memory = Memory::new(&mut store, MemoryType::new(1, None)).expect("memory type");
        linker
            .define(IMPORT_MODULE, IMPORT_MEMORY, memory)
            .expect("memory defined once");
        for (address, bytes) in segments {
            memory
                .write(&mut store, *address as usize, bytes)
                .expect("segment fits in memory");
        }
        store.data_mut().memory = Some(memory);

        let mut globals = Vec::new();
        for (module, name) in CpuState::global_names() {
            let global = Global::new(&mut store, Val::I32(0), Mutability::Var);
            linker
                .define(module, name, global)
                .expect("global defined once");
            globals.push((name, global));
        }
        store.data_mut().globals = globals;

        define_hook(&mut linker, &mut store, IMPORT_DEBUGGER, "t2", Host::debugger_hits_mut);
        define_hook(
            &mut linker,
            &mut store,
            IMPORT_INDIRECT_DISPATCH,
            "t1",
            Host::indirect_targets_mut,
        );
        define_hook(&mut linker, &mut store, IMPORT_INTERRUPT, "t1", Host::interrupts_mut);

        for id in 0..chunks.len() {
            let trampoline = Func::wrap(
                &mut store,
                move |mut caller: Caller<'_, Host>| -> Result<(), wasmi::Error> {
                    let entry = caller.data().entries[id]
                        .unwrap_or_else(|| panic!("chunk {id} is not instantiated"));
                    entry.call(&mut caller, &[], &mut [])
                },
            );
            linker
                .define(&chunk_module(id as u32), EXPORT_ENTRY, trampoline)
                .expect("chunk entry defined once");
        }

        let mut externs: Vec<(String, String)> = Vec::new();
        for import in chunks.iter().flat_map(|c| &c.function_imports) {
            let is_chunk = import.module.starts_with("chunk") && import.name == EXPORT_ENTRY;
            let key = (import.module.clone(), import.name.clone());
            if !is_chunk && !externs.contains(&key) {
                externs.push(key);
            }
        }
        for (module, name) in externs {
            let symbol = format!("{module}::{name}");
            let stub = Func::wrap(&mut store, move |mut caller: Caller<'_, Host>| {
                let esp = global(&caller, "esp");
                let sp = esp.get(&caller).i32().expect("i32 global") as u32;
                let call = ExternCall {
                    symbol: symbol.clone(),
                    return_address: read_memory_u32(&caller, sp),
                    first_arg: read_memory_u32(&caller, sp.wrapping_add(4)),
                };
                caller.data_mut().extern_calls.push(call);
                esp.set(&mut caller, Val::I32(sp.wrapping_add(4) as i32))
                    .expect("esp is mutable");
            });
            linker
                .define(&module, &name, stub)
                .expect("extern defined once");
        }

        let mut entries = Vec::new();
        for chunk in chunks {
            validate_wasm(&chunk.bytes);
            let module = Module::new(&engine, &chunk.bytes[..]).expect("module compiles");
            let instance = linker
                .instantiate_and_start(&mut store, &module)
                .expect("module instantiates");
            entries.push(instance.get_func(&store, EXPORT_ENTRY));
        }
        store.data_mut().entries = entries;

        Self { store, memory }
    }

    /// Copy `state` into the globals, run chunk `id` and copy the globals back.
    pub fn run(&mut self, id: usize, state: &mut CpuState) -> Result<(), wasmi::Error> {
        let globals = self.store.data().globals.clone();
        for (name, global) in &globals {
            let value = state.get(name).expect("layout global");
            global
                .set(&mut self.store, Val::I32(value as i32))
                .expect("global is mutable");
        }

        let entry = self.store.data().entries[id].expect("chunk exports entry");
        let result = entry.call(&mut self.store, &[], &mut []);

        for (name, global) in &globals {
            let value = global.get(&self.store).i32().expect("i32 global") as u32;
            state.set(name, value);
        }
        result
    }

    pub fn host(&self) -> &Host {
        self.store.data()
    }

    pub fn write(&mut self, address: u32, bytes: &[u8]) {
        self.memory
            .write(&mut self.store, address as usize, bytes)
            .expect("write in bounds");
    }

    pub fn read_u32(&self, address: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.memory
            .read(&self.store, address as usize, &mut buf)
            .expect("read in bounds");
        u32::from_le_bytes(buf)
    }
}
