use serde::{Deserialize, Serialize};

/// Maps the half-open virtual range `[addr_start, addr_end)` onto the buffer at `file_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub addr_start: u32,
    pub addr_end: u32,
    pub file_offset: u32,
}

impl Section {
    pub fn contains(&self, address: u32) -> bool {
        self.addr_start <= address && address < self.addr_end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportEntry {
    pub hint_or_ordinal: u16,
    pub name: Option<String>,
    /// Value the bound import slot holds at run time.
    pub thunk_address: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportModule {
    pub dll_name: String,
    pub entries: Vec<ImportEntry>,
}

impl ImportModule {
    /// `Dll::Function`, or `Dll::#ordinal` for ordinal-only imports.
    pub fn symbol(&self, entry: &ImportEntry) -> String {
        match &entry.name {
            Some(name) => format!("{}::{name}", self.dll_name),
            None => format!("{}::#{}", self.dll_name, entry.hint_or_ordinal),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportTable {
    pub modules: Vec<ImportModule>,
}

impl ImportTable {
    pub fn new(modules: Vec<ImportModule>) -> Self {
        Self { modules }
    }

    /// Symbol of the import whose thunk slot holds `value`, if any.
    pub fn symbol_for_thunk(&self, value: u32) -> Option<String> {
        self.modules.iter().find_map(|module| {
            module
                .entries
                .iter()
                .find(|entry| entry.thunk_address == value)
                .map(|entry| module.symbol(entry))
        })
    }

    pub fn is_thunk(&self, value: u32) -> bool {
        self.modules
            .iter()
            .any(|module| module.entries.iter().any(|e| e.thunk_address == value))
    }
}

/// Everything the recompiler needs from the executable loader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub buffer: Vec<u8>,
    pub sections: Vec<Section>,
    pub entry: u32,
    pub imports: ImportTable,
}

impl Image {
    /// A single section mapping the whole buffer at `base`, entered at `base`.
    pub fn flat(base: u32, buffer: Vec<u8>) -> Self {
        let len = buffer.len() as u32;
        Self {
            buffer,
            sections: vec![Section {
                addr_start: base,
                addr_end: base.saturating_add(len),
                file_offset: 0,
            }],
            entry: base,
            imports: ImportTable::default(),
        }
    }

    pub fn with_imports(mut self, imports: ImportTable) -> Self {
        self.imports = imports;
        self
    }

    pub fn section_for(&self, address: u32) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(address))
    }

    /// Buffer bytes from `address` to the end of its section.
    pub fn bytes_at(&self, address: u32) -> Option<&[u8]> {
        let section = self.section_for(address)?;
        let start = section.file_offset as usize + (address - section.addr_start) as usize;
        let end = section.file_offset as usize + (section.addr_end - section.addr_start) as usize;
        self.buffer.get(start..end.min(self.buffer.len()))
    }

    pub fn read_u32(&self, address: u32) -> Option<u32> {
        let bytes = self.bytes_at(address)?;
        let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }
}
