use relift_chunks::{DiscoveryError, FixupError};
use relift_wasm::AssembleError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecompileError {
    #[error("chunk discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("reference fixup failed: {0}")]
    Fixup(#[from] FixupError),
    #[error(transparent)]
    Program(#[from] AssembleError),
    #[error("assembling {chunk} failed: {source}")]
    Assemble {
        chunk: String,
        #[source]
        source: AssembleError,
    },
    #[error("invalid options: {0}")]
    Options(#[from] serde_json::Error),
}
