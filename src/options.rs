use relift_chunks::DiscoveryLimits;
use relift_wasm::AssembleOptions;
use serde::{Deserialize, Serialize};

use crate::error::RecompileError;

/// Options for a whole recompilation run.
///
/// Every field has a default, so a host can supply a partial JSON document:
///
/// ```
/// let options = relift::RecompileOptions::from_json(r#"{"assemble": {"debug_hooks": true}}"#)?;
/// assert!(options.assemble.debug_hooks);
/// assert_eq!(options.limits.max_chunks, 65_536);
/// # Ok::<(), relift::RecompileError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecompileOptions {
    pub limits: DiscoveryLimits,
    pub assemble: AssembleOptions,
    /// Entry points discovered after the image entry, e.g. exported functions or callbacks
    /// the loader knows about.
    pub extra_entries: Vec<u32>,
}

impl RecompileOptions {
    pub fn from_json(json: &str) -> Result<Self, RecompileError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        assert_eq!(
            RecompileOptions::from_json("{}").unwrap(),
            RecompileOptions::default()
        );
    }

    #[test]
    fn malformed_document_is_an_options_error() {
        let err = RecompileOptions::from_json(r#"{"extra_entries": "main"}"#).unwrap_err();
        assert!(matches!(err, RecompileError::Options(_)));
    }
}
