use std::io::Read;

use crate::error::Result;

pub mod klepto;
pub mod psql;

/// Capability interface over the external extraction/anonymization
/// engine. Implementations stream the dump so callers never buffer a
/// whole database in memory; tests inject doubles producing
/// deterministic bytes.
pub trait Extractor {
    /// Extract an anonymized dump from the source database.
    fn extract(&self, source_uri: &str) -> Result<Box<dyn Read + Send>>;
}

/// Capability interface over the target database loader.
pub trait Loader {
    /// Whether the target has no user tables yet. Restores refuse to
    /// write into a non-empty target.
    fn is_empty(&self, target_uri: &str) -> Result<bool>;

    /// Drive schema creation and data load from a dump stream. A
    /// mid-load failure leaves the target partially loaded; callers
    /// discard and retry against a fresh database.
    fn load(&self, target_uri: &str, dump: &mut dyn Read) -> Result<()>;
}
