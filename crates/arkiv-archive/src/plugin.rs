//! Product type and remote backend extension points.
//!
//! Product type behaviour is supplied through [`ProductTypePlugin`]
//! implementations registered with the archive. All capabilities are
//! explicit trait methods with conservative defaults; there is no
//! attribute probing.

use std::path::{Path, PathBuf};

use crate::archive::Archive;
use crate::properties::Properties;
use crate::{Error, Result};

/// Referential integrity policy applied when the sources of a product
/// disappear from the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadeRule {
    /// Leave the product alone.
    #[default]
    Ignore,
    /// Remove the stored data, keep the catalogue entry.
    Strip,
    /// Remove the product entirely once its sources are gone.
    Cascade,
    /// Remove the product entirely, skipping its own cascade policy.
    CascadePurge,
    /// Like `CascadePurge` while sources exist without data; strip only.
    CascadePurgeAsStrip,
}

/// Result of analyzing product data prior to ingestion.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeResult {
    pub properties: Properties,
    pub tags: Vec<String>,
}

/// Behaviour of one product type.
///
/// Only `identify`, `analyze` and `archive_path` have no default; the
/// rest default to the most restrictive capability.
pub trait ProductTypePlugin: Send + Sync {
    /// Whether products of this type consist of multiple files stored
    /// inside a per-product directory.
    fn use_enclosing_directory(&self) -> bool {
        false
    }

    /// Whether a hash should be computed and stored on ingest.
    fn use_hash(&self) -> bool {
        true
    }

    /// Whether the given files constitute a product of this type.
    fn identify(&self, paths: &[PathBuf]) -> bool;

    /// Extract properties (and optional tags) from product data.
    fn analyze(&self, paths: &[PathBuf]) -> Result<AnalyzeResult>;

    /// Relative path inside the archive where the product belongs.
    fn archive_path(&self, properties: &Properties) -> Result<String>;

    /// Name of the per-product directory. Only consulted when
    /// `use_enclosing_directory` returns true.
    fn enclosing_directory(&self, properties: &Properties) -> Result<String> {
        let _ = properties;
        Err(Error::Internal(
            "product type plugin does not use an enclosing directory".to_string(),
        ))
    }

    /// Policy applied when the product's sources disappear.
    fn cascade_rule(&self) -> CascadeRule {
        CascadeRule::Ignore
    }

    /// Export formats supported besides the default copy-out.
    fn export_formats(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether the plugin overrides the default copy-out export.
    fn has_custom_export(&self) -> bool {
        false
    }

    /// Custom export. Only called when `has_custom_export` returns true
    /// or `format` names one of `export_formats`. Returns the path of
    /// the exported result.
    fn export(
        &self,
        archive: &Archive,
        product: &Properties,
        target_path: &Path,
        format: Option<&str>,
    ) -> Result<PathBuf> {
        let _ = (archive, product, target_path, format);
        Err(Error::Internal(
            "product type plugin does not implement export".to_string(),
        ))
    }

    /// Called after a product has been successfully ingested.
    fn post_ingest_hook(&self, archive: &mut Archive, properties: &Properties) -> Result<()> {
        let _ = (archive, properties);
        Ok(())
    }

    /// Called after a product has been successfully pulled.
    fn post_pull_hook(&self, archive: &mut Archive, properties: &Properties) -> Result<()> {
        let _ = (archive, properties);
        Ok(())
    }
}

/// Transfer of remote products into the archive, one implementation per
/// URL scheme family.
pub trait RemoteBackend: Send + Sync {
    /// Whether this backend can pull the given URL.
    fn supports(&self, url: &str) -> bool;

    /// Download the product data to its archive location. The location
    /// is `archive.product_path(product)`; the catalogue entry is
    /// inactive while the transfer runs.
    fn pull(&self, archive: &Archive, product: &Properties) -> Result<()>;
}
