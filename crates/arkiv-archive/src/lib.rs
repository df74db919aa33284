//! Product archive management: a catalogue of typed product properties
//! combined with managed product data storage.
//!
//! The central type is [`Archive`], which coordinates a catalogue
//! [`Backend`], a [`Storage`] backend and per-product-type
//! [`ProductTypePlugin`]s through the product lifecycle: ingest, search,
//! retrieve, export, pull, strip and remove. Query filters use the
//! typed expression language from `arkiv-expr`.
//!
//! The crate ships an in-memory catalogue ([`mem::MemBackend`]) and a
//! filesystem storage backend ([`fs::FsStorage`]); real deployments
//! register their own implementations through [`config::ComponentRegistry`].

pub mod archive;
pub mod backend;
pub mod config;
pub mod fs;
pub mod mem;
pub mod plugin;
pub mod properties;
pub mod storage;
pub mod util;

pub use archive::{Archive, IngestOptions};
pub use backend::{AggregateSpec, Backend, GroupBySpec, ReduceFn, Summary, SummaryRow, TimestampBin};
pub use config::{ArchiveConfig, ComponentRegistry};
pub use plugin::{AnalyzeResult, CascadeRule, ProductTypePlugin, RemoteBackend};
pub use properties::{core_schema, Properties};
pub use storage::Storage;

use thiserror::Error as ThisError;

/// Errors raised by archive operations.
///
/// `User` covers invalid requests and inconsistent product state;
/// `Internal` covers defects in plugins or backend implementations.
/// Expression errors keep their own taxonomy and pass through.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("{0}")]
    User(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Expression(#[from] arkiv_expr::ExprError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
