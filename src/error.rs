//! ==============================================================================
//! error.rs - ingest error taxonomy
//! ==============================================================================
//!
//! purpose:
//!     typed errors for everything that can go wrong while a payload is being
//!     persisted. every variant ends up as the text after "ERROR: " in the
//!     response body, so the Display strings are what the gateway sees.
//!
//! classes:
//!     - malformed input:   InvalidJson, NotAnObject, MissingDate
//!     - configuration:     TemplateMissing, TemplateHeader, SheetMissing,
//!                          ReservedSheetName
//!     - storage:           Storage (io / csv / property file problems)
//!
//! ==============================================================================

use std::path::PathBuf;
use thiserror::Error;

use crate::domain::SheetKind;

/// Failure while persisting one payload.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("summary payload missing date")]
    MissingDate,

    #[error("Missing RAW or SUMMARY template sheets")]
    TemplateMissing,

    /// the duplicate-summary check counts rows, so the template must carry
    /// exactly the configured number of header rows.
    #[error("template sheet '{name}' has {rows} rows, expected {expected} header row(s)")]
    TemplateHeader {
        name: String,
        rows: usize,
        expected: usize,
    },

    #[error("{kind} sheet missing: {name}")]
    SheetMissing { kind: SheetKind, name: String },

    /// a date that would name one of the template sheets
    #[error("sheet name '{0}' is reserved for a template")]
    ReservedSheetName(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Failure inside a sheet store or property store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error on {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("property file {} is corrupt: {source}", .path.display())]
    CorruptProperties {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid sheet name {0:?}")]
    InvalidName(String),

    #[error("sheet not found: {0}")]
    NotFound(String),

    #[error("sheet already exists: {0}")]
    AlreadyExists(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Csv {
            path: path.into(),
            source,
        }
    }
}
