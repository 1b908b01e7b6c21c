//! greenhouse-sheets: appends greenhouse gateway samples and daily summaries
//! into date-named sheets, provisioning each day's sheets from templates.

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod provision;
pub mod server;
pub mod sheets;
pub mod state;

pub use error::{IngestError, StoreError};
pub use ingest::{IngestHandler, IngestReply};
pub use provision::{ProvisionOutcome, SheetLayout, SheetProvisioner};
