//! ==============================================================================
//! server.rs - http surface and wiring
//! ==============================================================================
//!
//! purpose:
//!     builds the shared ingest handler from configuration and exposes it
//!     over axum.
//!
//! routes:
//!     POST /         -> ingest (the gateway's configured endpoint)
//!     POST /ingest   -> ingest
//!     GET  /health   -> "OK"
//!
//! threading:
//!     the handler is synchronous (file i/o, a bounded lock wait), so each
//!     request runs on tokio's blocking pool via spawn_blocking.
//!
//! ==============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, GatewayConfig};
use crate::ingest::{IngestHandler, IngestReply};
use crate::provision::SheetProvisioner;
use crate::sheets::{CsvWorkbook, MemoryWorkbook, SheetStore};
use crate::state::{JsonFileProperties, MemoryProperties, ProcessLock, PropertyStore};

/// property file kept next to the sheets
pub const PROPERTIES_FILE: &str = "properties.json";

// ==============================================================================
// shared state
// ==============================================================================
// cloned into every request. the handler itself is immutable; all mutable
// state lives behind the stores and the lock it holds.

#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestHandler>,
}

impl AppState {
    pub fn new(ingest: IngestHandler) -> Self {
        Self {
            ingest: Arc::new(ingest),
        }
    }

    /// wire stores, lock and clock according to `config`
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    pub fn from_config_with_clock(config: &GatewayConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let timezone = config.timezone()?;

        let sheets: Arc<dyn SheetStore>;
        let properties: Arc<dyn PropertyStore>;
        match config.spreadsheet.backend {
            BackendKind::Csv => {
                let dir = &config.spreadsheet.data_dir;
                let book = CsvWorkbook::open(dir)
                    .with_context(|| format!("failed to open workbook at {}", dir.display()))?;
                properties = Arc::new(JsonFileProperties::new(book.dir().join(PROPERTIES_FILE)));
                sheets = Arc::new(book);
            }
            BackendKind::Memory => {
                sheets = Arc::new(MemoryWorkbook::new());
                properties = Arc::new(MemoryProperties::new());
            }
        }

        let provisioner = SheetProvisioner::new(
            sheets.clone(),
            properties,
            Arc::new(ProcessLock::new()),
            config.layout(),
        )
        .with_lock_wait(config.lock_wait());

        if config.spreadsheet.seed_templates {
            let seeded = provisioner
                .seed_templates()
                .context("failed to seed template sheets")?;
            if !seeded.is_empty() {
                tracing::info!(templates = ?seeded, "seeded missing templates");
            }
        }

        Ok(Self::new(IngestHandler::new(
            provisioner,
            sheets,
            clock,
            timezone,
        )))
    }
}

// ==============================================================================
// web server
// ==============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(ingest_handler))
        .route("/ingest", post(ingest_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// the reply is always 200 text/plain; success or failure is in the body
async fn ingest_handler(State(state): State<AppState>, body: Bytes) -> String {
    let ingest = state.ingest.clone();
    // offload blocking io to dedicated thread
    tokio::task::spawn_blocking(move || ingest.handle(&body))
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "ingest task failed");
            IngestReply::Error(format!("task join error: {}", e))
        })
        .to_string()
}

async fn health_handler() -> &'static str {
    "OK"
}
