//! ==============================================================================
//! main.rs - greenhouse sheets endpoint entry point
//! ==============================================================================
//!
//! purpose:
//!     the receiving end of the greenhouse gateway's uploads. the gateway
//!     POSTs two kinds of json payloads:
//!     - raw samples, every few minutes
//!     - one daily summary, after the day has ended
//!     and this service appends each as a row into that day's sheet.
//!
//! responsibilities:
//!     - load configuration (config/gateway.toml or defaults)
//!     - install the tracing subscriber
//!     - open the workbook and seed missing templates
//!     - serve the ingest endpoint
//!
//! relationships:
//!     - uses: config.rs (settings)
//!     - uses: server.rs (wiring, axum router)
//!     - server.rs uses: ingest.rs -> provision.rs -> sheets.rs / state.rs
//!
//! architecture:
//!
//!     ┌──────────────┐  POST json   ┌──────────────────────────────────┐
//!     │   gateway    │ ───────────> │  axum (server.rs)                │
//!     └──────────────┘ <─────────── │    └─ spawn_blocking             │
//!                        "OK" /     │         └─ IngestHandler         │
//!                        "ERROR: …" │              ├─ SheetProvisioner │
//!                                   │              │    (lock+marker)  │
//!                                   │              └─ SheetStore       │
//!                                   └──────────────────┬───────────────┘
//!                                                      ▼
//!                                         data/<date> RAW.csv
//!                                         data/<date> SUMMARY.csv
//!                                         data/properties.json
//!
//! ==============================================================================

use anyhow::Result;
use greenhouse_sheets::config::{ConfigOrigin, GatewayConfig, LoggingConfig};
use greenhouse_sheets::server::{self, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    if logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration
    let (config, origin) = GatewayConfig::load_or_default();

    // step 2: logging, now that we know the level
    init_tracing(&config.logging);

    tracing::info!("===========================================================");
    tracing::info!("  Greenhouse Sheets Endpoint");
    tracing::info!("  \"Append Only, Never Compute\"");
    tracing::info!("===========================================================");

    match &origin {
        ConfigOrigin::File(path) => tracing::info!("[CONFIG] Loaded from {}", path.display()),
        ConfigOrigin::Defaults { skipped } => {
            for (path, reason) in skipped {
                tracing::warn!("[CONFIG] Failed to load {}: {}", path.display(), reason);
            }
            tracing::warn!("[CONFIG] No config file found - using defaults");
        }
    }
    config.log_summary();

    // step 3: open storage and build the handler
    let state = match AppState::from_config(&config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("[STARTUP] Fatal: {:#}", e);
            return Err(e);
        }
    };
    tracing::info!(
        timezone = %state.ingest.timezone(),
        "[STARTUP] Ingest handler ready"
    );

    // step 4: serve until the process is stopped
    tracing::info!("[STARTUP] Listening on http://{}", config.server.bind);
    server::serve(&config.server.bind, state).await
}
