// School Administration System - Web Server

use anyhow::Context;
use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use school_admin::api::{build_router, AppState};
use school_admin::{
    migrate_legacy_students, setup_database, AppConfig, ReconciliationEngine,
    SiblingDetectionEngine, SiblingService,
};

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = school_admin::VERSION, "🏫 School Administration System - Web Server");

    let config = AppConfig::load().context("Failed to load configuration")?;

    // Open database
    let db_path = config.database_path_or_default();
    let conn = Connection::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path))?;
    setup_database(&conn).context("Failed to set up schema")?;
    info!(path = %db_path, "Database opened");

    // Legacy rows are migrated once; already-stamped rows are skipped
    let report = migrate_legacy_students(&conn, Utc::now().date_naive())
        .context("Legacy migration failed")?;
    if report.migrated > 0 || !report.skipped.is_empty() {
        info!(
            migrated = report.migrated,
            skipped = report.skipped.len(),
            warnings = report.warnings.len(),
            "Legacy students migrated"
        );
    }

    let engine = SiblingDetectionEngine::with_threshold(config.sibling_threshold_or_default());
    SiblingService::new(&conn)
        .detect_and_store(&engine)
        .context("Sibling detection failed")?;

    // Logs a warning per drifted subscription
    ReconciliationEngine::new().run(&conn)?;

    for program in school_admin::Program::ALL {
        if config.webhook_secret(program).is_none() {
            warn!(%program, "No webhook secret configured; deliveries will be refused");
        }
    }

    let addr = config.bind_addr_or_default();
    let app = build_router(AppState::new(conn, config));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(%addr, "🚀 Server running");

    axum::serve(listener, app).await.context("Server stopped")?;
    Ok(())
}
