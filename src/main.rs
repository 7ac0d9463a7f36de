//! Changegate API - Change Approval & Rollback Engine
//!
//! Schema changes and deployments are proposed, routed through a risk-based
//! approval plan, applied through the platform effector and rolled back on
//! request. Deployments can be promoted hop by hop through environment
//! pipelines, with approval gates on the environments that need them.
//!
//! Without DATABASE_URL the engine runs on the in-memory store, which is
//! handy for local development and demos but loses everything on restart.

mod audit;
mod auth;
mod change;
mod config;
mod effector;
mod engine;
mod error;
mod models;
mod pipeline;
mod routes;
mod state;
mod store;

use crate::config::{DatabaseConfig, Settings};
use crate::effector::SandboxEffector;
use crate::engine::{spawn_expiry_sweeper, ApprovalEngine};
use crate::routes::create_router;
use crate::state::AppState;
use crate::store::{ChangeStore, InMemoryChangeStore, PostgresChangeStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("🚀 Starting Changegate - Change Approval & Rollback Engine...");

    // Load configuration
    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    let store: Arc<dyn ChangeStore> = match &settings.database {
        Some(database) => {
            let pool = init_database_pool(database).await.map_err(|e| {
                error!("❌ FATAL: Failed to initialize database pool: {}", e);
                e
            })?;
            info!("✅ Database pool created successfully");

            let store = PostgresChangeStore::new(pool);
            store.init_schema().await?;
            info!("✅ Change store tables initialized");
            Arc::new(store)
        }
        None => {
            warn!("⚠️  DATABASE_URL not set, using the in-memory change store (data is lost on restart)");
            Arc::new(InMemoryChangeStore::new())
        }
    };

    let engine = Arc::new(ApprovalEngine::new(
        store,
        Arc::new(SandboxEffector::new()),
        settings.engine.clone(),
    ));

    let sweeper = spawn_expiry_sweeper(engine.clone());
    info!(
        "🧹 Expiry sweeper running every {:?} (pending TTL {:?})",
        settings.engine.sweep_interval, settings.engine.change_ttl
    );

    let state = Arc::new(AppState::new(engine));

    // Build the router
    let app = create_router(state, &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── Catalog ───");
    info!("   POST /api/scopes/tables             - Register a table scope");
    info!("   POST /api/environments              - Register an environment");
    info!("   GET  /api/environments              - List environments");
    info!("   POST /api/pipelines                 - Define a promotion pipeline");
    info!("   GET  /api/pipelines/{{id}}            - Get a pipeline");
    info!("");
    info!("   ─── Changes ───");
    info!("   POST /api/changes                   - Submit a change (or save a draft)");
    info!("   GET  /api/changes                   - List changes (?status=pending for the queue)");
    info!("   GET  /api/changes/{{id}}              - Get a change");
    info!("   PUT  /api/changes/{{id}}/draft        - Edit a draft");
    info!("   POST /api/changes/{{id}}/submit       - Submit a draft");
    info!("   POST /api/changes/{{id}}/votes        - Approve or reject the current step");
    info!("   GET  /api/changes/{{id}}/votes        - Approval history");
    info!("   POST /api/changes/{{id}}/withdraw     - Withdraw a pending change");
    info!("   POST /api/changes/{{id}}/apply        - Apply an approved change");
    info!("   POST /api/changes/{{id}}/rollback     - Roll back an applied change");
    info!("");
    info!("   ─── Pipelines ───");
    info!("   POST /api/pipelines/{{id}}/runs       - Start promoting a deployment");
    info!("   GET  /api/runs/{{id}}                 - Get run progress");
    info!("   POST /api/runs/{{id}}/promote         - Advance a run");
    info!("   GET  /api/audit                     - Audit log");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,changegate_api=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Initialize the change store pool
async fn init_database_pool(database: &DatabaseConfig) -> anyhow::Result<deadpool_postgres::Pool> {
    use deadpool_postgres::{Config, ManagerConfig, PoolConfig, RecyclingMethod, Runtime};

    let mut cfg = Config::new();
    cfg.host = Some(database.host.clone());
    cfg.port = Some(database.port);
    cfg.user = Some(database.user.clone());
    cfg.password = Some(database.password.clone());
    cfg.dbname = Some(database.database.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(database.max_pool_size));

    // Create pool with TLS support if needed
    let pool = if database.use_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

        cfg.create_pool(Some(Runtime::Tokio1), tls)
            .map_err(|e| anyhow::anyhow!("Failed to create TLS pool: {}", e))?
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
            .map_err(|e| anyhow::anyhow!("Failed to create pool: {}", e))?
    };

    // Test the connection
    let client = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get pool connection: {}", e))?;

    client
        .query_one("SELECT 1 as ok", &[])
        .await
        .map_err(|e| anyhow::anyhow!("Failed to verify database connection: {}", e))?;

    info!(
        "✅ Database connection successful (TLS: {}, pool size: {})",
        database.use_tls, database.max_pool_size
    );
    Ok(pool)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
