use log::{error, info, warn};
use std::sync::Arc;
use trusty_tally::{
    handlers, tasks, Admins, Config, Database, Engine, EngineSettings, SystemClock,
};

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };
    if config.admin_ids.is_empty() {
        warn!("ADMIN_IDS is empty, nobody can close, edit or delete polls");
    }

    // Initialize database
    let database = match Database::new(&config.database_url, config.db_max_connections).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };
    info!("Using database {}", config.database_url);

    let engine = Arc::new(Engine::new(
        database,
        Arc::new(SystemClock),
        Admins::new(config.admin_ids.clone()),
        EngineSettings::from(&config),
    ));

    // --- Background tasks ---
    let ticker_engine = Arc::clone(&engine);
    let tick_interval = config.tick_interval;
    tokio::spawn(async move {
        tasks::lifecycle_ticker::run_lifecycle_ticker(ticker_engine, tick_interval).await;
    });

    let auditor_engine = Arc::clone(&engine);
    let audit_interval = config.audit_interval;
    tokio::spawn(async move {
        tasks::auditor::run_auditor(auditor_engine, audit_interval).await;
    });

    handlers::serve_console(engine).await;
}
