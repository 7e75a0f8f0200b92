// src/main.rs

use std::sync::Arc;

use dotenvy::dotenv;
use exam_gate::config::Config;
use exam_gate::routes;
use exam_gate::state::AppState;
use exam_gate::store::{AccessStore, InMemoryCatalog, MemoryStore, PgStore};
use exam_gate::utils::clock::SystemClock;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load .env file (if present)
    dotenv().ok();

    // Load configuration from environment
    let config = Config::from_env();

    let file_appender = tracing_appender::rolling::daily("logs", "exam-gate.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::new(&config.rust_log);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(false);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    // Initialize Tracing (Logging)
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Evaluation definitions are read-only and cached for the process lifetime
    let catalog = InMemoryCatalog::from_file(&config.evaluations_path)
        .expect("Failed to load evaluation definitions");
    tracing::info!(
        "Loaded {} evaluation(s) from {}",
        catalog.len(),
        config.evaluations_path
    );

    let store: Arc<dyn AccessStore> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .expect("Failed to initialize database");
            tracing::info!("Database connected...");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, access records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::new(
        config.clone(),
        store,
        Arc::new(catalog),
        Arc::new(SystemClock),
    );

    // Create the Axum application router
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind listening address");
    tracing::info!("Listening on {}", config.bind_addr);

    // Start the server
    axum::serve(listener, app).await.expect("Server error");
}
