use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use notevault::auth::jwt::JwtService;
use notevault::config::{AppConfig, StorageBackend};
use notevault::storage::{LocalStorage, ObjectStorage};
use notevault::{create_router, db, s3, summarizer, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "server",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        server_host = %config.server_host,
        server_port = config.server_port,
        storage_backend = ?config.storage_backend,
        hash_algorithm = %config.file_hash_algorithm,
        max_file_size = config.max_file_size,
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let applied = db::run_migrations(&pool)?;
    tracing::info!(applied, "database migrations up to date");

    let storage: Arc<dyn ObjectStorage> = match config.storage_backend {
        StorageBackend::Local => {
            tracing::info!(upload_dir = %config.upload_dir.display(), "using local blob storage");
            Arc::new(LocalStorage::new(config.upload_dir.clone()))
        }
        StorageBackend::S3 => Arc::new(s3::build_storage(&config).await?),
    };
    let summarizer = summarizer::from_config(&config)?;
    let jwt = JwtService::from_config(&config)?;

    let listen_addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    let state = AppState::new(pool, config, storage, summarizer, jwt);
    let router = create_router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("listening on {}", listen_addr);

    axum::serve(listener, router).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
