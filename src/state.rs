use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    auth::jwt::JwtService,
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    hashing::ContentHasher,
    quota::QuotaGuard,
    storage::{BlobStore, ObjectStorage},
    summarizer::Summarizer,
};

pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub blobs: BlobStore,
    pub summarizer: Arc<dyn Summarizer>,
    pub jwt: JwtService,
    pub hasher: ContentHasher,
    pub quota: QuotaGuard,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        summarizer: Arc<dyn Summarizer>,
        jwt: JwtService,
    ) -> Self {
        let hasher = ContentHasher::new(config.file_hash_algorithm);
        let quota = QuotaGuard::new(config.max_files_per_user, config.max_storage_per_user);
        Self {
            pool,
            config: Arc::new(config),
            blobs: BlobStore::new(storage),
            summarizer,
            jwt,
            hasher,
            quota,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
