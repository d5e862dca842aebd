use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use http_body_util::BodyExt;
use notevault::auth::jwt::JwtService;
use notevault::auth::password::hash_password;
use notevault::config::{parse_extensions, AppConfig, StorageBackend};
use notevault::db::{self, PgPool};
use notevault::hashing::HashAlgorithm;
use notevault::models::NewUser;
use notevault::routes;
use notevault::state::AppState;
use notevault::storage::{ObjectStorage, StorageError, StorageResult, StoredObject};
use notevault::summarizer::LocalSummarizer;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_deletes: AtomicBool,
    watched_pool: OnceLock<PgPool>,
    busy_connections_during_put: AtomicU32,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: Option<String>,
    ) -> StorageResult<()> {
        if let Some(pool) = self.watched_pool.get() {
            let state = pool.state();
            let busy = state.connections - state.idle_connections;
            self.busy_connections_during_put
                .fetch_max(busy, Ordering::SeqCst);
        }
        let mut guard = self.objects.lock().await;
        guard.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        let guard = self.objects.lock().await;
        guard
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!("refusing to delete {key}")));
        }
        let mut guard = self.objects.lock().await;
        guard.remove(key);
        Ok(())
    }

    async fn list_objects(&self) -> StorageResult<Vec<StoredObject>> {
        let guard = self.objects.lock().await;
        Ok(guard
            .keys()
            .map(|key| StoredObject {
                key: key.clone(),
                last_modified: Some(Utc::now()),
            })
            .collect())
    }
}

#[allow(dead_code)]
impl FakeStorage {
    pub async fn contains(&self, key: &str) -> bool {
        self.objects.lock().await.contains_key(key)
    }

    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn remove_silently(&self, key: &str) {
        self.objects.lock().await.remove(key);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Highest number of checked-out pool connections seen while a blob was written.
    pub fn busy_connections_during_put(&self) -> u32 {
        self.busy_connections_during_put.load(Ordering::SeqCst)
    }

    fn watch_pool(&self, pool: PgPool) {
        let _ = self.watched_pool.set(pool);
    }
}

/// Envelope returned by every successful JSON endpoint.
#[derive(Deserialize)]
pub struct Envelope<T> {
    pub code: u16,
    #[allow(dead_code)]
    pub message: String,
    pub data: T,
}

#[derive(Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub error: String,
    #[allow(dead_code)]
    pub message: String,
}

pub fn test_config(database_url: String) -> AppConfig {
    AppConfig {
        database_url,
        database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        jwt_secret: "test-secret".to_string(),
        jwt_issuer: "test-issuer".to_string(),
        jwt_audience: "test-audience".to_string(),
        jwt_expiry_minutes: 60,
        refresh_token_expiry_days: 30,
        refresh_cookie_secure: false,
        refresh_cookie_domain: None,
        cors_allowed_origin: None,
        storage_backend: StorageBackend::Local,
        upload_dir: PathBuf::from("unused"),
        aws_endpoint_url: None,
        aws_access_key_id: None,
        aws_secret_access_key: None,
        aws_region: "us-east-1".to_string(),
        s3_bucket: None,
        max_file_size: 1024 * 1024,
        allowed_file_extensions: parse_extensions("txt,md,png,pdf"),
        max_files_per_user: 100,
        max_storage_per_user: 10 * 1024 * 1024,
        file_hash_algorithm: HashAlgorithm::Sha256,
        enable_file_duplicate_check: true,
        version_conflict_retries: 3,
        openai_api_key: None,
        openai_base_url: "http://127.0.0.1:9".to_string(),
        openai_model: "test-model".to_string(),
        summarizer_timeout_seconds: 1,
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<FakeStorage>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;
        let mut config = test_config(database_url);
        adjust(&mut config);

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        storage.watch_pool(pool.clone());
        let storage_for_state: Arc<dyn ObjectStorage> = storage.clone();
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(
            pool.clone(),
            config,
            storage_for_state,
            Arc::new(LocalSummarizer),
            jwt,
        );
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            storage,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get cleanup connection: {err}"))?;
            truncate_all(&mut conn)?;
            Ok(())
        })
        .await
        .context("cleanup task panicked")?
    }

    #[allow(dead_code)]
    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    pub async fn insert_user(
        &self,
        username: &str,
        password: &str,
        is_superuser: bool,
    ) -> Result<Uuid> {
        let username = username.to_string();
        let password = password.to_string();
        self.with_conn(move |conn| {
            let password_hash = hash_password(&password)?;
            let user = NewUser {
                id: Uuid::new_v4(),
                username,
                password_hash,
                is_active: true,
                is_superuser,
            };
            diesel::insert_into(notevault::schema::users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(user.id)
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn deactivate_user(&self, user_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            use notevault::schema::users;
            diesel::update(users::table.find(user_id))
                .set(users::is_active.eq(false))
                .execute(conn)
                .context("failed to deactivate user")?;
            Ok(())
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn count_rows(&self, table: &'static str) -> Result<i64> {
        self.with_conn(move |conn| {
            #[derive(QueryableByName)]
            struct Count {
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                count: i64,
            }
            let row: Count = diesel::sql_query(format!("SELECT COUNT(*) AS count FROM {table}"))
                .get_result(conn)
                .context("failed to count rows")?;
            Ok(row.count)
        })
        .await
    }

    pub async fn login_token(&self, username: &str, password: &str) -> Result<String> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            username: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json(
                "/api/auth/login",
                &LoginPayload { username, password },
                None,
            )
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        #[derive(Deserialize)]
        struct LoginResponse {
            access_token: String,
        }
        let parsed: Envelope<LoginResponse> = read_json(response).await?;
        Ok(parsed.data.access_token)
    }

    /// Inserts a user and returns its id together with a fresh access token.
    #[allow(dead_code)]
    pub async fn user_with_token(&self, username: &str, is_superuser: bool) -> Result<(Uuid, String)> {
        let password = "password123";
        let user_id = self.insert_user(username, password, is_superuser).await?;
        let token = self.login_token(username, password).await?;
        Ok((user_id, token))
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::POST, path, payload, token).await
    }

    #[allow(dead_code)]
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::PUT, path, payload, token).await
    }

    #[allow(dead_code)]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::PATCH, path, payload, token).await
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        self.send(request).await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::DELETE).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn upload_file(
        &self,
        filename: &str,
        content_type: &str,
        data: &[u8],
        is_public: bool,
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend(data);
        body.extend(b"\r\n");

        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(b"Content-Disposition: form-data; name=\"is_public\"\r\n\r\n");
        body.extend(if is_public { &b"true"[..] } else { &b"false"[..] });
        body.extend(b"\r\n");

        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/files")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body))?;
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> Result<hyper::Response<Body>> {
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn read_json<T: DeserializeOwned>(response: hyper::Response<Body>) -> Result<T> {
    let body = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&body).with_context(|| {
        format!(
            "unexpected response body: {}",
            String::from_utf8_lossy(&body)
        )
    })
}

/// Status plus parsed envelope data for a successful call.
#[allow(dead_code)]
pub async fn expect_data<T: DeserializeOwned>(
    response: hyper::Response<Body>,
    status: StatusCode,
) -> Result<T> {
    let actual = response.status();
    let body = body_to_vec(response.into_body()).await?;
    ensure!(
        actual == status,
        "expected {status}, got {actual}: {}",
        String::from_utf8_lossy(&body)
    );
    let envelope: Envelope<T> = serde_json::from_slice(&body)?;
    ensure!(envelope.code == status.as_u16(), "envelope code mismatch");
    Ok(envelope.data)
}

/// Status plus the machine-readable error code of a failed call.
#[allow(dead_code)]
pub async fn expect_error(response: hyper::Response<Body>, status: StatusCode) -> Result<String> {
    let actual = response.status();
    let body = body_to_vec(response.into_body()).await?;
    ensure!(
        actual == status,
        "expected {status}, got {actual}: {}",
        String::from_utf8_lossy(&body)
    );
    let error: ErrorBody = serde_json::from_slice(&body)?;
    ensure!(error.code == status.as_u16(), "error code mismatch");
    Ok(error.error)
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(db::MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE document_versions, documents, file_assets, refresh_tokens, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
