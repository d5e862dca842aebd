use std::{env, path::PathBuf, str::FromStr};

use anyhow::{anyhow, bail, Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;
use crate::hashing::HashAlgorithm;

const DEFAULT_ALLOWED_EXTENSIONS: &str = "txt,md,pdf,doc,docx,xls,xlsx,ppt,pptx,jpg,jpeg,png,gif,bmp,svg,webp,zip,rar,7z,tar,gz,py,js,ts,html,css,json,yaml,xml";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    S3,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            "s3" => Ok(StorageBackend::S3),
            other => Err(anyhow!("unsupported storage backend '{other}'")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
    pub refresh_cookie_secure: bool,
    pub refresh_cookie_domain: Option<String>,
    pub cors_allowed_origin: Option<String>,
    pub storage_backend: StorageBackend,
    pub upload_dir: PathBuf,
    pub aws_endpoint_url: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    pub s3_bucket: Option<String>,
    pub max_file_size: u64,
    pub allowed_file_extensions: Vec<String>,
    pub max_files_per_user: i64,
    pub max_storage_per_user: i64,
    pub file_hash_algorithm: HashAlgorithm,
    pub enable_file_duplicate_check: bool,
    pub version_conflict_retries: u32,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub summarizer_timeout_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let jwt_issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "notevault".to_string());
        let jwt_audience =
            env::var("JWT_AUDIENCE").unwrap_or_else(|_| "notevault-clients".to_string());
        let jwt_expiry_minutes = env::var("JWT_EXPIRY_MINUTES")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("JWT_EXPIRY_MINUTES must be an integer")?;
        let refresh_token_expiry_days = env::var("REFRESH_TOKEN_EXPIRY_DAYS")
            .unwrap_or_else(|_| "7".to_string())
            .parse()
            .context("REFRESH_TOKEN_EXPIRY_DAYS must be an integer")?;
        let refresh_cookie_secure = env::var("REFRESH_COOKIE_SECURE")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        let refresh_cookie_domain = env::var("REFRESH_COOKIE_DOMAIN").ok();
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();

        let storage_backend: StorageBackend = env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .parse()
            .context("STORAGE_BACKEND must be 'local' or 's3'")?;
        let upload_dir =
            PathBuf::from(env::var("UPLOAD_DIR").unwrap_or_else(|_| "./uploads".to_string()));
        let aws_endpoint_url = env::var("AWS_ENDPOINT_URL").ok();
        let aws_access_key_id = env::var("AWS_ACCESS_KEY_ID").ok();
        let aws_secret_access_key = env::var("AWS_SECRET_ACCESS_KEY").ok();
        let aws_region = env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let s3_bucket = env::var("S3_BUCKET").ok();
        if storage_backend == StorageBackend::S3 && s3_bucket.is_none() {
            bail!("S3_BUCKET must be set when STORAGE_BACKEND=s3");
        }

        let max_file_size = env::var("MAX_FILE_SIZE")
            .unwrap_or_else(|_| "52428800".to_string())
            .parse()
            .context("MAX_FILE_SIZE must be a non-negative integer")?;
        let allowed_file_extensions = parse_extensions(
            &env::var("ALLOWED_FILE_EXTENSIONS")
                .unwrap_or_else(|_| DEFAULT_ALLOWED_EXTENSIONS.to_string()),
        );
        let max_files_per_user = env::var("MAX_FILES_PER_USER")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .context("MAX_FILES_PER_USER must be an integer")?;
        let max_storage_per_user = env::var("MAX_STORAGE_PER_USER")
            .unwrap_or_else(|_| "5368709120".to_string())
            .parse()
            .context("MAX_STORAGE_PER_USER must be an integer")?;
        let file_hash_algorithm = env::var("FILE_HASH_ALGORITHM")
            .unwrap_or_else(|_| "sha256".to_string())
            .parse()
            .context("FILE_HASH_ALGORITHM must be one of sha256, sha512, md5, blake3")?;
        let enable_file_duplicate_check = env::var("ENABLE_FILE_DUPLICATE_CHECK")
            .map(|v| parse_flag(&v))
            .unwrap_or(true);
        let version_conflict_retries = env::var("VERSION_CONFLICT_RETRIES")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .context("VERSION_CONFLICT_RETRIES must be a non-negative integer")?;

        let openai_api_key = env::var("OPENAI_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let openai_base_url =
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.deepseek.com".to_string());
        let openai_model = env::var("OPENAI_MODEL").unwrap_or_else(|_| "deepseek-chat".to_string());
        let summarizer_timeout_seconds = env::var("SUMMARIZER_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "15".to_string())
            .parse()
            .context("SUMMARIZER_TIMEOUT_SECONDS must be an integer")?;

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            jwt_expiry_minutes,
            refresh_token_expiry_days,
            refresh_cookie_secure,
            refresh_cookie_domain,
            cors_allowed_origin,
            storage_backend,
            upload_dir,
            aws_endpoint_url,
            aws_access_key_id,
            aws_secret_access_key,
            aws_region,
            s3_bucket,
            max_file_size,
            allowed_file_extensions,
            max_files_per_user,
            max_storage_per_user,
            file_hash_algorithm,
            enable_file_duplicate_check,
            version_conflict_retries,
            openai_api_key,
            openai_base_url,
            openai_model,
            summarizer_timeout_seconds,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }
}

/// Lowercased, dot-stripped, de-duplicated extension list.
pub fn parse_extensions(raw: &str) -> Vec<String> {
    let mut extensions: Vec<String> = Vec::new();
    for entry in raw.split(',') {
        let normalized = entry.trim().trim_start_matches('.').to_ascii_lowercase();
        if !normalized.is_empty() && !extensions.contains(&normalized) {
            extensions.push(normalized);
        }
    }
    extensions
}

pub(crate) fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("*****"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
