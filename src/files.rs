//! File uploads and their metadata.
//!
//! Blob storage and the metadata table are not transactional with each other.
//! Uploads write the blob first and remove it again if the row insert fails;
//! deletes remove the row first and treat the blob removal as best effort.

use chrono::Utc;
use diesel::{prelude::*, PgConnection};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::access::{self, Action, Resource};
use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::models::{FileAsset, NewFileAsset};
use crate::schema::file_assets;
use crate::state::AppState;
use crate::storage::{file_extension, BlobStore};
use crate::utils::pagination::{Page, PageRequest};

const MAX_FILENAME_CHARS: usize = 255;
const MAX_MIME_CHARS: usize = 100;
const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub description: Option<String>,
    pub is_public: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FilePatch {
    /// `Some(None)` clears the description.
    pub description: Option<Option<String>>,
    pub is_public: Option<bool>,
}

impl FilePatch {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.is_public.is_none()
    }
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = file_assets)]
struct FileAssetChangeset {
    description: Option<Option<String>>,
    is_public: Option<bool>,
}

/// Last path segment of a client-supplied name, trimmed and bounded.
pub fn clean_filename(raw: &str) -> AppResult<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    if name.is_empty() {
        return Err(AppError::bad_request("filename must not be empty"));
    }
    if name.chars().count() > MAX_FILENAME_CHARS {
        return Err(AppError::bad_request(format!(
            "filename must be at most {MAX_FILENAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

pub fn validate_extension(filename: &str, allowed: &[String]) -> AppResult<String> {
    let extension = file_extension(filename)
        .ok_or_else(|| AppError::bad_request("files without an extension are not accepted"))?;
    if !allowed.iter().any(|candidate| *candidate == extension) {
        return Err(AppError::bad_request(format!(
            "unsupported file type: .{extension}"
        )));
    }
    Ok(extension)
}

pub fn validate_size(size: u64, max_size: u64) -> AppResult<()> {
    if size == 0 {
        return Err(AppError::bad_request("uploaded file is empty"));
    }
    if size > max_size {
        return Err(AppError::bad_request(format!(
            "file exceeds the maximum size of {max_size} bytes"
        )));
    }
    Ok(())
}

/// Declared content type, else a guess from the extension, else octet-stream.
pub fn resolve_mime(declared: Option<&str>, filename: &str) -> String {
    declared
        .map(str::trim)
        .filter(|value| !value.is_empty() && *value != FALLBACK_MIME)
        .filter(|value| value.len() <= MAX_MIME_CHARS)
        .map(str::to_string)
        .or_else(|| {
            mime_guess::from_path(filename)
                .first()
                .map(|mime| mime.essence_str().to_string())
        })
        .unwrap_or_else(|| FALLBACK_MIME.to_string())
}

/// Writes the blob, then runs `record`. If `record` fails the blob is removed
/// before the error is returned.
pub async fn store_then_record<T, F>(
    blobs: &BlobStore,
    owner_id: Uuid,
    filename: &str,
    bytes: Vec<u8>,
    content_type: Option<&str>,
    record: F,
) -> AppResult<T>
where
    F: FnOnce(&str) -> AppResult<T>,
{
    let storage_path = blobs.write(owner_id, filename, bytes, content_type).await?;
    match record(&storage_path) {
        Ok(value) => Ok(value),
        Err(err) => {
            match blobs.delete(&storage_path).await {
                Ok(()) => warn!(
                    storage_path = %storage_path,
                    error = %err,
                    "metadata insert failed, removed orphaned blob"
                ),
                Err(cleanup_err) => error!(
                    storage_path = %storage_path,
                    error = %err,
                    cleanup_error = %cleanup_err,
                    "metadata insert failed and orphaned blob could not be removed"
                ),
            }
            Err(err)
        }
    }
}

/// Returns whether the blob is gone. Failures are logged and left for the sweep.
pub async fn reclaim_blob(blobs: &BlobStore, storage_path: &str) -> bool {
    match blobs.delete(storage_path).await {
        Ok(()) => true,
        Err(err) => {
            error!(
                storage_path = %storage_path,
                error = %err,
                "blob deletion failed after metadata delete"
            );
            false
        }
    }
}

fn find_asset(conn: &mut PgConnection, file_id: Uuid) -> AppResult<FileAsset> {
    file_assets::table
        .find(file_id)
        .first::<FileAsset>(conn)
        .optional()?
        .ok_or_else(AppError::not_found)
}

fn find_duplicate(
    conn: &mut PgConnection,
    owner_id: Uuid,
    content_hash: &str,
) -> AppResult<Option<FileAsset>> {
    Ok(file_assets::table
        .filter(file_assets::owner_id.eq(owner_id))
        .filter(file_assets::content_hash.eq(content_hash))
        .order(file_assets::created_at.asc())
        .first::<FileAsset>(conn)
        .optional()?)
}

pub async fn upload(state: &AppState, owner: &Principal, upload: Upload) -> AppResult<FileAsset> {
    let filename = clean_filename(&upload.filename)?;
    if let Err(err) = validate_extension(&filename, &state.config.allowed_file_extensions)
        .and_then(|_| validate_size(upload.bytes.len() as u64, state.config.max_file_size))
    {
        warn!(owner_id = %owner.user_id, filename = %filename, error = %err, "upload rejected");
        return Err(err);
    }

    let size_bytes = upload.bytes.len() as i64;
    let content_hash = state.hasher.digest(&upload.bytes);
    let mime_type = resolve_mime(upload.content_type.as_deref(), &filename);

    // No pooled connection is held while the blob is written.
    {
        let mut conn = state.db()?;
        if state.config.enable_file_duplicate_check {
            if let Some(existing) = find_duplicate(&mut conn, owner.user_id, &content_hash)? {
                info!(
                    owner_id = %owner.user_id,
                    existing_file_id = %existing.id,
                    content_hash = %content_hash,
                    "duplicate content uploaded, storing a separate copy"
                );
            }
        }

        if let Err(err) = state.quota.check_and_reserve(&mut conn, owner.user_id, size_bytes) {
            warn!(owner_id = %owner.user_id, error = %err, "upload rejected by quota");
            return Err(err);
        }
    }

    let asset = store_then_record(
        &state.blobs,
        owner.user_id,
        &filename,
        upload.bytes,
        Some(&mime_type),
        |storage_path| {
            let new_asset = NewFileAsset {
                id: Uuid::new_v4(),
                owner_id: owner.user_id,
                original_filename: filename.clone(),
                storage_path: storage_path.to_string(),
                size_bytes,
                mime_type: mime_type.clone(),
                content_hash: content_hash.clone(),
                description: upload.description.clone(),
                is_public: upload.is_public,
            };
            let mut conn = state.db()?;
            let asset = diesel::insert_into(file_assets::table)
                .values(&new_asset)
                .get_result::<FileAsset>(&mut conn)?;
            Ok(asset)
        },
    )
    .await?;

    info!(
        file_id = %asset.id,
        owner_id = %owner.user_id,
        size_bytes,
        storage_path = %asset.storage_path,
        "upload accepted"
    );
    Ok(asset)
}

pub fn get_for_read(
    state: &AppState,
    requester: Option<&Principal>,
    file_id: Uuid,
) -> AppResult<FileAsset> {
    let mut conn = state.db()?;
    let asset = find_asset(&mut conn, file_id)?;
    access::ensure(requester, Resource::from(&asset), Action::Read)?;
    Ok(asset)
}

pub async fn download(
    state: &AppState,
    requester: Option<&Principal>,
    file_id: Uuid,
) -> AppResult<(FileAsset, Vec<u8>)> {
    let asset = get_for_read(state, requester, file_id)?;
    let bytes = state.blobs.read(&asset.storage_path).await?;
    Ok((asset, bytes))
}

pub fn update(
    state: &AppState,
    requester: &Principal,
    file_id: Uuid,
    patch: FilePatch,
) -> AppResult<FileAsset> {
    let mut conn = state.db()?;
    conn.transaction::<FileAsset, AppError, _>(|conn| {
        let asset = find_asset(conn, file_id)?;
        access::ensure(Some(requester), Resource::from(&asset), Action::Update)?;
        if patch.is_empty() {
            return Ok(asset);
        }

        let changeset = FileAssetChangeset {
            description: patch.description.clone(),
            is_public: patch.is_public,
        };
        let updated = diesel::update(file_assets::table.find(file_id))
            .set((&changeset, file_assets::updated_at.eq(Utc::now().naive_utc())))
            .get_result::<FileAsset>(conn)?;
        Ok(updated)
    })
}

pub async fn delete(state: &AppState, requester: &Principal, file_id: Uuid) -> AppResult<()> {
    let asset = {
        let mut conn = state.db()?;
        conn.transaction::<FileAsset, AppError, _>(|conn| {
            let asset = find_asset(conn, file_id)?;
            access::ensure(Some(requester), Resource::from(&asset), Action::Delete)?;
            diesel::delete(file_assets::table.find(file_id)).execute(conn)?;
            Ok(asset)
        })?
    };

    let reclaimed = reclaim_blob(&state.blobs, &asset.storage_path).await;
    info!(file_id = %file_id, blob_removed = reclaimed, "file deleted");
    Ok(())
}

pub fn list_own(
    state: &AppState,
    owner: &Principal,
    request: PageRequest,
) -> AppResult<Page<FileAsset>> {
    let mut conn = state.db()?;
    let total: i64 = file_assets::table
        .filter(file_assets::owner_id.eq(owner.user_id))
        .count()
        .get_result(&mut conn)?;
    let items = file_assets::table
        .filter(file_assets::owner_id.eq(owner.user_id))
        .order((file_assets::created_at.desc(), file_assets::id.desc()))
        .offset(request.offset())
        .limit(request.limit())
        .load::<FileAsset>(&mut conn)?;
    Ok(Page::new(items, total, request))
}

pub fn list_public(state: &AppState, request: PageRequest) -> AppResult<Page<FileAsset>> {
    let mut conn = state.db()?;
    let total: i64 = file_assets::table
        .filter(file_assets::is_public.eq(true))
        .count()
        .get_result(&mut conn)?;
    let items = file_assets::table
        .filter(file_assets::is_public.eq(true))
        .order((file_assets::created_at.desc(), file_assets::id.desc()))
        .offset(request.offset())
        .limit(request.limit())
        .load::<FileAsset>(&mut conn)?;
    Ok(Page::new(items, total, request))
}
