use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum_extra::extract::WithRejection;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use super::{to_iso, ApiResponse};
use crate::auth::Principal;
use crate::config::parse_flag;
use crate::error::{AppError, AppResult};
use crate::files::{self, FilePatch, Upload};
use crate::models::FileAsset;
use crate::state::AppState;
use crate::utils::json::{classify_bool, classify_nullable};
use crate::utils::pagination::{Page, PageRequest};

#[derive(Deserialize, Default)]
pub struct ListFilesQuery {
    pub page: Option<i64>,
    pub size: Option<i64>,
}

#[derive(Serialize)]
pub struct FileResponse {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub original_filename: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub content_hash: String,
    pub description: Option<String>,
    pub is_public: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<FileAsset> for FileResponse {
    fn from(asset: FileAsset) -> Self {
        Self {
            id: asset.id,
            owner_id: asset.owner_id,
            original_filename: asset.original_filename,
            size_bytes: asset.size_bytes,
            mime_type: asset.mime_type,
            content_hash: asset.content_hash,
            description: asset.description,
            is_public: asset.is_public,
            created_at: to_iso(asset.created_at),
            updated_at: to_iso(asset.updated_at),
        }
    }
}

/// RFC 5987 `attr-char` keeps unreserved marks readable.
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn inline_content_disposition(filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }

    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ch if ch.is_control() => '_',
            _ => ch,
        })
        .collect();

    let encoded = utf8_percent_encode(&sanitized, FILENAME_ENCODE_SET);
    Some(format!(
        "inline; filename=\"{sanitized}\"; filename*=UTF-8''{encoded}"
    ))
}

fn multipart_error(context: &str, err: impl std::fmt::Display) -> AppError {
    error!(error = %err, "{context}");
    AppError::bad_request(format!("{context}: {err}"))
}

pub async fn upload_file(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(mut multipart, _): WithRejection<Multipart, AppError>,
) -> AppResult<(StatusCode, Json<ApiResponse<FileResponse>>)> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut description: Option<String> = None;
    let mut is_public = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_error("invalid multipart data", err))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                filename = field.file_name().map(|n| n.to_string());
                content_type = field.content_type().map(|mime| mime.to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|err| multipart_error("failed to read file bytes", err))?;
                file_bytes = Some(data.to_vec());
            }
            Some("description") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| multipart_error("invalid description", err))?;
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    description = Some(trimmed.to_string());
                }
            }
            Some("is_public") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| multipart_error("invalid is_public flag", err))?;
                is_public = parse_flag(value.trim());
            }
            _ => {}
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| {
        error!("upload rejected: missing file field");
        AppError::bad_request("file field is required")
    })?;
    let filename = filename.ok_or_else(|| {
        error!("upload rejected: missing filename");
        AppError::bad_request("filename is required")
    })?;

    let upload = Upload {
        filename,
        bytes: file_bytes,
        content_type,
        description,
        is_public,
    };
    let asset = files::upload(&state, &principal, upload).await?;
    Ok(ApiResponse::created("file uploaded", asset.into()))
}

pub async fn list_files(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Query(params), _): WithRejection<Query<ListFilesQuery>, AppError>,
) -> AppResult<Json<ApiResponse<Page<FileResponse>>>> {
    let request = PageRequest::new(params.page, params.size)?;
    let page = files::list_own(&state, &principal, request)?;
    Ok(ApiResponse::ok("ok", page.map(FileResponse::from)))
}

pub async fn list_public_files(
    State(state): State<AppState>,
    WithRejection(Query(params), _): WithRejection<Query<ListFilesQuery>, AppError>,
) -> AppResult<Json<ApiResponse<Page<FileResponse>>>> {
    let request = PageRequest::new(params.page, params.size)?;
    let page = files::list_public(&state, request)?;
    Ok(ApiResponse::ok("ok", page.map(FileResponse::from)))
}

pub async fn get_file(
    State(state): State<AppState>,
    principal: Option<Principal>,
    WithRejection(Path(file_id), _): WithRejection<Path<Uuid>, AppError>,
) -> AppResult<Json<ApiResponse<FileResponse>>> {
    let asset = files::get_for_read(&state, principal.as_ref(), file_id)?;
    Ok(ApiResponse::ok("ok", asset.into()))
}

pub async fn download_file(
    State(state): State<AppState>,
    principal: Option<Principal>,
    WithRejection(Path(file_id), _): WithRejection<Path<Uuid>, AppError>,
) -> AppResult<impl IntoResponse> {
    let (asset, bytes) = files::download(&state, principal.as_ref(), file_id).await?;

    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&asset.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Some(disposition) = inline_content_disposition(&asset.original_filename)
        .and_then(|value| HeaderValue::from_str(&value).ok())
    {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    Ok((StatusCode::OK, headers, bytes))
}

pub async fn update_file(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Path(file_id), _): WithRejection<Path<Uuid>, AppError>,
    WithRejection(Json(payload), _): WithRejection<Json<Value>, AppError>,
) -> AppResult<Json<ApiResponse<FileResponse>>> {
    if !payload.is_object() {
        return Err(AppError::bad_request("request body must be a JSON object"));
    }
    let description = classify_nullable(payload.get("description"))
        .map_err(|msg| AppError::bad_request(format!("description: {msg}")))?
        .into_patch()
        .map(|value| value.map(|text| text.trim().to_string()).filter(|t| !t.is_empty()));
    let is_public = classify_bool(payload.get("is_public"))
        .map_err(|msg| AppError::bad_request(format!("is_public: {msg}")))?;

    let patch = FilePatch {
        description,
        is_public,
    };
    let asset = files::update(&state, &principal, file_id, patch)?;
    Ok(ApiResponse::ok("file updated", asset.into()))
}

pub async fn delete_file(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Path(file_id), _): WithRejection<Path<Uuid>, AppError>,
) -> AppResult<Json<ApiResponse<Option<()>>>> {
    files::delete(&state, &principal, file_id).await?;
    Ok(ApiResponse::ok("file deleted", None))
}
