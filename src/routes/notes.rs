use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use axum_extra::extract::WithRejection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{to_iso, ApiResponse};
use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::models::{Document, DocumentVersion};
use crate::notes::{self, NewNote, NoteFilter, NotePatch};
use crate::state::AppState;
use crate::utils::pagination::{Page, PageRequest};

#[derive(Deserialize)]
pub struct CreateNoteRequest {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Deserialize)]
pub struct UpdateNoteRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub change_description: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateTagsRequest {
    pub tags: Vec<String>,
}

#[derive(Deserialize, Default)]
pub struct ListNotesQuery {
    pub page: Option<i64>,
    pub size: Option<i64>,
    /// Comma-separated; matches notes carrying any of the tags.
    pub tags: Option<String>,
    #[serde(alias = "q")]
    pub search: Option<String>,
    pub user_id: Option<Uuid>,
}

#[derive(Deserialize, Default)]
pub struct SearchNotesQuery {
    #[serde(alias = "q")]
    pub query: Option<String>,
    pub tags: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct NoteResponse {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Document> for NoteResponse {
    fn from(document: Document) -> Self {
        Self {
            id: document.id,
            owner_id: document.owner_id,
            title: document.title,
            content: document.content,
            summary: document.summary,
            tags: document.tags,
            created_at: to_iso(document.created_at),
            updated_at: to_iso(document.updated_at),
        }
    }
}

#[derive(Serialize)]
pub struct VersionResponse {
    pub id: Uuid,
    pub document_id: Uuid,
    pub version_number: i32,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub change_description: Option<String>,
    pub created_at: String,
}

impl From<DocumentVersion> for VersionResponse {
    fn from(version: DocumentVersion) -> Self {
        Self {
            id: version.id,
            document_id: version.document_id,
            version_number: version.version_number,
            title: version.title,
            content: version.content,
            summary: version.summary,
            tags: version.tags,
            change_description: version.change_description,
            created_at: to_iso(version.created_at),
        }
    }
}

fn split_tags(raw: Option<String>) -> Vec<String> {
    raw.map(|value| value.split(',').map(str::to_string).collect())
        .unwrap_or_default()
}

pub async fn create_note(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Json(payload), _): WithRejection<Json<CreateNoteRequest>, AppError>,
) -> AppResult<(StatusCode, Json<ApiResponse<NoteResponse>>)> {
    let input = NewNote {
        title: payload.title,
        content: payload.content,
        tags: payload.tags,
    };
    let document = notes::create(&state, &principal, input).await?;
    Ok(ApiResponse::created("note created", document.into()))
}

pub async fn list_notes(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Query(params), _): WithRejection<Query<ListNotesQuery>, AppError>,
) -> AppResult<Json<ApiResponse<Page<NoteResponse>>>> {
    let request = PageRequest::new(params.page, params.size)?;
    let filter = NoteFilter::new(params.search, split_tags(params.tags));
    let page = notes::list(&state, &principal, request, &filter, params.user_id)?;
    Ok(ApiResponse::ok("ok", page.map(NoteResponse::from)))
}

pub async fn search_notes(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Query(params), _): WithRejection<Query<SearchNotesQuery>, AppError>,
) -> AppResult<Json<ApiResponse<Vec<NoteResponse>>>> {
    let filter = NoteFilter::new(params.query, split_tags(params.tags));
    let documents = notes::search(&state, &principal, &filter, params.limit)?;
    Ok(ApiResponse::ok(
        "ok",
        documents.into_iter().map(NoteResponse::from).collect(),
    ))
}

pub async fn list_tags(
    State(state): State<AppState>,
    principal: Principal,
) -> AppResult<Json<ApiResponse<Vec<String>>>> {
    let tags = notes::list_tags(&state, &principal)?;
    Ok(ApiResponse::ok("ok", tags))
}

pub async fn get_note(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Path(note_id), _): WithRejection<Path<Uuid>, AppError>,
) -> AppResult<Json<ApiResponse<NoteResponse>>> {
    let document = notes::get(&state, &principal, note_id)?;
    Ok(ApiResponse::ok("ok", document.into()))
}

pub async fn update_note(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Path(note_id), _): WithRejection<Path<Uuid>, AppError>,
    WithRejection(Json(payload), _): WithRejection<Json<UpdateNoteRequest>, AppError>,
) -> AppResult<Json<ApiResponse<NoteResponse>>> {
    let patch = NotePatch {
        title: payload.title,
        content: payload.content,
        tags: payload.tags,
        change_description: payload.change_description,
    };
    let document = notes::update(&state, &principal, note_id, patch).await?;
    Ok(ApiResponse::ok("note updated", document.into()))
}

pub async fn update_note_tags(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Path(note_id), _): WithRejection<Path<Uuid>, AppError>,
    WithRejection(Json(payload), _): WithRejection<Json<UpdateTagsRequest>, AppError>,
) -> AppResult<Json<ApiResponse<NoteResponse>>> {
    let document = notes::update_tags(&state, &principal, note_id, payload.tags)?;
    Ok(ApiResponse::ok("tags updated", document.into()))
}

pub async fn delete_note(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Path(note_id), _): WithRejection<Path<Uuid>, AppError>,
) -> AppResult<Json<ApiResponse<Option<()>>>> {
    notes::delete(&state, &principal, note_id)?;
    Ok(ApiResponse::ok("note deleted", None))
}

pub async fn list_versions(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Path(note_id), _): WithRejection<Path<Uuid>, AppError>,
) -> AppResult<Json<ApiResponse<Vec<VersionResponse>>>> {
    let versions = notes::list_versions(&state, &principal, note_id)?;
    Ok(ApiResponse::ok(
        "ok",
        versions.into_iter().map(VersionResponse::from).collect(),
    ))
}

pub async fn get_version(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Path((note_id, version_number)), _): WithRejection<Path<(Uuid, i32)>, AppError>,
) -> AppResult<Json<ApiResponse<VersionResponse>>> {
    let version = notes::get_version(&state, &principal, note_id, version_number)?;
    Ok(ApiResponse::ok("ok", version.into()))
}

pub async fn restore_version(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Path((note_id, version_number)), _): WithRejection<Path<(Uuid, i32)>, AppError>,
) -> AppResult<Json<ApiResponse<NoteResponse>>> {
    let document = notes::restore_version(&state, &principal, note_id, version_number)?;
    Ok(ApiResponse::ok(
        format!("restored to version {version_number}"),
        document.into(),
    ))
}
