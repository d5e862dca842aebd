//! Note lifecycle. Every mutation of title, content or tags goes through the
//! ledger in the same transaction as the live-row update.

use std::collections::BTreeSet;

use chrono::Utc;
use diesel::{pg::Pg, prelude::*, PgConnection};
use tracing::info;
use uuid::Uuid;

use crate::access::{self, Action, Resource};
use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::ledger::{self, Snapshot};
use crate::models::{Document, DocumentVersion, NewDocument};
use crate::schema::documents;
use crate::state::AppState;
use crate::summarizer::{fallback_summary, summarize_or_fallback};
use crate::utils::pagination::{Page, PageRequest, MAX_PAGE_SIZE};

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_CHANGE_DESCRIPTION_CHARS: usize = 500;
pub const DEFAULT_SEARCH_LIMIT: i64 = 50;

const INITIAL_DESCRIPTION: &str = "initial version";
const UPDATE_DESCRIPTION: &str = "note updated";
const TAG_UPDATE_DESCRIPTION: &str = "tag update";

#[derive(Debug, Clone)]
pub struct NewNote {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NotePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub change_description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NoteFilter {
    pub query: Option<String>,
    pub tags: Vec<String>,
}

impl NoteFilter {
    pub fn new(query: Option<String>, tags: Vec<String>) -> Self {
        Self {
            query: query
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty()),
            tags: normalize_tags(tags),
        }
    }
}

/// Trimmed, non-empty, de-duplicated and sorted.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    tags.into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn validate_title(raw: &str) -> AppResult<String> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(AppError::bad_request(format!(
            "title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(title.to_string())
}

fn validate_change_description(raw: Option<String>) -> AppResult<Option<String>> {
    let Some(description) = raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty()) else {
        return Ok(None);
    };
    if description.chars().count() > MAX_CHANGE_DESCRIPTION_CHARS {
        return Err(AppError::bad_request(format!(
            "change description must be at most {MAX_CHANGE_DESCRIPTION_CHARS} characters"
        )));
    }
    Ok(Some(description))
}

/// Superusers may list another user's notes; everyone else only their own.
pub fn resolve_list_owner(principal: &Principal, target_user_id: Option<Uuid>) -> AppResult<Uuid> {
    match target_user_id {
        None => Ok(principal.user_id),
        Some(target) if target == principal.user_id || principal.is_superuser => Ok(target),
        Some(_) => Err(AppError::forbidden(
            "only superusers may list another user's notes",
        )),
    }
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn snapshot_of(document: &Document) -> Snapshot {
    Snapshot {
        title: document.title.clone(),
        content: document.content.clone(),
        summary: document.summary.clone(),
        tags: document.tags.clone(),
    }
}

fn load_authorized(
    conn: &mut PgConnection,
    principal: &Principal,
    document_id: Uuid,
    action: Action,
) -> AppResult<Document> {
    let document = documents::table
        .find(document_id)
        .first::<Document>(conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    access::ensure(Some(principal), Resource::from(&document), action)?;
    Ok(document)
}

fn write_live_fields(
    conn: &mut PgConnection,
    document_id: Uuid,
    snapshot: &Snapshot,
) -> AppResult<Document> {
    let document = diesel::update(documents::table.find(document_id))
        .set((
            documents::title.eq(&snapshot.title),
            documents::content.eq(&snapshot.content),
            documents::summary.eq(&snapshot.summary),
            documents::tags.eq(&snapshot.tags),
            documents::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result::<Document>(conn)?;
    Ok(document)
}

fn commit_snapshot(
    conn: &mut PgConnection,
    document_id: Uuid,
    snapshot: &Snapshot,
    description: &str,
) -> AppResult<Document> {
    let version = ledger::record_next_version(conn, document_id, snapshot, Some(description))?;
    let document = write_live_fields(conn, document_id, snapshot)?;
    info!(document_id = %document_id, version_number = version.version_number, "note version recorded");
    Ok(document)
}

fn filtered_documents<'a>(owner_id: Uuid, filter: &NoteFilter) -> documents::BoxedQuery<'a, Pg> {
    let mut query = documents::table
        .filter(documents::owner_id.eq(owner_id))
        .into_boxed();
    if let Some(text) = &filter.query {
        let pattern = format!("%{}%", escape_like(text));
        query = query.filter(
            documents::title
                .ilike(pattern.clone())
                .or(documents::content.ilike(pattern)),
        );
    }
    if !filter.tags.is_empty() {
        query = query.filter(documents::tags.overlaps_with(filter.tags.clone()));
    }
    query
}

pub async fn create(state: &AppState, owner: &Principal, input: NewNote) -> AppResult<Document> {
    let title = validate_title(&input.title)?;
    let tags = normalize_tags(input.tags);
    let summary =
        summarize_or_fallback(state.summarizer.as_ref(), &input.content, Some(&title)).await;

    let new_document = NewDocument {
        id: Uuid::new_v4(),
        owner_id: owner.user_id,
        title,
        content: input.content,
        summary: Some(summary),
        tags,
    };

    let mut conn = state.db()?;
    let document = conn.transaction::<Document, AppError, _>(|conn| {
        let document: Document = diesel::insert_into(documents::table)
            .values(&new_document)
            .get_result(conn)?;
        ledger::record_initial_version(
            conn,
            document.id,
            &snapshot_of(&document),
            Some(INITIAL_DESCRIPTION),
        )?;
        Ok(document)
    })?;

    info!(document_id = %document.id, owner_id = %owner.user_id, "note created");
    Ok(document)
}

pub fn get(state: &AppState, principal: &Principal, document_id: Uuid) -> AppResult<Document> {
    let mut conn = state.db()?;
    load_authorized(&mut conn, principal, document_id, Action::Read)
}

pub async fn update(
    state: &AppState,
    principal: &Principal,
    document_id: Uuid,
    patch: NotePatch,
) -> AppResult<Document> {
    let title = patch.title.as_deref().map(validate_title).transpose()?;
    let content = patch.content;
    let tags = patch.tags.map(normalize_tags);
    let description = validate_change_description(patch.change_description)?
        .unwrap_or_else(|| UPDATE_DESCRIPTION.to_string());

    // The remote summary is computed outside the transaction; it is only used
    // if the text it was computed from is still what gets committed.
    let summarized = if title.is_some() || content.is_some() {
        let current = {
            let mut conn = state.db()?;
            load_authorized(&mut conn, principal, document_id, Action::Update)?
        };
        let next_title = title.clone().unwrap_or(current.title);
        let next_content = content.clone().unwrap_or(current.content);
        let summary =
            summarize_or_fallback(state.summarizer.as_ref(), &next_content, Some(&next_title))
                .await;
        Some((next_title, next_content, summary))
    } else {
        None
    };

    let mut conn = state.db()?;
    ledger::with_conflict_retry(state.config.version_conflict_retries, |_| {
        conn.transaction::<Document, AppError, _>(|conn| {
            let current = load_authorized(conn, principal, document_id, Action::Update)?;
            let mut next = snapshot_of(&current);
            if let Some(title) = &title {
                next.title = title.clone();
            }
            if let Some(content) = &content {
                next.content = content.clone();
            }
            if let Some(tags) = &tags {
                next.tags = tags.clone();
            }
            if let Some((summarized_title, summarized_content, summary)) = &summarized {
                let fresh = *summarized_title == next.title && *summarized_content == next.content;
                next.summary = Some(if fresh {
                    summary.clone()
                } else {
                    fallback_summary(&next.content, Some(&next.title))
                });
            }
            commit_snapshot(conn, document_id, &next, &description)
        })
    })
}

pub fn update_tags(
    state: &AppState,
    principal: &Principal,
    document_id: Uuid,
    tags: Vec<String>,
) -> AppResult<Document> {
    let tags = normalize_tags(tags);
    let mut conn = state.db()?;
    ledger::with_conflict_retry(state.config.version_conflict_retries, |_| {
        conn.transaction::<Document, AppError, _>(|conn| {
            let current = load_authorized(conn, principal, document_id, Action::Update)?;
            let mut next = snapshot_of(&current);
            next.tags = tags.clone();
            commit_snapshot(conn, document_id, &next, TAG_UPDATE_DESCRIPTION)
        })
    })
}

pub fn restore_version(
    state: &AppState,
    principal: &Principal,
    document_id: Uuid,
    version_number: i32,
) -> AppResult<Document> {
    let mut conn = state.db()?;
    let document = ledger::with_conflict_retry(state.config.version_conflict_retries, |_| {
        conn.transaction::<Document, AppError, _>(|conn| {
            load_authorized(conn, principal, document_id, Action::Update)?;
            let restored = ledger::restore(conn, document_id, version_number)?;
            let mut snapshot = Snapshot::from(&restored);
            if snapshot.summary.is_none() {
                snapshot.summary = Some(fallback_summary(&snapshot.content, Some(&snapshot.title)));
            }
            write_live_fields(conn, document_id, &snapshot)
        })
    })?;
    info!(document_id = %document_id, restored_from = version_number, "note restored");
    Ok(document)
}

pub fn delete(state: &AppState, principal: &Principal, document_id: Uuid) -> AppResult<()> {
    let mut conn = state.db()?;
    conn.transaction::<(), AppError, _>(|conn| {
        load_authorized(conn, principal, document_id, Action::Delete)?;
        diesel::delete(documents::table.find(document_id)).execute(conn)?;
        Ok(())
    })?;
    info!(document_id = %document_id, "note deleted");
    Ok(())
}

pub fn list(
    state: &AppState,
    principal: &Principal,
    request: PageRequest,
    filter: &NoteFilter,
    target_user_id: Option<Uuid>,
) -> AppResult<Page<Document>> {
    let owner_id = resolve_list_owner(principal, target_user_id)?;
    let mut conn = state.db()?;

    let total: i64 = filtered_documents(owner_id, filter)
        .count()
        .get_result(&mut conn)?;
    let items = filtered_documents(owner_id, filter)
        .order((documents::updated_at.desc(), documents::id.desc()))
        .offset(request.offset())
        .limit(request.limit())
        .load::<Document>(&mut conn)?;

    Ok(Page::new(items, total, request))
}

pub fn search(
    state: &AppState,
    principal: &Principal,
    filter: &NoteFilter,
    limit: Option<i64>,
) -> AppResult<Vec<Document>> {
    let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(AppError::bad_request(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    let mut conn = state.db()?;
    let items = filtered_documents(principal.user_id, filter)
        .order((documents::updated_at.desc(), documents::id.desc()))
        .limit(limit)
        .load::<Document>(&mut conn)?;
    Ok(items)
}

pub fn list_tags(state: &AppState, principal: &Principal) -> AppResult<Vec<String>> {
    let mut conn = state.db()?;
    let rows: Vec<Vec<String>> = documents::table
        .filter(documents::owner_id.eq(principal.user_id))
        .select(documents::tags)
        .load(&mut conn)?;
    let tags: BTreeSet<String> = rows.into_iter().flatten().collect();
    Ok(tags.into_iter().collect())
}

pub fn list_versions(
    state: &AppState,
    principal: &Principal,
    document_id: Uuid,
) -> AppResult<Vec<DocumentVersion>> {
    let mut conn = state.db()?;
    load_authorized(&mut conn, principal, document_id, Action::Read)?;
    Ok(ledger::list_versions(&mut conn, document_id)?)
}

pub fn get_version(
    state: &AppState,
    principal: &Principal,
    document_id: Uuid,
    version_number: i32,
) -> AppResult<DocumentVersion> {
    let mut conn = state.db()?;
    load_authorized(&mut conn, principal, document_id, Action::Read)?;
    ledger::get_version(&mut conn, document_id, version_number)
}
