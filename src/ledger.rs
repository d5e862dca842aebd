//! Append-only version history for notes.
//!
//! Version numbers are derived as `max + 1` inside the caller's transaction.
//! Two writers racing on the same document both compute the same number; the
//! `(document_id, version_number)` unique constraint rejects the second insert
//! as [`ErrorKind::Conflict`] and the caller
//! reruns its whole transaction through [`with_conflict_retry`].

use diesel::{dsl::max, prelude::*, PgConnection};
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppError, AppResult, ErrorKind};
use crate::models::{DocumentVersion, NewDocumentVersion};
use crate::schema::document_versions;

/// The versioned payload of a note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
}

impl From<&DocumentVersion> for Snapshot {
    fn from(version: &DocumentVersion) -> Self {
        Snapshot {
            title: version.title.clone(),
            content: version.content.clone(),
            summary: version.summary.clone(),
            tags: version.tags.clone(),
        }
    }
}

pub fn record_initial_version(
    conn: &mut PgConnection,
    document_id: Uuid,
    snapshot: &Snapshot,
    description: Option<&str>,
) -> AppResult<DocumentVersion> {
    let existing = document_versions::table
        .filter(document_versions::document_id.eq(document_id))
        .filter(document_versions::version_number.eq(1))
        .select(document_versions::id)
        .first::<Uuid>(conn)
        .optional()?;
    if existing.is_some() {
        return Err(AppError::conflict(format!(
            "document {document_id} already has an initial version"
        )));
    }
    insert_version(conn, document_id, 1, snapshot, description)
}

pub fn record_next_version(
    conn: &mut PgConnection,
    document_id: Uuid,
    snapshot: &Snapshot,
    description: Option<&str>,
) -> AppResult<DocumentVersion> {
    let next_number = latest_version_number(conn, document_id)?.unwrap_or(0) + 1;
    insert_version(conn, document_id, next_number, snapshot, description)
}

pub fn latest_version_number(
    conn: &mut PgConnection,
    document_id: Uuid,
) -> QueryResult<Option<i32>> {
    document_versions::table
        .filter(document_versions::document_id.eq(document_id))
        .select(max(document_versions::version_number))
        .first(conn)
}

pub fn list_versions(
    conn: &mut PgConnection,
    document_id: Uuid,
) -> QueryResult<Vec<DocumentVersion>> {
    document_versions::table
        .filter(document_versions::document_id.eq(document_id))
        .order(document_versions::version_number.desc())
        .load(conn)
}

pub fn get_version(
    conn: &mut PgConnection,
    document_id: Uuid,
    version_number: i32,
) -> AppResult<DocumentVersion> {
    document_versions::table
        .filter(document_versions::document_id.eq(document_id))
        .filter(document_versions::version_number.eq(version_number))
        .first::<DocumentVersion>(conn)
        .optional()?
        .ok_or_else(|| {
            AppError::new(
                ErrorKind::NotFound,
                format!("version {version_number} not found"),
            )
        })
}

/// Appends a new version carrying the payload of `version_number`. The
/// restored version itself is left untouched.
pub fn restore(
    conn: &mut PgConnection,
    document_id: Uuid,
    version_number: i32,
) -> AppResult<DocumentVersion> {
    let target = get_version(conn, document_id, version_number)?;
    let description = restore_description(version_number);
    record_next_version(conn, document_id, &Snapshot::from(&target), Some(&description))
}

pub fn restore_description(version_number: i32) -> String {
    format!("restored from version {version_number}")
}

fn insert_version(
    conn: &mut PgConnection,
    document_id: Uuid,
    version_number: i32,
    snapshot: &Snapshot,
    description: Option<&str>,
) -> AppResult<DocumentVersion> {
    let new_version = NewDocumentVersion {
        id: Uuid::new_v4(),
        document_id,
        version_number,
        title: snapshot.title.clone(),
        content: snapshot.content.clone(),
        summary: snapshot.summary.clone(),
        tags: snapshot.tags.clone(),
        change_description: description.map(str::to_string),
    };

    let version = diesel::insert_into(document_versions::table)
        .values(&new_version)
        .get_result::<DocumentVersion>(conn)?;
    Ok(version)
}

/// Runs `operation` until it stops failing with a conflict or `attempts` is
/// used up. Every other error is returned immediately.
pub fn with_conflict_retry<T, F>(attempts: u32, mut operation: F) -> AppResult<T>
where
    F: FnMut(u32) -> AppResult<T>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Err(err) if err.is_conflict() && attempt < attempts => {
                warn!(attempt, max_attempts = attempts, error = %err, "version conflict, retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}
