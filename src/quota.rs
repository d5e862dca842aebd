use diesel::{
    dsl::{count_star, sql},
    prelude::*,
    sql_types::BigInt,
    PgConnection,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult, QuotaKind};
use crate::schema::file_assets;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OwnerUsage {
    pub file_count: i64,
    pub total_bytes: i64,
}

/// Per-owner ceilings on file count and cumulative bytes.
///
/// The check runs before the blob write and does not reserve capacity, so
/// concurrent uploads from the same owner can overshoot marginally.
#[derive(Debug, Clone, Copy)]
pub struct QuotaGuard {
    max_files: i64,
    max_bytes: i64,
}

impl QuotaGuard {
    pub fn new(max_files: i64, max_bytes: i64) -> Self {
        Self {
            max_files,
            max_bytes,
        }
    }

    pub fn max_files(&self) -> i64 {
        self.max_files
    }

    pub fn max_bytes(&self) -> i64 {
        self.max_bytes
    }

    pub fn check(&self, usage: OwnerUsage, incoming_bytes: i64) -> AppResult<()> {
        if usage.file_count >= self.max_files {
            return Err(AppError::quota_exceeded(
                QuotaKind::Count,
                format!("file count limit of {} reached", self.max_files),
            ));
        }
        let exceeds = usage
            .total_bytes
            .checked_add(incoming_bytes)
            .map_or(true, |total| total > self.max_bytes);
        if exceeds {
            return Err(AppError::quota_exceeded(
                QuotaKind::Bytes,
                format!(
                    "storage limit of {} bytes would be exceeded ({} used, {} incoming)",
                    self.max_bytes, usage.total_bytes, incoming_bytes
                ),
            ));
        }
        Ok(())
    }

    pub fn check_and_reserve(
        &self,
        conn: &mut PgConnection,
        owner_id: Uuid,
        incoming_bytes: i64,
    ) -> AppResult<OwnerUsage> {
        let usage = usage_for(conn, owner_id)?;
        self.check(usage, incoming_bytes)?;
        Ok(usage)
    }
}

fn total_bytes_expr() -> diesel::expression::SqlLiteral<BigInt> {
    sql::<BigInt>("COALESCE(SUM(size_bytes), 0)::BIGINT")
}

pub fn usage_for(conn: &mut PgConnection, owner_id: Uuid) -> QueryResult<OwnerUsage> {
    let (file_count, total_bytes) = file_assets::table
        .filter(file_assets::owner_id.eq(owner_id))
        .select((count_star(), total_bytes_expr()))
        .first::<(i64, i64)>(conn)?;
    Ok(OwnerUsage {
        file_count,
        total_bytes,
    })
}

pub fn usage_by_owner(conn: &mut PgConnection) -> QueryResult<Vec<(Uuid, OwnerUsage)>> {
    let rows: Vec<(Uuid, i64, i64)> = file_assets::table
        .group_by(file_assets::owner_id)
        .select((file_assets::owner_id, count_star(), total_bytes_expr()))
        .order(file_assets::owner_id.asc())
        .load(conn)?;
    Ok(rows
        .into_iter()
        .map(|(owner_id, file_count, total_bytes)| {
            (
                owner_id,
                OwnerUsage {
                    file_count,
                    total_bytes,
                },
            )
        })
        .collect())
}
