//! Profile changes and removal of the signed-in user's account.
//!
//! Deleting a user cascades to notes, their versions, file metadata and
//! refresh tokens in the database. Blobs are reclaimed afterwards the same
//! way single-file deletes do it.

use chrono::Utc;
use diesel::prelude::*;
use tracing::info;
use uuid::Uuid;

use crate::auth::{password, Principal};
use crate::error::{AppError, AppResult};
use crate::files::reclaim_blob;
use crate::models::User;
use crate::schema::{file_assets, refresh_tokens, users};
use crate::state::AppState;

const USERNAME_CHARS: std::ops::RangeInclusive<usize> = 3..=50;
const PASSWORD_CHARS: std::ops::RangeInclusive<usize> = 6..=100;

#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = users)]
struct UserChangeset {
    username: Option<String>,
    password_hash: Option<String>,
}

/// Trimmed username, 3 to 50 characters.
pub fn normalize_username(raw: &str) -> AppResult<String> {
    let username = raw.trim();
    if !USERNAME_CHARS.contains(&username.chars().count()) {
        return Err(AppError::bad_request(
            "username must be between 3 and 50 characters",
        ));
    }
    Ok(username.to_string())
}

pub fn check_password(raw: &str) -> AppResult<()> {
    if !PASSWORD_CHARS.contains(&raw.chars().count()) {
        return Err(AppError::bad_request(
            "password must be between 6 and 100 characters",
        ));
    }
    Ok(())
}

fn taken(err: diesel::result::Error) -> AppError {
    match AppError::from(err) {
        err if err.is_conflict() => AppError::conflict("username already taken"),
        err => err,
    }
}

pub fn update_profile(
    state: &AppState,
    principal: &Principal,
    update: ProfileUpdate,
) -> AppResult<User> {
    let username = update.username.as_deref().map(normalize_username).transpose()?;
    let password_hash = match update.password.as_deref() {
        Some(raw) => {
            check_password(raw)?;
            Some(password::hash_password(raw)?)
        }
        None => None,
    };
    let password_changed = password_hash.is_some();

    let mut conn = state.db()?;
    let user = conn.transaction::<User, AppError, _>(|conn| {
        let current: User = users::table
            .find(principal.user_id)
            .first(conn)
            .optional()?
            .ok_or_else(AppError::not_found)?;

        let username = username.filter(|name| *name != current.username);
        if let Some(name) = &username {
            let clash = users::table
                .filter(users::username.eq(name))
                .filter(users::id.ne(current.id))
                .select(users::id)
                .first::<Uuid>(conn)
                .optional()?;
            if clash.is_some() {
                return Err(AppError::conflict("username already taken"));
            }
        }

        let changeset = UserChangeset {
            username,
            password_hash,
        };
        if changeset.username.is_none() && changeset.password_hash.is_none() {
            return Ok(current);
        }

        let updated = diesel::update(users::table.find(current.id))
            .set((&changeset, users::updated_at.eq(Utc::now().naive_utc())))
            .get_result::<User>(conn)
            .map_err(taken)?;

        // Existing sessions end with the old password.
        if password_changed {
            diesel::delete(refresh_tokens::table.filter(refresh_tokens::user_id.eq(current.id)))
                .execute(conn)?;
        }
        Ok(updated)
    })?;

    info!(
        user_id = %user.id,
        username = %user.username,
        password_changed,
        "profile updated"
    );
    Ok(user)
}

/// Removes the account and everything it owns. Returns how many blobs could
/// not be removed; those are left for the sweep.
pub async fn delete_account(state: &AppState, principal: &Principal) -> AppResult<usize> {
    let storage_paths = {
        let mut conn = state.db()?;
        conn.transaction::<Vec<String>, AppError, _>(|conn| {
            let user: User = users::table
                .find(principal.user_id)
                .first(conn)
                .optional()?
                .ok_or_else(AppError::not_found)?;
            if user.is_superuser {
                return Err(AppError::bad_request(
                    "superuser accounts cannot be deleted",
                ));
            }

            let storage_paths = file_assets::table
                .filter(file_assets::owner_id.eq(user.id))
                .select(file_assets::storage_path)
                .load::<String>(conn)?;
            diesel::delete(users::table.find(user.id)).execute(conn)?;
            Ok(storage_paths)
        })?
    };

    let mut leftover = 0;
    for storage_path in &storage_paths {
        if !reclaim_blob(&state.blobs, storage_path).await {
            leftover += 1;
        }
    }

    info!(
        user_id = %principal.user_id,
        blobs = storage_paths.len(),
        blobs_left = leftover,
        "account deleted"
    );
    Ok(leftover)
}
