use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    Json,
};
use axum_extra::{extract::WithRejection, headers::Cookie, typed_header::TypedHeader};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use super::{to_iso, ApiResponse};
use crate::{
    accounts::{self, ProfileUpdate},
    auth::{password, Principal},
    error::{AppError, AppResult},
    models::{NewRefreshToken, NewUser, RefreshToken, User},
    schema::{refresh_tokens, users::dsl},
    state::AppState,
};

use crate::schema::refresh_tokens::dsl as refresh_dsl;

const REFRESH_COOKIE_NAME: &str = "refresh_token";

#[derive(Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct ProfileRequest {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub is_active: bool,
    pub is_superuser: bool,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            is_active: user.is_active,
            is_superuser: user.is_superuser,
            created_at: to_iso(user.created_at),
        }
    }
}

fn validate_credentials(payload: &CredentialsRequest) -> AppResult<String> {
    let username = accounts::normalize_username(&payload.username)?;
    accounts::check_password(&payload.password)?;
    Ok(username)
}

pub async fn register(
    State(state): State<AppState>,
    WithRejection(Json(payload), _): WithRejection<Json<CredentialsRequest>, AppError>,
) -> AppResult<(StatusCode, Json<ApiResponse<UserResponse>>)> {
    let username = validate_credentials(&payload)?;
    let password_hash = password::hash_password(&payload.password)?;

    let mut conn = state.db()?;
    let new_user = NewUser {
        id: Uuid::new_v4(),
        username: username.clone(),
        password_hash,
        is_active: true,
        is_superuser: false,
    };
    let user = diesel::insert_into(dsl::users)
        .values(&new_user)
        .get_result::<User>(&mut conn)
        .map_err(|err| match AppError::from(err) {
            err if err.is_conflict() => AppError::conflict("username already taken"),
            err => err,
        })?;

    info!(user_id = %user.id, username = %username, "user registered");
    Ok(ApiResponse::created("user registered", user.into()))
}

pub async fn login(
    State(state): State<AppState>,
    WithRejection(Json(payload), _): WithRejection<Json<CredentialsRequest>, AppError>,
) -> AppResult<(HeaderMap, Json<ApiResponse<LoginResponse>>)> {
    let mut conn = state.db()?;

    let user: User = dsl::users
        .filter(dsl::username.eq(payload.username.trim()))
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;

    let valid = password::verify_password(&payload.password, &user.password_hash)
        .map_err(|_| AppError::unauthorized())?;

    if !valid || !user.is_active {
        warn!(user_id = %user.id, "login rejected");
        return Err(AppError::unauthorized());
    }

    let access_token = state.jwt.generate_token(&user)?;
    let headers = issue_refresh_token(&state, &mut conn, user.id, Utc::now())?;

    Ok((
        headers,
        ApiResponse::ok("login successful", login_response(&state, access_token)),
    ))
}

pub async fn refresh(
    State(state): State<AppState>,
    jar: Option<TypedHeader<Cookie>>,
) -> AppResult<(HeaderMap, Json<ApiResponse<LoginResponse>>)> {
    let cookies = jar.ok_or_else(AppError::unauthorized)?;
    let refresh_value = cookies
        .get(REFRESH_COOKIE_NAME)
        .ok_or_else(AppError::unauthorized)?;

    let hashed = hash_refresh_token(refresh_value);
    let mut conn = state.db()?;
    let now = Utc::now();
    let now_naive = now.naive_utc();

    let (access_token, headers) = conn.transaction::<_, AppError, _>(|conn| {
        let token = refresh_dsl::refresh_tokens
            .filter(refresh_dsl::token_hash.eq(&hashed))
            .filter(refresh_dsl::revoked_at.is_null())
            .filter(refresh_dsl::expires_at.gt(now_naive))
            .first::<RefreshToken>(conn)
            .optional()?
            .ok_or_else(AppError::unauthorized)?;

        // Only the request that actually revokes the token may rotate it.
        let revoked = diesel::update(
            refresh_dsl::refresh_tokens
                .filter(refresh_dsl::id.eq(token.id))
                .filter(refresh_dsl::revoked_at.is_null()),
        )
        .set((
            refresh_dsl::revoked_at.eq(now_naive),
            refresh_dsl::updated_at.eq(now_naive),
        ))
        .execute(conn)?;
        if revoked != 1 {
            warn!(user_id = %token.user_id, "refresh token already rotated");
            return Err(AppError::unauthorized());
        }

        let user: User = dsl::users.find(token.user_id).first(conn)?;
        if !user.is_active {
            return Err(AppError::unauthorized());
        }

        let access_token = state.jwt.generate_token(&user)?;
        let headers = issue_refresh_token(&state, conn, user.id, now)?;
        Ok((access_token, headers))
    })?;

    Ok((
        headers,
        ApiResponse::ok("token refreshed", login_response(&state, access_token)),
    ))
}

pub async fn logout(
    State(state): State<AppState>,
    principal: Principal,
    jar: Option<TypedHeader<Cookie>>,
) -> AppResult<(HeaderMap, Json<ApiResponse<Option<()>>>)> {
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();
    let mut rows_affected = 0;

    if let Some(value) = jar.as_ref().and_then(|cookies| cookies.get(REFRESH_COOKIE_NAME)) {
        rows_affected = diesel::update(
            refresh_dsl::refresh_tokens
                .filter(refresh_dsl::token_hash.eq(hash_refresh_token(value)))
                .filter(refresh_dsl::user_id.eq(principal.user_id))
                .filter(refresh_dsl::revoked_at.is_null()),
        )
        .set((
            refresh_dsl::revoked_at.eq(now),
            refresh_dsl::updated_at.eq(now),
        ))
        .execute(&mut conn)?;
    }

    // Without a matching cookie every session of the user is revoked.
    if rows_affected == 0 {
        diesel::update(
            refresh_dsl::refresh_tokens
                .filter(refresh_dsl::user_id.eq(principal.user_id))
                .filter(refresh_dsl::revoked_at.is_null()),
        )
        .set((
            refresh_dsl::revoked_at.eq(now),
            refresh_dsl::updated_at.eq(now),
        ))
        .execute(&mut conn)?;
    }

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, build_clear_refresh_cookie(&state)?);
    Ok((headers, ApiResponse::ok("logged out", None)))
}

pub async fn me(
    State(state): State<AppState>,
    principal: Principal,
) -> AppResult<Json<ApiResponse<UserResponse>>> {
    let mut conn = state.db()?;
    let user: User = dsl::users.find(principal.user_id).first(&mut conn)?;
    Ok(ApiResponse::ok("ok", user.into()))
}

pub async fn update_profile(
    State(state): State<AppState>,
    principal: Principal,
    WithRejection(Json(payload), _): WithRejection<Json<ProfileRequest>, AppError>,
) -> AppResult<Json<ApiResponse<UserResponse>>> {
    let update = ProfileUpdate {
        username: payload.username,
        password: payload.password,
    };
    let user = accounts::update_profile(&state, &principal, update)?;
    Ok(ApiResponse::ok("profile updated", user.into()))
}

pub async fn delete_account(
    State(state): State<AppState>,
    principal: Principal,
) -> AppResult<(HeaderMap, Json<ApiResponse<Option<()>>>)> {
    accounts::delete_account(&state, &principal).await?;

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, build_clear_refresh_cookie(&state)?);
    Ok((headers, ApiResponse::ok("account deleted", None)))
}

fn login_response(state: &AppState, access_token: String) -> LoginResponse {
    LoginResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: state.jwt.expiry_seconds(),
    }
}

fn issue_refresh_token(
    state: &AppState,
    conn: &mut PgConnection,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> AppResult<HeaderMap> {
    let refresh_value = generate_refresh_token();
    let expires_at = now + ChronoDuration::days(state.config.refresh_token_expiry_days);

    let new_refresh = NewRefreshToken {
        id: Uuid::new_v4(),
        user_id,
        token_hash: hash_refresh_token(&refresh_value),
        issued_at: now.naive_utc(),
        expires_at: expires_at.naive_utc(),
    };
    diesel::insert_into(refresh_tokens::table)
        .values(&new_refresh)
        .execute(conn)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        build_refresh_cookie(state, &refresh_value, expires_at)?,
    );
    Ok(headers)
}

fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn cookie_attributes(state: &AppState, mut parts: Vec<String>) -> AppResult<HeaderValue> {
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Strict".into());
    if state.config.refresh_cookie_secure {
        parts.push("Secure".into());
    }
    if let Some(domain) = &state.config.refresh_cookie_domain {
        parts.push(format!("Domain={domain}"));
    }
    HeaderValue::from_str(&parts.join("; "))
        .map_err(|err| AppError::internal(format!("invalid refresh cookie: {err}")))
}

fn build_refresh_cookie(
    state: &AppState,
    token: &str,
    expires_at: DateTime<Utc>,
) -> AppResult<HeaderValue> {
    let max_age = ChronoDuration::days(state.config.refresh_token_expiry_days).num_seconds();
    cookie_attributes(
        state,
        vec![
            format!("{REFRESH_COOKIE_NAME}={token}"),
            format!("Max-Age={max_age}"),
            format!("Expires={}", expires_at.to_rfc2822()),
        ],
    )
}

fn build_clear_refresh_cookie(state: &AppState) -> AppResult<HeaderValue> {
    cookie_attributes(
        state,
        vec![
            format!("{REFRESH_COOKIE_NAME}="),
            "Max-Age=0".into(),
            "Expires=Thu, 01 Jan 1970 00:00:00 GMT".into(),
        ],
    )
}
