use axum::http::{HeaderValue, StatusCode};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{auth::Principal, state::AppState};

pub mod auth;
pub mod files;
pub mod health;
pub mod notes;

/// Multipart framing on top of the largest accepted file.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Success envelope shared by every JSON endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub message: String,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            code: StatusCode::OK.as_u16(),
            message: message.into(),
            data,
        })
    }

    pub fn created(message: impl Into<String>, data: T) -> (StatusCode, Json<Self>) {
        (
            StatusCode::CREATED,
            Json(Self {
                code: StatusCode::CREATED.as_u16(),
                message: message.into(),
                data,
            }),
        )
    }
}

pub(crate) fn to_iso(value: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(value, Utc).to_rfc3339()
}

fn cors_layer(allowed: Option<&String>) -> CorsLayer {
    let allow_origin = match allowed {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(_) => {
                        warn!(origin = %value, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router<()> {
    let cors = cors_layer(state.config.cors_allowed_origin.as_ref());
    let body_limit = usize::try_from(state.config.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me))
        .route("/profile", put(auth::update_profile))
        .route("/account", delete(auth::delete_account));

    let notes_routes = Router::new()
        .route("/", get(notes::list_notes).post(notes::create_note))
        .route("/search", get(notes::search_notes))
        .route("/tags", get(notes::list_tags))
        .route(
            "/:id",
            get(notes::get_note)
                .put(notes::update_note)
                .patch(notes::update_note)
                .delete(notes::delete_note),
        )
        .route("/:id/tags", post(notes::update_note_tags))
        .route("/:id/versions", get(notes::list_versions))
        .route("/:id/versions/:version_number", get(notes::get_version))
        .route(
            "/:id/versions/:version_number/restore",
            post(notes::restore_version),
        );

    // Handlers extract `Principal` or `Option<Principal>` themselves, since
    // public assets are readable anonymously.
    let files_routes = Router::new()
        .route("/", get(files::list_files).post(files::upload_file))
        .route("/public", get(files::list_public_files))
        .route(
            "/:id",
            get(files::get_file)
                .put(files::update_file)
                .patch(files::update_file)
                .delete(files::delete_file),
        )
        .route("/:id/download", get(files::download_file));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/notes", notes_routes)
        .layer(middleware::from_extractor_with_state::<Principal, _>(
            protected_state,
        ));

    Router::new()
        .merge(protected_routes)
        .nest("/api/files", files_routes)
        .nest("/api/auth", auth_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}
