pub mod access;
pub mod accounts;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod files;
pub mod hashing;
pub mod ledger;
pub mod models;
pub mod notes;
pub mod quota;
pub mod routes;
pub mod s3;
pub mod schema;
pub mod state;
pub mod storage;
pub mod summarizer;
pub mod utils;

pub use routes::create_router;
pub use state::AppState;
