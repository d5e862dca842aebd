use std::collections::HashSet;
use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use tracing_subscriber::EnvFilter;

use notevault::{
    config::{AppConfig, StorageBackend},
    db, quota, s3,
    schema::{file_assets, users},
    storage::{LocalStorage, ObjectStorage, StoredObject},
};

const DEFAULT_MIN_AGE_MINUTES: i64 = 60;
const USAGE: &str = "Usage: maintenance sweep-blobs [--min-age-minutes N] | maintenance usage";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("sweep-blobs") => {
            let min_age = parse_min_age(args.collect())?;
            sweep_blobs(min_age).await?
        }
        Some("usage") => print_usage()?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn parse_min_age(args: Vec<String>) -> Result<ChronoDuration> {
    let mut min_age = DEFAULT_MIN_AGE_MINUTES;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--min-age-minutes" => {
                let value = iter.next().context("--min-age-minutes needs a value")?;
                min_age = value
                    .parse()
                    .with_context(|| format!("invalid --min-age-minutes value '{value}'"))?;
                if min_age < 0 {
                    bail!("--min-age-minutes must not be negative");
                }
            }
            other => bail!("unknown argument '{other}'\n{USAGE}"),
        }
    }
    match ChronoDuration::try_minutes(min_age) {
        Some(duration) => Ok(duration),
        None => bail!("--min-age-minutes value {min_age} is out of range"),
    }
}

fn load_config() -> Result<AppConfig> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        storage_backend = ?config.storage_backend,
        "loaded configuration"
    );
    Ok(config)
}

async fn open_storage(config: &AppConfig) -> Result<Arc<dyn ObjectStorage>> {
    Ok(match config.storage_backend {
        StorageBackend::Local => Arc::new(LocalStorage::new(config.upload_dir.clone())),
        StorageBackend::S3 => Arc::new(s3::build_storage(config).await?),
    })
}

/// Objects with no metadata row that are older than the grace period.
fn select_orphans(
    objects: Vec<StoredObject>,
    referenced: &HashSet<String>,
    min_age: ChronoDuration,
) -> Vec<StoredObject> {
    let Some(cutoff) = Utc::now().checked_sub_signed(min_age) else {
        return Vec::new();
    };
    objects
        .into_iter()
        .filter(|object| !referenced.contains(&object.key))
        .filter(|object| object.last_modified.map_or(true, |modified| modified <= cutoff))
        .collect()
}

async fn sweep_blobs(min_age: ChronoDuration) -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let storage = open_storage(&config).await?;

    let objects = storage
        .list_objects()
        .await
        .context("failed to list stored objects")?;

    let mut conn = pool.get().context("failed to get database connection")?;
    let referenced: HashSet<String> = file_assets::table
        .select(file_assets::storage_path)
        .load::<String>(&mut conn)
        .context("failed to load storage paths")?
        .into_iter()
        .collect();
    drop(conn);

    let total = objects.len();
    let orphans = select_orphans(objects, &referenced, min_age);
    if orphans.is_empty() {
        println!("No orphaned blobs among {total} objects.");
    } else {
        println!("Removing {} orphaned blobs of {total} objects…", orphans.len());
        let mut failed = 0usize;
        for object in &orphans {
            match storage.delete_object(&object.key).await {
                Ok(()) => tracing::info!(storage_path = %object.key, "orphan blob removed"),
                Err(err) => {
                    failed += 1;
                    tracing::error!(storage_path = %object.key, error = %err, "failed to remove orphan blob");
                }
            }
        }
        println!("Done. {} removed, {failed} failed.", orphans.len() - failed);
    }

    match storage.prune_empty_prefixes().await {
        Ok(0) => {}
        Ok(pruned) => println!("Pruned {pruned} empty directories."),
        Err(err) => tracing::warn!(error = %err, "failed to prune empty directories"),
    }
    Ok(())
}

fn print_usage() -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let usage = quota::usage_by_owner(&mut conn).context("failed to aggregate usage")?;
    if usage.is_empty() {
        println!("No files stored.");
        return Ok(());
    }

    let owner_ids: Vec<_> = usage.iter().map(|(owner_id, _)| *owner_id).collect();
    let names: Vec<(uuid::Uuid, String)> = users::table
        .filter(users::id.eq_any(owner_ids))
        .select((users::id, users::username))
        .load(&mut conn)
        .context("failed to load usernames")?;

    println!(
        "{:<36}  {:<20}  {:>12}  {:>16}",
        "owner_id", "username", "files", "bytes"
    );
    for (owner_id, totals) in &usage {
        let username = names
            .iter()
            .find(|(id, _)| id == owner_id)
            .map(|(_, name)| name.as_str())
            .unwrap_or("-");
        println!(
            "{:<36}  {:<20}  {:>5}/{:<6}  {:>7}/{:<8}",
            owner_id.to_string(),
            username,
            totals.file_count,
            config.max_files_per_user,
            totals.total_bytes,
            config.max_storage_per_user,
        );
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
