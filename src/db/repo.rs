use super::model::{IdMapping, StoredCredentials};
use crate::model::EntityType;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("connecting to {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx creates the file only when asked to.
    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{expanded}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("running migrations")?;
    Ok(())
}

fn mapping_from_row(row: &SqliteRow) -> Result<IdMapping> {
    let kind: String = row.try_get("entity_type")?;
    let entity_type =
        EntityType::parse(&kind).ok_or_else(|| anyhow!("unknown entity type {kind}"))?;
    Ok(IdMapping {
        entity_type,
        external_id: row.try_get("external_id")?,
        internal_id: row.try_get("internal_id")?,
        version: row.try_get("version")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[instrument(skip_all)]
pub async fn get_mapping(
    pool: &Pool,
    entity_type: EntityType,
    external_id: i64,
) -> Result<Option<IdMapping>> {
    let row = sqlx::query(
        "SELECT entity_type, external_id, internal_id, version, updated_at \
         FROM id_mappings WHERE entity_type = ? AND external_id = ?",
    )
    .bind(entity_type.as_str())
    .bind(external_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(mapping_from_row).transpose()
}

/// Insert or replace the mapping for `(entity_type, external_id)`.
#[instrument(skip_all)]
pub async fn save_mapping(
    pool: &Pool,
    entity_type: EntityType,
    external_id: i64,
    internal_id: &str,
    version: &str,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO id_mappings (entity_type, external_id, internal_id, version, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(entity_type, external_id) DO UPDATE SET \
            internal_id = excluded.internal_id, \
            version = excluded.version, \
            updated_at = excluded.updated_at",
    )
    .bind(entity_type.as_str())
    .bind(external_id)
    .bind(internal_id)
    .bind(version)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .with_context(|| format!("saving mapping {entity_type}/{external_id}"))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn update_mapping_version(
    pool: &Pool,
    entity_type: EntityType,
    external_id: i64,
    version: &str,
) -> Result<()> {
    let affected = sqlx::query(
        "UPDATE id_mappings SET version = ?, updated_at = ? WHERE entity_type = ? AND external_id = ?",
    )
    .bind(version)
    .bind(Utc::now())
    .bind(entity_type.as_str())
    .bind(external_id)
    .execute(pool)
    .await?
    .rows_affected();
    if affected == 0 {
        return Err(anyhow!("no mapping for {entity_type}/{external_id}"));
    }
    Ok(())
}

pub async fn count_mappings(pool: &Pool, entity_type: EntityType) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM id_mappings WHERE entity_type = ?")
        .bind(entity_type.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn load_credentials(pool: &Pool, character_id: i64) -> Result<Option<StoredCredentials>> {
    let row = sqlx::query(
        "SELECT character_id, access_token, refresh_token, expires_at FROM credentials WHERE character_id = ?",
    )
    .bind(character_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(StoredCredentials {
        character_id: row.try_get("character_id")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        expires_at: row.try_get::<Option<DateTime<Utc>>, _>("expires_at")?,
    }))
}

#[instrument(skip_all)]
pub async fn save_credentials(pool: &Pool, creds: &StoredCredentials) -> Result<()> {
    sqlx::query(
        "INSERT INTO credentials (character_id, access_token, refresh_token, expires_at, updated_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(character_id) DO UPDATE SET \
            access_token = excluded.access_token, \
            refresh_token = excluded.refresh_token, \
            expires_at = excluded.expires_at, \
            updated_at = excluded.updated_at",
    )
    .bind(creds.character_id)
    .bind(creds.access_token.as_deref())
    .bind(&creds.refresh_token)
    .bind(creds.expires_at)
    .bind(Utc::now())
    .execute(pool)
    .await
    .with_context(|| format!("saving credentials for {}", creds.character_id))?;
    Ok(())
}
