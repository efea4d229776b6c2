use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::CoreError;

pub type DbPool = SqlitePool;

/// Opens (creating if missing) the SQLite database at `database_path` and
/// applies the schema.
pub async fn establish_connection(database_path: &str) -> Result<DbPool, CoreError> {
    let options = SqliteConnectOptions::new()
        .filename(database_path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Idempotent schema setup. Two logical tables per the data model: one row
/// per series, one row per customized occurrence (unique on
/// `(series_id, occurrence_dt)`), plus the exception-date rows a series
/// excludes from its generated sequence.
async fn migrate(pool: &DbPool) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS series (
            id               BLOB PRIMARY KEY NOT NULL,
            owner_id         BLOB NOT NULL,
            title            TEXT NOT NULL,
            description      TEXT,
            priority         TEXT NOT NULL DEFAULT 'none',
            pinned           BOOLEAN NOT NULL DEFAULT 0,
            item_order       INTEGER NOT NULL DEFAULT 0,
            list_id          BLOB,
            dtstart          TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL DEFAULT 0,
            rrule            TEXT,
            completed_at     TEXT,
            revision         INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS series_exception_dates (
            series_id     BLOB NOT NULL REFERENCES series(id) ON DELETE CASCADE,
            occurrence_dt TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            PRIMARY KEY (series_id, occurrence_dt)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS occurrence_overrides (
            series_id     BLOB NOT NULL REFERENCES series(id) ON DELETE CASCADE,
            occurrence_dt TEXT NOT NULL,
            start_at      TEXT,
            end_at        TEXT,
            title         TEXT,
            description   TEXT,
            priority      TEXT,
            completed     BOOLEAN NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            PRIMARY KEY (series_id, occurrence_dt)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_series_owner ON series(owner_id)")
        .execute(pool)
        .await?;

    Ok(())
}
