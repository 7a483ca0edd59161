//! SQLite-backed vocabulary store
//!
//! Pool construction and schema initialization live here; the query surface
//! (upserts, interning, linking, checkpoints) lives in [`queries`]. Every
//! query takes `&mut SqliteConnection`, so the same function works against a
//! pooled connection and inside an open transaction.

pub mod queries;

pub use queries::{
    get_source_progress, get_words_by_source, intern_sentence, link_word_to_source,
    update_source_progress, update_word_definitions, upsert_source, upsert_word, StoreError, Word,
};

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

/// Opens (or creates) the database file and returns a connection pool.
///
/// The pool is capped at a single connection: SQLite allows one writer at a
/// time and the batch writer serializes commits anyway, so a bigger pool
/// buys nothing and would break `:memory:` databases (each connection gets
/// its own).
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Creates the schema and applies the additive column migration.
///
/// All statements are idempotent; running `init` repeatedly is safe. Older
/// databases created before checkpointing existed gain the
/// `sources.last_processed_sentence` column with its `-1` default.
pub async fn init(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS words (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            word TEXT NOT NULL,
            lemma TEXT,
            language TEXT DEFAULT 'und',
            pronunciation TEXT,
            image_url TEXT,
            mnemonic_text TEXT,
            definitions TEXT,
            UNIQUE(word, lemma, language)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_type TEXT NOT NULL,
            title TEXT,
            author TEXT,
            website TEXT,
            url TEXT,
            meta TEXT,
            last_processed_sentence INTEGER DEFAULT -1,
            added_at TEXT DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(url, title, author)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sentences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            text TEXT NOT NULL UNIQUE,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS word_sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            word_id INTEGER NOT NULL REFERENCES words(id) ON DELETE CASCADE,
            source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            context_sentence_id INTEGER REFERENCES sentences(id) ON DELETE SET NULL,
            example_sentence_id INTEGER REFERENCES sentences(id) ON DELETE SET NULL,
            occurrence_count INTEGER DEFAULT 1,
            first_seen_at TEXT,
            is_primary INTEGER DEFAULT 0,
            UNIQUE(word_id, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS word_contexts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            word_source_id INTEGER NOT NULL REFERENCES word_sources(id) ON DELETE CASCADE,
            sentence_id INTEGER NOT NULL REFERENCES sentences(id) ON DELETE CASCADE,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(word_source_id, sentence_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_word_sources_source_id ON word_sources(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_word_sources_word_id ON word_sources(word_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_word_contexts_word_source_id ON word_contexts(word_source_id)",
    )
    .execute(pool)
    .await?;

    ensure_column(pool, "sources", "last_processed_sentence", "INTEGER DEFAULT -1").await?;

    Ok(())
}

/// Adds `column` to `table` when an older database predates it.
async fn ensure_column(pool: &SqlitePool, table: &str, column: &str, definition: &str) -> Result<()> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(pool)
        .await?;

    for row in &rows {
        let name: String = row.try_get("name")?;
        if name == column {
            return Ok(());
        }
    }

    sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition))
        .execute(pool)
        .await?;

    Ok(())
}

/// In-memory database for unit tests, schema applied.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true)
        .shared_cache(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .unwrap();
    init(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_creates_schema() {
        let pool = test_pool().await;

        let name: String =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' AND name='sentences'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(name, "sentences");

        let cols = column_names(&pool, "word_sources").await;
        assert!(cols.contains(&"context_sentence_id".to_string()));
        assert!(cols.contains(&"example_sentence_id".to_string()));

        let cols = column_names(&pool, "word_contexts").await;
        assert!(cols.contains(&"sentence_id".to_string()));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let pool = test_pool().await;
        init(&pool).await.unwrap();
        init(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_init_migrates_legacy_sources_table() {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();

        // A sources table from before checkpointing existed
        sqlx::query(
            r#"
            CREATE TABLE sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_type TEXT NOT NULL,
                title TEXT,
                author TEXT,
                website TEXT,
                url TEXT,
                meta TEXT,
                added_at TEXT DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(url, title, author)
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query("INSERT INTO sources (source_type, url) VALUES ('website_article', 'http://old')")
            .execute(&pool)
            .await
            .unwrap();

        init(&pool).await.unwrap();

        let progress: i64 = sqlx::query_scalar(
            "SELECT last_processed_sentence FROM sources WHERE url = 'http://old'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(progress, -1);
    }

    async fn column_names(pool: &SqlitePool, table: &str) -> Vec<String> {
        sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(pool)
            .await
            .unwrap()
            .iter()
            .map(|row| row.try_get::<String, _>("name").unwrap())
            .collect()
    }
}
