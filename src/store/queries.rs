//! Store query surface
//!
//! Idempotent upserts and checkpoint I/O. All functions take
//! `&mut SqliteConnection` so callers can pass either a pooled connection or
//! an open transaction.

use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use thiserror::Error;

/// Distinct context sentences retained per (word, source) pair.
const MAX_CONTEXTS_PER_LINK: i64 = 5;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unique-constraint conflict not resolved after {0} attempts")]
    RetryExhausted(u32),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A canonical word row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    pub id: i64,
    pub word: String,
    pub lemma: String,
    pub language: String,
    pub pronunciation: String,
    pub image_url: String,
    pub mnemonic_text: String,
    pub definitions: String,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Returns the existing word id or inserts a new word and returns its id.
///
/// On conflict of `(word, lemma, language)` the pronunciation and definitions
/// are only overwritten by non-empty incoming values.
pub async fn upsert_word(
    conn: &mut SqliteConnection,
    word: &str,
    lemma: &str,
    reading: &str,
    definitions: &str,
    language: &str,
) -> Result<i64, StoreError> {
    let word = word.trim();
    if word.is_empty() {
        return Err(StoreError::InvalidInput("word must be non-empty".to_string()));
    }

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO words (word, lemma, pronunciation, definitions, language)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(word, lemma, language) DO UPDATE SET
            pronunciation = COALESCE(NULLIF(excluded.pronunciation, ''), words.pronunciation),
            definitions = COALESCE(NULLIF(excluded.definitions, ''), words.definitions)
        RETURNING id
        "#,
    )
    .bind(word)
    .bind(lemma)
    .bind(reading)
    .bind(definitions)
    .bind(language)
    .fetch_one(conn)
    .await?;

    Ok(id)
}

/// Returns the existing source id or inserts a new source and returns its id.
///
/// Sources are identified by `(url, title, author)` with NULL treated as the
/// empty string. A concurrent insert of the same source loses the unique race
/// and retries the select, up to 3 attempts.
pub async fn upsert_source(
    conn: &mut SqliteConnection,
    source_type: &str,
    title: &str,
    author: &str,
    website: &str,
    url: &str,
    meta: &str,
) -> Result<i64, StoreError> {
    let source_type = source_type.trim();
    if source_type.is_empty() {
        return Err(StoreError::InvalidInput(
            "source_type must be non-empty".to_string(),
        ));
    }

    const MAX_RETRIES: u32 = 3;

    for _ in 0..MAX_RETRIES {
        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM sources
            WHERE IFNULL(url, '') = ? AND IFNULL(title, '') = ? AND IFNULL(author, '') = ?
            "#,
        )
        .bind(url)
        .bind(title)
        .bind(author)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(id) = existing {
            return Ok(id);
        }

        let inserted = sqlx::query(
            "INSERT INTO sources (source_type, title, author, website, url, meta) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(source_type)
        .bind(title)
        .bind(author)
        .bind(website)
        .bind(url)
        .bind(meta)
        .execute(&mut *conn)
        .await;

        match inserted {
            Ok(result) => return Ok(result.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(StoreError::RetryExhausted(MAX_RETRIES))
}

/// Stores each distinct sentence text exactly once and returns its id.
///
/// Text that is empty after trimming is not interned; `None` marks
/// "no sentence" and becomes NULL wherever it is referenced.
pub async fn intern_sentence(
    conn: &mut SqliteConnection,
    text: &str,
) -> Result<Option<i64>, StoreError> {
    if text.trim().is_empty() {
        return Ok(None);
    }

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO sentences (text) VALUES (?)
        ON CONFLICT(text) DO UPDATE SET text = excluded.text
        RETURNING id
        "#,
    )
    .bind(text)
    .fetch_one(conn)
    .await?;

    Ok(Some(id))
}

/// Links a word to a source, creating or updating the `word_sources` row.
///
/// `occurrence_count` starts at `increment` and is bumped by `increment` on
/// conflict; the context and example sentence references are overwritten.
/// At most 5 distinct context sentences are retained per pair; duplicates
/// and overflow are absorbed silently. Returns the link row id.
pub async fn link_word_to_source(
    conn: &mut SqliteConnection,
    word_id: i64,
    source_id: i64,
    context: &str,
    example: &str,
    increment: u32,
) -> Result<i64, StoreError> {
    if word_id <= 0 {
        return Err(StoreError::InvalidInput("word id must be positive".to_string()));
    }
    if source_id <= 0 {
        return Err(StoreError::InvalidInput(
            "source id must be positive".to_string(),
        ));
    }
    if increment == 0 {
        return Err(StoreError::InvalidInput(
            "increment must be at least 1".to_string(),
        ));
    }

    let context_id = intern_sentence(&mut *conn, context).await?;
    let example_id = intern_sentence(&mut *conn, example).await?;

    let word_source_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO word_sources
            (word_id, source_id, context_sentence_id, example_sentence_id, occurrence_count, first_seen_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(word_id, source_id) DO UPDATE SET
            occurrence_count = word_sources.occurrence_count + excluded.occurrence_count,
            context_sentence_id = excluded.context_sentence_id,
            example_sentence_id = excluded.example_sentence_id
        RETURNING id
        "#,
    )
    .bind(word_id)
    .bind(source_id)
    .bind(context_id)
    .bind(example_id)
    .bind(increment as i64)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;

    // Capped context set: the guarded INSERT ... SELECT keeps concurrent
    // ingesters from both slipping past the count check.
    if let Some(sentence_id) = context_id {
        sqlx::query(
            r#"
            INSERT INTO word_contexts (word_source_id, sentence_id)
            SELECT ?, ?
            WHERE (SELECT COUNT(*) FROM word_contexts WHERE word_source_id = ?) < ?
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(word_source_id)
        .bind(sentence_id)
        .bind(word_source_id)
        .bind(MAX_CONTEXTS_PER_LINK)
        .execute(conn)
        .await?;
    }

    Ok(word_source_id)
}

/// Replaces the definitions JSON for a word.
pub async fn update_word_definitions(
    conn: &mut SqliteConnection,
    word_id: i64,
    definitions: &str,
) -> Result<(), StoreError> {
    if word_id <= 0 {
        return Err(StoreError::InvalidInput("word id must be positive".to_string()));
    }
    sqlx::query("UPDATE words SET definitions = ? WHERE id = ?")
        .bind(definitions)
        .bind(word_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Returns all words linked to the given source, NULL columns coalesced to
/// empty strings.
pub async fn get_words_by_source(
    conn: &mut SqliteConnection,
    source_id: i64,
) -> Result<Vec<Word>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT w.id, w.word, w.lemma, w.language, w.pronunciation,
               w.image_url, w.mnemonic_text, w.definitions
        FROM words w
        JOIN word_sources ws ON ws.word_id = w.id
        WHERE ws.source_id = ?
        "#,
    )
    .bind(source_id)
    .fetch_all(conn)
    .await?;

    let mut words = Vec::with_capacity(rows.len());
    for row in rows {
        words.push(Word {
            id: row.try_get(0)?,
            word: row.try_get(1)?,
            lemma: row.try_get::<Option<String>, _>(2)?.unwrap_or_default(),
            language: row.try_get::<Option<String>, _>(3)?.unwrap_or_default(),
            pronunciation: row.try_get::<Option<String>, _>(4)?.unwrap_or_default(),
            image_url: row.try_get::<Option<String>, _>(5)?.unwrap_or_default(),
            mnemonic_text: row.try_get::<Option<String>, _>(6)?.unwrap_or_default(),
            definitions: row.try_get::<Option<String>, _>(7)?.unwrap_or_default(),
        });
    }
    Ok(words)
}

/// Reads the last processed sentence index for a source.
pub async fn get_source_progress(
    conn: &mut SqliteConnection,
    source_id: i64,
) -> Result<i64, StoreError> {
    let index: i64 = sqlx::query_scalar("SELECT last_processed_sentence FROM sources WHERE id = ?")
        .bind(source_id)
        .fetch_one(conn)
        .await?;
    Ok(index)
}

/// Writes the last processed sentence index for a source.
pub async fn update_source_progress(
    conn: &mut SqliteConnection,
    source_id: i64,
    index: i64,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE sources SET last_processed_sentence = ? WHERE id = ?")
        .bind(index)
        .bind(source_id)
        .execute(conn)
        .await?;
    Ok(())
}
