//! Definition backfill for already-persisted words
//!
//! Words ingested before a dictionary was available (or with a newer
//! dictionary than the one used at ingest time) can be re-enriched in place.

use sqlx::{Row, SqliteConnection};
use tracing::warn;

use super::{format_definitions, DictionaryIndex};
use crate::store::{update_word_definitions, StoreError};

/// Fills in definitions for words that have none, returning how many rows
/// were updated.
///
/// Rows that already carry definitions are left alone. Formatting failures
/// are logged and skipped; they never abort the pass.
pub async fn backfill_definitions(
    conn: &mut SqliteConnection,
    index: &DictionaryIndex,
) -> Result<u64, StoreError> {
    let rows = sqlx::query("SELECT id, word, lemma, pronunciation, definitions FROM words")
        .fetch_all(&mut *conn)
        .await?;

    let mut updates: Vec<(i64, String)> = Vec::new();
    for row in rows {
        let id: i64 = row.try_get(0)?;
        let word: String = row.try_get(1)?;
        let lemma: String = row.try_get::<Option<String>, _>(2)?.unwrap_or_default();
        let pronunciation: String = row.try_get::<Option<String>, _>(3)?.unwrap_or_default();
        let definitions: String = row.try_get::<Option<String>, _>(4)?.unwrap_or_default();

        if !definitions.is_empty() {
            continue;
        }

        let matches = index.lookup(&word, &lemma, &pronunciation);
        if matches.is_empty() {
            continue;
        }

        match format_definitions(&matches) {
            Ok(json) => updates.push((id, json)),
            Err(e) => warn!(word = %word, error = %e, "failed to format definitions, skipping"),
        }
    }

    let mut updated = 0u64;
    for (id, json) in updates {
        match update_word_definitions(&mut *conn, id, &json).await {
            Ok(()) => updated += 1,
            Err(e) => warn!(word_id = id, error = %e, "failed to update definitions"),
        }
    }

    Ok(updated)
}
