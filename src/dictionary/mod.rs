//! JMdict-simplified dictionary support
//!
//! Loads the jmdict-simplified JSON document, normalizes readings, and
//! formats matched entries into the JSON blob persisted alongside words.
//! Lookup lives in [`index`], definition backfill for already-persisted
//! words in [`backfill`].

mod backfill;
mod index;

pub use backfill::backfill_definitions;
pub use index::DictionaryIndex;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A jmdict-simplified dictionary entry.
///
/// Unknown JSON fields are ignored so newer dumps keep loading.
#[derive(Debug, Clone, Deserialize)]
pub struct JmdictEntry {
    pub id: String,
    #[serde(default)]
    pub kanji: Vec<JmdictForm>,
    #[serde(default)]
    pub kana: Vec<JmdictForm>,
    #[serde(default)]
    pub sense: Vec<JmdictSense>,
}

/// A written form of an entry (kanji or kana spelling).
#[derive(Debug, Clone, Deserialize)]
pub struct JmdictForm {
    pub text: String,
    #[serde(default)]
    pub common: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JmdictSense {
    #[serde(rename = "partOfSpeech", default)]
    pub part_of_speech: Vec<String>,
    #[serde(default)]
    pub gloss: Vec<JmdictGloss>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JmdictGloss {
    pub text: String,
    #[serde(default = "default_gloss_lang")]
    pub lang: String,
}

fn default_gloss_lang() -> String {
    "eng".to_string()
}

/// What gets persisted in the `definitions` column, one element per matched
/// entry: all glosses flattened into `senses`, all POS tags into `pos`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionEntry {
    pub senses: Vec<String>,
    pub pos: Vec<String>,
}

/// Errors from loading a dictionary file.
#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("failed to read dictionary file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse dictionary as object or array: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Loads a jmdict-simplified JSON file.
///
/// Accepts either the full document form `{ "words": [entry, ...] }` or a
/// bare `[entry, ...]` array. The wrapped form is tried first; an object
/// without (or with an empty) `words` list falls back to the array parse.
pub fn load_jmdict(path: &Path) -> Result<Vec<JmdictEntry>, DictionaryError> {
    let content = std::fs::read_to_string(path)?;

    #[derive(Deserialize)]
    struct Document {
        #[serde(default)]
        words: Vec<JmdictEntry>,
    }

    if let Ok(doc) = serde_json::from_str::<Document>(&content) {
        if !doc.words.is_empty() {
            return Ok(doc.words);
        }
    }

    serde_json::from_str::<Vec<JmdictEntry>>(&content).map_err(DictionaryError::Parse)
}

/// Converts katakana to hiragana.
///
/// Code points U+30A1..=U+30F6 shift down by 0x60; everything else, including
/// the prolonged sound mark ー, passes through unchanged.
pub fn to_hiragana(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\u{30A1}'..='\u{30F6}' => char::from_u32(c as u32 - 0x60).unwrap_or(c),
            _ => c,
        })
        .collect()
}

/// Formats matched entries into the JSON string stored in `definitions`.
///
/// Entry order is preserved; duplicate POS tags are kept as-is.
pub fn format_definitions(entries: &[&JmdictEntry]) -> serde_json::Result<String> {
    let defs: Vec<DefinitionEntry> = entries
        .iter()
        .map(|e| {
            let mut senses = Vec::new();
            let mut pos = Vec::new();
            for s in &e.sense {
                senses.extend(s.gloss.iter().map(|g| g.text.clone()));
                pos.extend(s.part_of_speech.iter().cloned());
            }
            DefinitionEntry { senses, pos }
        })
        .collect();

    serde_json::to_string(&defs)
}
