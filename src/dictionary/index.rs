//! In-memory dictionary index
//!
//! Maps every written form (kanji and kana) to its entries for exact-match
//! lookup. Built once, immutable afterwards; share it across tasks with an
//! `Arc` — no locking needed.

use std::collections::{HashMap, HashSet};

use super::{to_hiragana, JmdictEntry};

/// Exact-match index over dictionary entries.
pub struct DictionaryIndex {
    /// Entry arena; `terms` holds offsets into it
    entries: Vec<JmdictEntry>,
    /// Written form → indices of entries carrying that form, in entry order
    terms: HashMap<String, Vec<usize>>,
}

impl DictionaryIndex {
    /// Builds the index. Bucket order follows entry iteration order.
    pub fn build(entries: Vec<JmdictEntry>) -> Self {
        let mut terms: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            for form in entry.kanji.iter().chain(entry.kana.iter()) {
                terms.entry(form.text.clone()).or_default().push(i);
            }
        }
        Self { entries, terms }
    }

    /// Number of entries in the index.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds entries matching a word, its lemma, and optionally a reading.
    ///
    /// Candidates are collected from the `word` and `lemma` buckets (empty
    /// terms are skipped) and deduplicated by entry id. A candidate survives
    /// when one of its written forms equals `word` or `lemma`, and — if
    /// `pronunciation` is non-empty — one of its kana forms matches the
    /// pronunciation after katakana→hiragana normalization. Results are
    /// sorted ascending by entry id so lookups are deterministic.
    pub fn lookup(&self, word: &str, lemma: &str, pronunciation: &str) -> Vec<&JmdictEntry> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut results: Vec<&JmdictEntry> = Vec::new();

        for term in [word, lemma] {
            if term.is_empty() {
                continue;
            }
            let Some(indices) = self.terms.get(term) else {
                continue;
            };
            for &i in indices {
                let entry = &self.entries[i];
                if seen.insert(entry.id.as_str()) && is_match(entry, word, lemma, pronunciation) {
                    results.push(entry);
                }
            }
        }

        results.sort_by(|a, b| a.id.cmp(&b.id));
        results
    }
}

/// Verifies a candidate entry against the looked-up forms and reading.
fn is_match(entry: &JmdictEntry, word: &str, lemma: &str, pronunciation: &str) -> bool {
    let has_text = entry
        .kanji
        .iter()
        .chain(entry.kana.iter())
        .any(|form| form.text == word || form.text == lemma);
    if !has_text {
        return false;
    }

    if pronunciation.is_empty() {
        return true;
    }

    let normalized = to_hiragana(pronunciation);
    entry
        .kana
        .iter()
        .any(|form| to_hiragana(&form.text) == normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::{JmdictForm, JmdictGloss, JmdictSense};

    fn entry(id: &str, kanji: &[&str], kana: &[(&str, bool)], glosses: &[&str]) -> JmdictEntry {
        JmdictEntry {
            id: id.to_string(),
            kanji: kanji
                .iter()
                .map(|text| JmdictForm {
                    text: text.to_string(),
                    common: true,
                    tags: vec![],
                })
                .collect(),
            kana: kana
                .iter()
                .map(|(text, common)| JmdictForm {
                    text: text.to_string(),
                    common: *common,
                    tags: vec![],
                })
                .collect(),
            sense: vec![JmdictSense {
                part_of_speech: vec!["n".to_string()],
                gloss: glosses
                    .iter()
                    .map(|text| JmdictGloss {
                        text: text.to_string(),
                        lang: "eng".to_string(),
                    })
                    .collect(),
            }],
        }
    }

    fn sample_index() -> DictionaryIndex {
        DictionaryIndex::build(vec![
            entry("3", &["猫"], &[("ねこ", true)], &["cat"]),
            entry("1", &["犬"], &[("いぬ", true)], &["dog"]),
            entry("2", &["走る"], &[("はしる", true)], &["to run"]),
            entry("4", &[], &[("テスト", true)], &["test"]),
        ])
    }

    #[test]
    fn test_lookup_by_kanji_and_kana() {
        let index = sample_index();
        assert_eq!(index.len(), 4);

        let matches = index.lookup("犬", "犬", "");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "1");

        let matches = index.lookup("いぬ", "", "");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "1");
    }

    #[test]
    fn test_lookup_missing_term() {
        let index = sample_index();
        assert!(index.lookup("未知", "未知", "").is_empty());
        assert!(index.lookup("", "", "").is_empty());
    }

    #[test]
    fn test_lookup_verifies_reading() {
        let index = sample_index();

        // Katakana pronunciation normalizes before comparison
        let matches = index.lookup("犬", "犬", "イヌ");
        assert_eq!(matches.len(), 1);

        assert!(index.lookup("犬", "犬", "ねこ").is_empty());
    }

    #[test]
    fn test_lookup_katakana_headword() {
        let index = sample_index();
        let matches = index.lookup("テスト", "テスト", "テスト");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "4");
    }

    #[test]
    fn test_lookup_results_sorted_and_deduplicated() {
        // Two spellings of the same entry plus an unrelated entry sharing a
        // reading; word and lemma both hit the same buckets.
        let index = DictionaryIndex::build(vec![
            entry("9", &["書く"], &[("かく", true)], &["to write"]),
            entry("5", &["描く", "書く"], &[("かく", false)], &["to draw"]),
        ]);

        let matches = index.lookup("書く", "書く", "");
        let ids: Vec<&str> = matches.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["5", "9"]);
    }
}
