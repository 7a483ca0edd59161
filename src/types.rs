//! Core input types for the ingestion pipeline

use serde::{Deserialize, Serialize};

/// A single analyzed unit of text, as produced by a morphological analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// The text as it appears (e.g. "行っ")
    pub surface: String,
    /// The dictionary form (e.g. "行く"); `"*"` means none
    pub base_form: String,
    /// The pronunciation in katakana (e.g. "イッ")
    pub reading: String,
    /// Full hierarchical part-of-speech labels (e.g. ["動詞", "自立", "*", "*"])
    pub parts_of_speech: Vec<String>,
    /// The first (primary) part of speech, if available
    pub primary_pos: String,
}

impl Token {
    pub fn new(
        surface: impl Into<String>,
        base_form: impl Into<String>,
        reading: impl Into<String>,
        primary_pos: impl Into<String>,
    ) -> Self {
        let primary_pos = primary_pos.into();
        Self {
            surface: surface.into(),
            base_form: base_form.into(),
            reading: reading.into(),
            parts_of_speech: vec![primary_pos.clone()],
            primary_pos,
        }
    }

    pub fn with_parts_of_speech(mut self, parts_of_speech: Vec<String>) -> Self {
        self.parts_of_speech = parts_of_speech;
        self
    }
}

/// A sentence together with its analyzed tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sentence {
    pub text: String,
    pub tokens: Vec<Token>,
}

impl Sentence {
    pub fn new(text: impl Into<String>, tokens: Vec<Token>) -> Self {
        Self {
            text: text.into(),
            tokens,
        }
    }
}
