//! Topic normalization against a fixed, closed vocabulary.
//!
//! The label-extraction collaborator returns free text that may be
//! multilingual, quoted, padded with prose, or simply hallucinated.  The
//! normalizer never fails on such input: it maps whatever it can onto the
//! vocabulary's canonical spelling and drops the rest.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Spellings of "no tag" the label extractor is known to produce, already
/// lowercased.  Compared after trimming whitespace and quotes.
const NO_TOPIC_SENTINELS: &[&str] = &[
    "no tag",
    "no tags",
    "no topic",
    "no topics",
    "none",
    "n/a",
    "không có tag",
    "không có tags",
    "không có",
    "không tag",
    "khong co tag",
    "khong co",
];

/// Characters stripped from both ends of the raw label text and of each
/// candidate.
const QUOTE_CHARS: &[char] = &['"', '\'', '`', '“', '”', '‘', '’', '«', '»'];

/// Outcome of normalizing one raw label text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "topics", rename_all = "snake_case")]
pub enum TopicExtraction {
    /// The extractor reported no topics, returned nothing, or returned only
    /// labels outside the vocabulary.
    NoTopicsFound,
    /// Canonical vocabulary names, deduplicated, in first-seen order.
    Topics(Vec<String>),
}

impl TopicExtraction {
    pub fn topics(&self) -> &[String] {
        match self {
            Self::NoTopicsFound => &[],
            Self::Topics(topics) => topics,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics().is_empty()
    }
}

/// Ordered list of canonical topic names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicVocabulary {
    canonical: Vec<String>,
    /// Lowercased form of each entry in `canonical`, same order.
    folded: Vec<String>,
}

impl TopicVocabulary {
    /// Build a vocabulary, dropping blank and case-insensitively duplicate
    /// entries (the first spelling wins).
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut canonical = Vec::new();
        let mut folded = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            let key = fold(name);
            if folded.contains(&key) {
                continue;
            }
            canonical.push(name.to_string());
            folded.push(key);
        }
        Self { canonical, folded }
    }

    /// Canonical spelling of `candidate`, matched case-insensitively.
    pub fn canonical(&self, candidate: &str) -> Option<&str> {
        let key = fold(candidate);
        self.folded
            .iter()
            .position(|entry| *entry == key)
            .map(|idx| self.canonical[idx].as_str())
    }

    pub fn names(&self) -> &[String] {
        &self.canonical
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TopicNormalizer {
    vocabulary: TopicVocabulary,
}

impl TopicNormalizer {
    pub fn new(vocabulary: TopicVocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &TopicVocabulary {
        &self.vocabulary
    }

    pub fn normalize(&self, raw: &str) -> TopicExtraction {
        let trimmed = trim_label(raw);
        if trimmed.is_empty() || is_no_topic_sentinel(trimmed) {
            return TopicExtraction::NoTopicsFound;
        }

        let mut seen = HashSet::new();
        let mut topics = Vec::new();
        for candidate in trimmed.split(',') {
            let candidate = trim_label(candidate);
            if candidate.is_empty() {
                continue;
            }
            if let Some(name) = self.vocabulary.canonical(candidate) {
                if seen.insert(name) {
                    topics.push(name.to_string());
                }
            }
        }

        if topics.is_empty() {
            TopicExtraction::NoTopicsFound
        } else {
            TopicExtraction::Topics(topics)
        }
    }
}

fn trim_label(s: &str) -> &str {
    s.trim_matches(|c: char| c.is_whitespace() || QUOTE_CHARS.contains(&c))
}

fn fold(s: &str) -> String {
    s.trim().to_lowercase()
}

fn is_no_topic_sentinel(trimmed: &str) -> bool {
    let folded = fold(trimmed.trim_end_matches('.'));
    NO_TOPIC_SENTINELS.contains(&folded.as_str())
}
