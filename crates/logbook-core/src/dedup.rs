//! Content signatures and duplicate detection.
//!
//! Two intentionally separate policies:
//! - **Session dedup**: a content signature over the semantic fields of an
//!   entry (5-minute time bucket, duration, type, instrument, pieces)
//!   catches accidental double submissions of the same session.
//! - **Repertoire dedup**: fuzzy matching of title+composer against the
//!   user's existing pieces suggests likely duplicates when adding a new
//!   piece. Advisory only; the caller decides what to do with a match.

use crate::entry::LogEntry;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Width of the session-dedup time bucket, in seconds. Entries whose
/// practice time falls in the same bucket and share all content fields are
/// treated as the same logical submission.
const BUCKET_SECONDS: i64 = 300;

/// Default similarity threshold for repertoire matching.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.7;

/// Cached score metadata used by the repertoire matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composer: Option<String>,
}

// ============================================================================
// Session-level content signature
// ============================================================================

/// Compute the content signature for an entry.
///
/// The signature ignores volatile fields (exact timestamp, notes, mood,
/// tags, bookkeeping timestamps) so a retried or double-clicked submission
/// hashes the same as the original.
pub fn content_signature(entry: &LogEntry) -> String {
    let bucket = entry.timestamp.timestamp().div_euclid(BUCKET_SECONDS);

    let mut pieces: Vec<String> = entry
        .pieces
        .iter()
        .map(|p| {
            format!(
                "{}|{}",
                p.title.trim().to_lowercase(),
                p.composer.as_deref().unwrap_or("").trim().to_lowercase()
            )
        })
        .collect();
    pieces.sort();

    format!(
        "{}:{}:{}:{}:{}",
        bucket,
        entry.duration,
        entry.kind.as_str(),
        entry.instrument,
        pieces.join(";")
    )
}

/// Find an existing entry that is the same logical submission as
/// `candidate`. Tombstones and the candidate itself are skipped.
pub fn find_session_duplicate<'a, I>(candidate: &LogEntry, existing: I) -> Option<&'a LogEntry>
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let signature = content_signature(candidate);
    existing.into_iter().find(|e| {
        e.id != candidate.id && !e.is_deleted() && content_signature(e) == signature
    })
}

// ============================================================================
// Canonical score identifiers
// ============================================================================

/// Catalog-number patterns stripped from titles before comparison:
/// "Op. 27 No. 2", "BWV 846", "K. 545" / "KV 545", "Hob. XVI", "D 960",
/// "RV 269", "WoO 59".
static CATALOG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:op(?:us)?|no|nr|bwv|kv|k|hob|woo|rv|sz|d|s)\b\W*[0-9ivxlc]+[a-z]?\b")
        .unwrap()
});

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Canonical composer names with the variants users actually type.
/// Matching is token-based: every multi-letter token of the input must
/// appear in the canonical name, and every single-letter token must match
/// the initial of one of its words.
static KNOWN_COMPOSERS: &[&str] = &[
    "Johann Sebastian Bach",
    "Ludwig van Beethoven",
    "Wolfgang Amadeus Mozart",
    "Frederic Chopin",
    "Franz Schubert",
    "Franz Liszt",
    "Johannes Brahms",
    "Claude Debussy",
    "Maurice Ravel",
    "Pyotr Ilyich Tchaikovsky",
    "Sergei Rachmaninoff",
    "Antonio Vivaldi",
    "Joseph Haydn",
    "Robert Schumann",
    "Felix Mendelssohn",
    "Edvard Grieg",
    "Erik Satie",
    "Dmitri Shostakovich",
];

/// Lowercase, strip punctuation, collapse whitespace.
fn normalize_text(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    WHITESPACE_RE.replace_all(stripped.trim(), " ").to_string()
}

/// Canonical form of a piece title: case-folded, punctuation and catalog
/// numbers removed.
pub fn canonical_title(raw: &str) -> String {
    let without_catalog = CATALOG_RE.replace_all(raw, " ");
    normalize_text(&without_catalog)
}

/// Canonical form of a composer name.
///
/// Handles "Last, First" inversion, initials, and known name variants:
/// "W.A. Mozart" and "Mozart, Wolfgang Amadeus" both canonicalize to
/// "Wolfgang Amadeus Mozart".
pub fn canonical_composer(raw: &str) -> String {
    // "Mozart, Wolfgang Amadeus" -> "Wolfgang Amadeus Mozart"
    let reordered = match raw.split_once(',') {
        Some((last, first)) => format!("{} {}", first.trim(), last.trim()),
        None => raw.trim().to_string(),
    };

    let normalized = normalize_text(&reordered);
    if normalized.is_empty() {
        return String::new();
    }

    let tokens: Vec<&str> = normalized.split(' ').collect();
    for canonical in KNOWN_COMPOSERS {
        if composer_tokens_match(&tokens, canonical) {
            return (*canonical).to_string();
        }
    }

    title_case(&normalized)
}

fn composer_tokens_match(input_tokens: &[&str], canonical: &str) -> bool {
    let canonical_words: Vec<String> = canonical
        .split(' ')
        .map(|w| w.to_lowercase())
        .collect();

    // The surname must be present, otherwise initials alone would match.
    let surname = canonical_words.last().map(String::as_str).unwrap_or("");
    if !input_tokens.contains(&surname) {
        return false;
    }

    input_tokens.iter().all(|token| {
        if token.len() == 1 {
            canonical_words
                .iter()
                .any(|w| w.starts_with(*token))
        } else {
            canonical_words.iter().any(|w| w == token)
        }
    })
}

fn title_case(normalized: &str) -> String {
    normalized
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical score identifier combining title and composer, used as the
/// identity key for repertoire deduplication.
pub fn canonical_score_id(title: &str, composer: Option<&str>) -> String {
    let title = canonical_title(title);
    let composer = composer
        .map(canonical_composer)
        .unwrap_or_default()
        .to_lowercase();
    format!("{}::{}", title, composer)
}

// ============================================================================
// Fuzzy repertoire matching
// ============================================================================

/// Confidence tier for a fuzzy match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Confidence::High
        } else if score >= 0.8 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

/// A suggested duplicate piece. Derived transiently, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct PieceMatch {
    pub piece: ScoreInfo,
    pub confidence: Confidence,
    pub similarity: f64,
}

/// Character-level Levenshtein distance, single-row DP.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut previous_diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            let next = (previous_diagonal + cost)
                .min(row[j] + 1)
                .min(row[j + 1] + 1);
            previous_diagonal = row[j + 1];
            row[j + 1] = next;
        }
    }
    row[b.len()]
}

/// Normalized edit-distance similarity in [0, 1].
fn edit_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Jaccard overlap of whitespace tokens.
fn token_overlap(a: &str, b: &str) -> f64 {
    let ta: HashSet<&str> = a.split(' ').filter(|t| !t.is_empty()).collect();
    let tb: HashSet<&str> = b.split(' ').filter(|t| !t.is_empty()).collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union
}

/// Similarity of two canonical score identifiers. Edit distance catches
/// misspellings, token overlap catches reordered words; take whichever
/// scores the candidate higher.
fn score_similarity(a: &str, b: &str) -> f64 {
    edit_similarity(a, b).max(token_overlap(a, b))
}

/// Fuzzy matcher over the user's known pieces.
pub struct RepertoireMatcher {
    threshold: f64,
}

impl Default for RepertoireMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl RepertoireMatcher {
    pub fn with_threshold(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Rank repertoire pieces by similarity to the candidate, keeping
    /// matches at or above the threshold, best first.
    pub fn find_matches(
        &self,
        title: &str,
        composer: Option<&str>,
        repertoire: &[ScoreInfo],
    ) -> Vec<PieceMatch> {
        let candidate = canonical_score_id(title, composer);

        let mut matches: Vec<PieceMatch> = repertoire
            .iter()
            .filter_map(|piece| {
                let existing = canonical_score_id(&piece.title, piece.composer.as_deref());
                let similarity = score_similarity(&candidate, &existing);
                if similarity >= self.threshold {
                    Some(PieceMatch {
                        piece: piece.clone(),
                        confidence: Confidence::from_score(similarity),
                        similarity,
                    })
                } else {
                    None
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches
    }
}

/// Collect the distinct pieces referenced across entries, deduplicated by
/// canonical score identifier.
pub fn repertoire_from_entries(entries: &[LogEntry]) -> Vec<ScoreInfo> {
    let mut seen = HashSet::new();
    let mut repertoire = Vec::new();
    for entry in entries.iter().filter(|e| !e.is_deleted()) {
        for piece in &entry.pieces {
            if piece.title.trim().is_empty() {
                continue;
            }
            let key = canonical_score_id(&piece.title, piece.composer.as_deref());
            if seen.insert(key) {
                repertoire.push(ScoreInfo {
                    score_id: piece.score_id.clone(),
                    title: piece.title.clone(),
                    composer: piece.composer.clone(),
                });
            }
        }
    }
    repertoire
}
