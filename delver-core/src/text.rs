//! Small text helpers shared by the planner checks and the compressor.

/// Words carrying no topical content, ignored by overlap checks.
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "of", "in", "on", "at",
    "to", "for", "with", "by", "from", "about", "and", "or", "not", "what", "which", "who",
    "whom", "this", "that", "these", "those", "how", "why", "when", "where", "do", "does", "did",
    "can", "could", "should", "would", "will", "it", "its", "as", "between",
];

/// Lowercased alphanumeric tokens of a string.
pub fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tokens with stopwords and very short words removed.
pub fn content_tokens(text: &str) -> Vec<String> {
    tokens(text)
        .into_iter()
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Token-level Jaccard similarity of two strings.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<String> = tokens(a).into_iter().collect();
    let set_b: std::collections::HashSet<String> = tokens(b).into_iter().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// The first four tokens of a string, joined. This is the prefix the
/// planner's lexical-diversity rule compares.
pub fn four_gram_prefix(text: &str) -> String {
    tokens(text)
        .into_iter()
        .take(4)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Citation markers `[n]` appearing in a text, in order of appearance.
pub fn citation_markers(text: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b']' {
                if let Ok(id) = text[i + 1..j].parse() {
                    out.push(id);
                }
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    out
}

/// Truncate to at most `max_bytes`, respecting char boundaries.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> (&str, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    (&text[..cut], true)
}
