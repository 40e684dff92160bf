//! Deterministic keyword concept extraction.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

use super::types::ConceptLink;

/// Most concepts linked from a single memory
pub const MAX_CONCEPTS: usize = 8;

const MIN_TOKEN_LEN: usize = 4;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "about", "above", "after", "again", "against", "also", "because", "been", "before",
        "being", "below", "between", "both", "could", "does", "doing", "down", "during", "each",
        "even", "every", "from", "further", "have", "having", "here", "hers", "herself", "himself",
        "into", "itself", "just", "like", "more", "most", "much", "must", "myself", "only", "other",
        "ought", "ours", "ourselves", "over", "really", "same", "should", "some", "such", "than",
        "that", "their", "theirs", "them", "themselves", "then", "there", "these", "they", "this",
        "those", "through", "today", "under", "until", "very", "want", "were", "what", "when",
        "where", "which", "while", "with", "would", "your", "yours", "yourself", "will", "shall",
        "said", "says", "thing", "things", "make", "made", "know", "think", "well",
    ]
    .into_iter()
    .collect()
});

/// Lower-cased alphabetic tokens, in order of appearance
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphabetic())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Tokens worth indexing: long enough and not stop words
pub fn keywords(text: &str) -> Vec<String> {
    tokenize(text)
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN && !STOP_WORDS.contains(t.as_str()))
        .collect()
}

/// Extract up to `MAX_CONCEPTS` concepts, most frequent first.
/// Ties keep first-occurrence order.
pub fn extract_concepts(content: &str) -> Vec<ConceptLink> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, token) in keywords(content).into_iter().enumerate() {
        counts.entry(token).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(name, (count, first))| (name, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.truncate(MAX_CONCEPTS);

    let max_count = ranked.first().map(|(_, c, _)| *c).unwrap_or(1) as f32;
    ranked
        .into_iter()
        .map(|(name, count, _)| ConceptLink {
            name,
            strength: 0.3 + 0.7 * (count as f32 / max_count),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_ranked_concepts() {
        let concepts = extract_concepts(
            "Consciousness is fascinating. I keep returning to consciousness and memory.",
        );
        let names: Vec<&str> = concepts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names[0], "consciousness");
        assert!(names.contains(&"memory"));
        assert!(names.contains(&"fascinating"));
        // "keep" is four letters and kept; "is", "and" are too short
        assert!(!names.contains(&"and"));
        assert_eq!(concepts[0].strength, 1.0);
        assert!(concepts.iter().all(|c| (0.3..=1.0).contains(&c.strength)));
    }

    #[test]
    fn test_ties_keep_first_occurrence() {
        let names: Vec<String> = extract_concepts("zebra apple mango")
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["zebra", "apple", "mango"]);
    }

    #[test]
    fn test_caps_concept_count() {
        let text = "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo lima";
        assert_eq!(extract_concepts(text).len(), MAX_CONCEPTS);
    }

    #[test]
    fn test_empty_and_stop_words() {
        assert!(extract_concepts("").is_empty());
        assert!(extract_concepts("this that with from").is_empty());
    }
}
