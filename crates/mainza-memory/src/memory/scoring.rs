//! ============================================================================
//! Scoring Engine - Importance, significance, decay and alignment
//! ============================================================================
//! All scores are clamped to [MIN_SCORE, 1.0]; nothing computed here is
//! ever zero, NaN or above one.
//! ============================================================================

use once_cell::sync::Lazy;
use std::collections::HashSet;

use super::concepts::tokenize;
use super::types::MemoryType;
use crate::consciousness::ConsciousnessContext;

/// Lowest score any computation returns
pub const MIN_SCORE: f32 = 0.05;

/// Importance assigned to empty or whitespace-only content
pub const EMPTY_CONTENT_IMPORTANCE: f32 = 0.3;

const BASE_IMPORTANCE: f32 = 0.5;
const LENGTH_WEIGHT: f32 = 0.1;
const LENGTH_SATURATION: usize = 500;
const SALIENT_WEIGHT: f32 = 0.05;
const MAX_SALIENT: usize = 3;
const LEVEL_WEIGHT: f32 = 0.15;
const REFLECTIVE_WEIGHT: f32 = 0.1;
const CONCEPT_BONUS: f32 = 0.05;
const MAX_CONCEPT_BONUS: usize = 4;

static SALIENT_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "love", "hate", "amazing", "excited", "exciting", "afraid", "fear", "happy", "sad",
        "angry", "important", "remember", "wonderful", "terrible", "grateful", "worried",
        "fascinating", "beautiful", "breakthrough", "passionate", "frustrated", "proud",
    ]
    .into_iter()
    .collect()
});

static REFLECTIVE_MARKERS: &[&str] = &[
    "i think",
    "i feel",
    "i believe",
    "i realize",
    "i wonder",
    "i learned",
    "my understanding",
    "myself",
    "self-aware",
    "conscious",
    "reflect",
];

pub fn clamp_score(value: f32) -> f32 {
    if value.is_nan() {
        return MIN_SCORE;
    }
    value.clamp(MIN_SCORE, 1.0)
}

fn type_bonus(memory_type: MemoryType) -> f32 {
    match memory_type {
        MemoryType::Reflection => 0.10,
        MemoryType::Insight => 0.15,
        MemoryType::Consolidated => 0.05,
        MemoryType::Interaction | MemoryType::ConceptLink => 0.0,
    }
}

/// Distinct emotionally salient keywords in `content`
pub fn salient_keyword_count(content: &str) -> usize {
    tokenize(content)
        .filter(|t| SALIENT_KEYWORDS.contains(t.as_str()))
        .collect::<HashSet<_>>()
        .len()
}

pub fn is_self_reflective(content: &str) -> bool {
    let lower = content.to_lowercase();
    REFLECTIVE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Importance at creation time
pub fn importance(content: &str, memory_type: MemoryType, context: &ConsciousnessContext) -> f32 {
    if content.trim().is_empty() {
        return EMPTY_CONTENT_IMPORTANCE;
    }

    let level = if context.level.is_finite() {
        context.level.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let chars = content.chars().count().min(LENGTH_SATURATION);

    let mut score = BASE_IMPORTANCE;
    score += LENGTH_WEIGHT * chars as f32 / LENGTH_SATURATION as f32;
    score += SALIENT_WEIGHT * salient_keyword_count(content).min(MAX_SALIENT) as f32;
    score += LEVEL_WEIGHT * level;
    if is_self_reflective(content) {
        score += REFLECTIVE_WEIGHT * level;
    }
    score += type_bonus(memory_type);
    score += context.emotional_state.salience();

    clamp_score(score)
}

/// Significance at creation time
pub fn initial_significance(importance: f32, concept_count: usize) -> f32 {
    clamp_score(importance + CONCEPT_BONUS * concept_count.min(MAX_CONCEPT_BONUS) as f32)
}

/// Significance recomputed by the lifecycle manager
pub fn recompute_significance(importance: f32, access_count: u64, concept_count: usize) -> f32 {
    let access_term = 1.0 - (-(access_count as f64) / 5.0).exp();
    let concept_term = concept_count.min(5) as f64 / 5.0;
    clamp_score((0.5 * importance as f64 + 0.3 * access_term + 0.2 * concept_term) as f32)
}

/// `0.5^(hours / half_life)`: 1.0 at age zero, 0.5 at one half-life
pub fn decay_factor(hours: f64, half_life_hours: f64) -> f64 {
    if hours <= 0.0 || !hours.is_finite() {
        return 1.0;
    }
    if half_life_hours <= 0.0 {
        return 0.0;
    }
    0.5f64.powf(hours / half_life_hours)
}

/// How closely a record's creation level matches the current level
pub fn consciousness_alignment(record_level: f32, current_level: f32) -> f32 {
    (1.0 - (record_level - current_level).abs()).clamp(0.0, 1.0)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
