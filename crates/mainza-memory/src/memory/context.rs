//! Bounded, formatted context block for prompting.
//!
//! Memories are laid out in rank order, one line each:
//!
//! ```text
//! Relevant memories:
//! - [reflection | curious | 0.90] I love discussing consciousness
//! ```
//!
//! The block never exceeds `max_length` characters. Lower-ranked memories
//! are dropped first. The first memory that does not fit whole is cut at a
//! sentence boundary and ends the block. Only the top memory may fall back to
//! a word cut.

use super::types::MemoryRecord;

const HEADER: &str = "Relevant memories:";

pub struct ContextBuilder {
    max_length: usize,
}

impl ContextBuilder {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn build(&self, memories: &[MemoryRecord]) -> String {
        build_context(memories, self.max_length)
    }
}

fn line_prefix(record: &MemoryRecord) -> String {
    format!(
        "- [{} | {} | {:.2}] ",
        record.memory_type, record.emotional_state, record.importance_score
    )
}

/// Content flattened to one line
fn flatten(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Char offsets just past each sentence terminator
fn sentence_ends(text: &str) -> Vec<usize> {
    let chars: Vec<char> = text.chars().collect();
    let mut ends = Vec::new();
    for (i, c) in chars.iter().enumerate() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.get(i + 1).map(|n| n.is_whitespace()).unwrap_or(true);
            if at_boundary {
                ends.push(i + 1);
            }
        }
    }
    ends
}

/// Char offsets at the end of each word
fn word_ends(text: &str) -> Vec<usize> {
    let chars: Vec<char> = text.chars().collect();
    let mut ends = Vec::new();
    for (i, c) in chars.iter().enumerate() {
        let next_is_space = chars.get(i + 1).map(|n| n.is_whitespace()).unwrap_or(true);
        if !c.is_whitespace() && next_is_space {
            ends.push(i + 1);
        }
    }
    ends
}

fn take_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

/// Render `memories` (already ranked) into at most `max_length` characters
pub fn build_context(memories: &[MemoryRecord], max_length: usize) -> String {
    let mut out = String::new();
    let mut used = 0usize;
    let header_len = HEADER.chars().count();
    if memories.is_empty() || max_length <= header_len {
        return out;
    }

    for (rank, record) in memories.iter().enumerate() {
        let prefix = line_prefix(record);
        let content = flatten(&record.content);
        // newline + prefix
        let overhead = 1 + prefix.chars().count();
        let start = if rank == 0 { header_len } else { used };
        let budget = max_length.saturating_sub(start + overhead);

        let fits = content.chars().count() <= budget;
        let body = if fits {
            content
        } else {
            let sentence = sentence_ends(&content)
                .into_iter()
                .filter(|end| *end <= budget)
                .max();
            match sentence {
                Some(end) => take_chars(&content, end),
                None if rank == 0 => match word_ends(&content)
                    .into_iter()
                    .filter(|end| *end <= budget)
                    .max()
                {
                    Some(end) => take_chars(&content, end),
                    None => return String::new(),
                },
                None => break,
            }
        };

        if rank == 0 {
            out.push_str(HEADER);
            used = header_len;
        }
        let line = format!("\n{}{}", prefix, body);
        used += line.chars().count();
        out.push_str(&line);

        // Nothing follows a truncated memory
        if !fits || used >= max_length {
            break;
        }
    }
    out
}
