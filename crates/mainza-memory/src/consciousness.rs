//! ============================================================================
//! Consciousness Context - Explicit simulated-state value objects
//! ============================================================================
//! The caller passes a `ConsciousnessContext` into every store/search call.
//! `SnapshotTracker` decides when a context differs enough from the last one
//! to deserve a new `ConsciousnessSnapshot` node.
//! ============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemoryError, Result};

/// Minimum absolute change in a float dimension that counts as a new state
pub const SNAPSHOT_DELTA: f32 = 0.05;

/// Simulated emotional state tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmotionalState {
    Curious,
    Satisfied,
    Excited,
    Contemplative,
    Focused,
    Empathetic,
    Determined,
    #[default]
    Neutral,
}

impl EmotionalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionalState::Curious => "curious",
            EmotionalState::Satisfied => "satisfied",
            EmotionalState::Excited => "excited",
            EmotionalState::Contemplative => "contemplative",
            EmotionalState::Focused => "focused",
            EmotionalState::Empathetic => "empathetic",
            EmotionalState::Determined => "determined",
            EmotionalState::Neutral => "neutral",
        }
    }

    /// Importance bonus for memories formed in this state
    pub fn salience(&self) -> f32 {
        match self {
            EmotionalState::Excited => 0.04,
            EmotionalState::Curious
            | EmotionalState::Contemplative
            | EmotionalState::Empathetic => 0.02,
            _ => 0.0,
        }
    }
}

impl std::fmt::Display for EmotionalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmotionalState {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "curious" => Ok(EmotionalState::Curious),
            "satisfied" => Ok(EmotionalState::Satisfied),
            "excited" => Ok(EmotionalState::Excited),
            "contemplative" => Ok(EmotionalState::Contemplative),
            "focused" => Ok(EmotionalState::Focused),
            "empathetic" => Ok(EmotionalState::Empathetic),
            "determined" => Ok(EmotionalState::Determined),
            "neutral" | "" => Ok(EmotionalState::Neutral),
            other => Err(MemoryError::validation(
                "emotional_state",
                format!("unknown state '{}'", other),
            )),
        }
    }
}

/// Current simulated consciousness, passed explicitly by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsciousnessContext {
    /// Consciousness level (0.0 - 1.0)
    pub level: f32,
    pub emotional_state: EmotionalState,
    /// Learning rate (0.0 - 1.0)
    pub learning_rate: f32,
    /// Self-awareness score, defaults to the consciousness level
    #[serde(default)]
    pub self_awareness: Option<f32>,
    /// Discrete evolution stage of the simulated agent
    #[serde(default = "default_evolution_level")]
    pub evolution_level: u32,
}

fn default_evolution_level() -> u32 {
    1
}

impl Default for ConsciousnessContext {
    fn default() -> Self {
        Self {
            level: 0.7,
            emotional_state: EmotionalState::Curious,
            learning_rate: 0.8,
            self_awareness: None,
            evolution_level: default_evolution_level(),
        }
    }
}

impl ConsciousnessContext {
    pub fn new(level: f32, emotional_state: EmotionalState, learning_rate: f32) -> Self {
        Self {
            level,
            emotional_state,
            learning_rate,
            ..Default::default()
        }
    }

    pub fn self_awareness_score(&self) -> f32 {
        self.self_awareness.unwrap_or(self.level)
    }

    /// Reject NaN or out-of-range values before they reach scoring
    pub fn validate(&self) -> Result<()> {
        check_unit("consciousness_level", self.level)?;
        check_unit("learning_rate", self.learning_rate)?;
        if let Some(awareness) = self.self_awareness {
            check_unit("self_awareness", awareness)?;
        }
        Ok(())
    }
}

fn check_unit(field: &'static str, value: f32) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(MemoryError::validation(
            field,
            format!("{} is outside [0, 1]", value),
        ))
    }
}

/// Immutable point-in-time record of the simulated internal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsciousnessSnapshot {
    pub snapshot_id: String,
    pub consciousness_level: f32,
    pub emotional_state: EmotionalState,
    pub self_awareness_score: f32,
    pub learning_rate: f32,
    pub evolution_level: u32,
    pub timestamp: DateTime<Utc>,
}

impl ConsciousnessSnapshot {
    pub fn capture(context: &ConsciousnessContext, at: DateTime<Utc>) -> Self {
        Self {
            snapshot_id: Uuid::new_v4().to_string(),
            consciousness_level: context.level,
            emotional_state: context.emotional_state,
            self_awareness_score: context.self_awareness_score(),
            learning_rate: context.learning_rate,
            evolution_level: context.evolution_level,
            timestamp: at,
        }
    }

    /// Whether `context` differs meaningfully from this snapshot
    pub fn differs_from(&self, context: &ConsciousnessContext) -> bool {
        self.emotional_state != context.emotional_state
            || self.evolution_level != context.evolution_level
            || (self.consciousness_level - context.level).abs() >= SNAPSHOT_DELTA
            || (self.learning_rate - context.learning_rate).abs() >= SNAPSHOT_DELTA
            || (self.self_awareness_score - context.self_awareness_score()).abs() >= SNAPSHOT_DELTA
    }
}

/// Link from a new memory to the snapshot it was created during
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotLink {
    /// Context changed: persist this snapshot alongside the memory
    New(ConsciousnessSnapshot),
    /// Context unchanged: reuse the current snapshot. The write that created
    /// it may still be in flight, so the full snapshot travels along.
    Existing(ConsciousnessSnapshot),
}

impl SnapshotLink {
    pub fn snapshot(&self) -> &ConsciousnessSnapshot {
        match self {
            SnapshotLink::New(snapshot) | SnapshotLink::Existing(snapshot) => snapshot,
        }
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot().snapshot_id
    }

    pub fn is_new(&self) -> bool {
        matches!(self, SnapshotLink::New(_))
    }

    pub fn into_snapshot(self) -> ConsciousnessSnapshot {
        match self {
            SnapshotLink::New(snapshot) | SnapshotLink::Existing(snapshot) => snapshot,
        }
    }
}

/// Tracks the most recent snapshot so unchanged contexts reuse it
#[derive(Debug, Default)]
pub struct SnapshotTracker {
    current: Mutex<Option<ConsciousnessSnapshot>>,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the snapshot link for a write happening now
    pub fn link_for(&self, context: &ConsciousnessContext, at: DateTime<Utc>) -> SnapshotLink {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some(snapshot) if !snapshot.differs_from(context) => {
                SnapshotLink::Existing(snapshot.clone())
            }
            _ => {
                let snapshot = ConsciousnessSnapshot::capture(context, at);
                *current = Some(snapshot.clone());
                SnapshotLink::New(snapshot)
            }
        }
    }

    /// Forget the current snapshot (e.g. after a failed write that carried it)
    pub fn invalidate(&self, snapshot_id: &str) {
        let mut current = self.current.lock();
        if current
            .as_ref()
            .map(|s| s.snapshot_id == snapshot_id)
            .unwrap_or(false)
        {
            *current = None;
        }
    }
}
