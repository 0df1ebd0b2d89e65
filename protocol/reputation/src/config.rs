use crate::grade::{GradeThresholds, SlashSeverity};
use serde::{Deserialize, Serialize};

/// Flat deduction per slash tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlashTiers {
    pub minor: f64,
    pub major: f64,
    pub critical: f64,
}

impl Default for SlashTiers {
    fn default() -> Self {
        Self {
            minor: 50.0,
            major: 200.0,
            critical: 500.0,
        }
    }
}

impl SlashTiers {
    pub fn deduction(&self, severity: SlashSeverity) -> f64 {
        match severity {
            SlashSeverity::Minor => self.minor,
            SlashSeverity::Major => self.major,
            SlashSeverity::Critical => self.critical,
        }
    }
}

/// Timestamps are unix seconds, the same clock as ledger records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub initial_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    /// Decay never pushes a score below this.
    pub decay_floor: f64,
    /// Idle time after the last action before decay starts.
    pub decay_threshold_secs: u64,
    pub decay_period_secs: u64,
    pub decay_rate: f64,
    pub streak_window_secs: u64,
    pub streak_bonus_step: f64,
    pub streak_bonus_cap: f64,
    pub slash_window_secs: u64,
    /// Extra fraction taken per earlier slash inside the window.
    pub slash_compound_pct: f64,
    pub slash_tiers: SlashTiers,
    pub grades: GradeThresholds,
    pub reorder_buffer_limit: usize,
    pub history_limit: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            initial_score: 500.0,
            min_score: 0.0,
            max_score: 1_000.0,
            decay_floor: 0.0,
            decay_threshold_secs: 7 * 86_400,
            decay_period_secs: 86_400,
            decay_rate: 2.0,
            streak_window_secs: 86_400,
            streak_bonus_step: 2.0,
            streak_bonus_cap: 20.0,
            slash_window_secs: 30 * 86_400,
            slash_compound_pct: 0.10,
            slash_tiers: SlashTiers::default(),
            grades: GradeThresholds::default(),
            reorder_buffer_limit: 256,
            history_limit: 100,
        }
    }
}

impl ReputationConfig {
    pub fn clamp(&self, score: f64) -> f64 {
        score.clamp(self.min_score, self.max_score)
    }

    pub fn streak_bonus(&self, streak: u32) -> f64 {
        (self.streak_bonus_step * streak as f64).min(self.streak_bonus_cap)
    }
}
