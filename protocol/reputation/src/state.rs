use crate::config::ReputationConfig;
use crate::grade::{Grade, SlashSeverity};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScoreEventKind {
    Action { action_type: String, streak_bonus: f64 },
    Decay { periods: u64 },
    Slash { severity: SlashSeverity, compounded: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEvent {
    pub kind: ScoreEventKind,
    /// Applied change after clamping.
    pub delta: f64,
    pub score_after: f64,
    pub timestamp: u64,
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityStatistics {
    pub positive_events: u64,
    pub negative_events: u64,
    pub total_earned: f64,
    pub total_lost: f64,
    pub longest_streak: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationState {
    pub identity: String,
    pub score: f64,
    pub streak_count: u32,
    pub registered_at: u64,
    pub last_action_ts: Option<u64>,
    /// Last action with a non-zero weight; the streak window is measured
    /// from here.
    #[serde(default)]
    pub last_streak_ts: Option<u64>,
    pub last_decay_ts: u64,
    pub slash_count: u32,
    pub grade: Grade,
    pub statistics: IdentityStatistics,
    recent_slashes: VecDeque<u64>,
    history: VecDeque<ScoreEvent>,
}

impl ReputationState {
    pub fn new(identity: &str, registered_at: u64, config: &ReputationConfig) -> Self {
        let score = config.clamp(config.initial_score);
        Self {
            identity: identity.to_string(),
            score,
            streak_count: 0,
            registered_at,
            last_action_ts: None,
            last_streak_ts: None,
            last_decay_ts: registered_at,
            slash_count: 0,
            grade: Grade::from_score(score, &config.grades),
            statistics: IdentityStatistics::default(),
            recent_slashes: VecDeque::new(),
            history: VecDeque::new(),
        }
    }

    /// Newest first.
    pub fn history(&self) -> impl Iterator<Item = &ScoreEvent> {
        self.history.iter().rev()
    }

    /// Applies one confirmed action: decay up to `timestamp`, then the weight
    /// and, for positive weights inside the streak window, a streak bonus.
    /// Zero-weight actions count as activity but leave the streak alone.
    pub fn apply_action(
        &mut self,
        action_type: &str,
        weight: f64,
        timestamp: u64,
        batch_id: &str,
        config: &ReputationConfig,
    ) -> f64 {
        self.apply_decay(timestamp, config);
        let bonus = if weight == 0.0 {
            0.0
        } else {
            let in_window = self
                .last_streak_ts
                .is_some_and(|last| timestamp.saturating_sub(last) <= config.streak_window_secs);
            self.last_streak_ts =
                Some(self.last_streak_ts.map_or(timestamp, |last| last.max(timestamp)));
            if weight > 0.0 && in_window {
                self.streak_count += 1;
                config.streak_bonus(self.streak_count)
            } else {
                self.streak_count = 0;
                0.0
            }
        };
        self.statistics.longest_streak = self.statistics.longest_streak.max(self.streak_count);
        self.last_action_ts =
            Some(self.last_action_ts.map_or(timestamp, |last| last.max(timestamp)));
        self.change(
            weight + bonus,
            ScoreEventKind::Action {
                action_type: action_type.to_string(),
                streak_bonus: bonus,
            },
            timestamp,
            Some(batch_id),
            config,
        )
    }

    /// Decay is due once the identity has been idle past the threshold; it
    /// charges every whole period since the later of the last action and the
    /// last decay.
    pub fn apply_decay(&mut self, now: u64, config: &ReputationConfig) -> f64 {
        let idle_since = self.last_action_ts.unwrap_or(self.registered_at);
        if now.saturating_sub(idle_since) <= config.decay_threshold_secs
            || config.decay_period_secs == 0
        {
            return 0.0;
        }
        let reference = self.last_decay_ts.max(idle_since);
        let periods = now.saturating_sub(reference) / config.decay_period_secs;
        if periods == 0 {
            return 0.0;
        }
        self.last_decay_ts = reference + periods * config.decay_period_secs;
        let floor = config.decay_floor.max(config.min_score);
        let target = (self.score - config.decay_rate * periods as f64).max(floor.min(self.score));
        self.change(target - self.score, ScoreEventKind::Decay { periods }, now, None, config)
    }

    /// Flat tier deduction, then a further `(1 - pct)^k` on the result where
    /// `k` counts earlier slashes inside the slash window.
    pub fn apply_slash(
        &mut self,
        severity: SlashSeverity,
        now: u64,
        config: &ReputationConfig,
    ) -> f64 {
        self.apply_decay(now, config);
        while let Some(oldest) = self.recent_slashes.front() {
            if now.saturating_sub(*oldest) > config.slash_window_secs {
                self.recent_slashes.pop_front();
            } else {
                break;
            }
        }
        let compounded = self.recent_slashes.len() as u32;
        let flat = (self.score - config.slash_tiers.deduction(severity)).max(config.min_score);
        let target = flat * (1.0 - config.slash_compound_pct).powi(compounded as i32);
        self.recent_slashes.push_back(now);
        self.slash_count += 1;
        self.streak_count = 0;
        self.change(
            target - self.score,
            ScoreEventKind::Slash { severity, compounded },
            now,
            None,
            config,
        )
    }

    fn change(
        &mut self,
        delta: f64,
        kind: ScoreEventKind,
        timestamp: u64,
        batch_id: Option<&str>,
        config: &ReputationConfig,
    ) -> f64 {
        let before = self.score;
        self.score = config.clamp(self.score + delta);
        self.grade = Grade::from_score(self.score, &config.grades);
        let applied = self.score - before;
        if applied > 0.0 {
            self.statistics.positive_events += 1;
            self.statistics.total_earned += applied;
        } else if applied < 0.0 {
            self.statistics.negative_events += 1;
            self.statistics.total_lost += -applied;
        }
        self.history.push_back(ScoreEvent {
            kind,
            delta: applied,
            score_after: self.score,
            timestamp,
            batch_id: batch_id.map(str::to_string),
        });
        while self.history.len() > config.history_limit {
            self.history.pop_front();
        }
        applied
    }
}
