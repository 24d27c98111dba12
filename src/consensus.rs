//! Proof-of-Contribution validator selection
//!
//! Validators are drawn at random with probability proportional to their
//! contribution score. A bounded history of committed blocks backs a repeat
//! cap: a validator that would appear more than `max_selections_in_window`
//! times in the most recent window is refused. The cap is a per-node
//! heuristic against validator capture, evaluated against this node's own
//! view of history. History only moves when a block is committed, so a
//! rejected or abandoned block never counts against its validator.

use crate::block::Block;
use crate::config::ConsensusConfig;
use crate::error::ChainError;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRecord {
    pub validator_id: String,
    pub score: u64,
    pub selected_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContributionStats {
    pub total: u64,
    pub average: f64,
    pub median: f64,
    pub min: u64,
    pub max: u64,
    pub count: usize,
}

/// Bug report severity, which sets a report's weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

/// An activity that raises its author's contribution score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contribution {
    Code { lines_of_code: u64 },
    BugReport { severity: Severity },
    Documentation { page_count: u64 },
    CommunitySupport { help_count: u64 },
    ProposalSubmission,
    ProposalReview,
    Other,
}

impl Contribution {
    /// Weight in tenths of a score point.
    fn weight_tenths(&self) -> u64 {
        match *self {
            Contribution::Code { lines_of_code } => lines_of_code,
            Contribution::BugReport { severity } => match severity {
                Severity::Critical => 500,
                Severity::Major => 300,
                Severity::Minor => 100,
            },
            Contribution::Documentation { page_count } => page_count.saturating_mul(50),
            Contribution::CommunitySupport { help_count } => help_count.saturating_mul(20),
            Contribution::ProposalSubmission => 250,
            Contribution::ProposalReview => 150,
            Contribution::Other => 100,
        }
    }

    /// Score increase, scaled by a quality percentage when one is given.
    /// A quality of zero is treated as unrated. Halves round up.
    pub fn points(&self, quality: Option<u32>) -> u64 {
        let tenths = self.weight_tenths();
        match quality.filter(|q| *q > 0) {
            Some(quality) => tenths
                .saturating_mul(u64::from(quality))
                .saturating_add(500)
                / 1_000,
            None => tenths.saturating_add(5) / 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreUpdate {
    pub previous: u64,
    pub increase: u64,
    pub score: u64,
}

pub struct ConsensusEngine {
    scores: HashMap<String, u64>,
    history: VecDeque<SelectionRecord>,
    config: ConsensusConfig,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            scores: HashMap::new(),
            history: VecDeque::with_capacity(config.history_capacity),
            config,
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn set_score(&mut self, id: &str, score: u64) {
        self.scores.insert(id.to_string(), score);
    }

    pub fn get_score(&self, id: &str) -> u64 {
        self.scores.get(id).copied().unwrap_or(0)
    }

    pub fn increment_score(&mut self, id: &str, by: u64) -> u64 {
        let score = self.scores.entry(id.to_string()).or_insert(0);
        *score = score.saturating_add(by);
        *score
    }

    /// Credits `id` for a contribution, weighted by kind and quality.
    pub fn record_contribution(
        &mut self,
        id: &str,
        contribution: Contribution,
        quality: Option<u32>,
    ) -> ScoreUpdate {
        let previous = self.get_score(id);
        let increase = contribution.points(quality);
        let score = self.increment_score(id, increase);
        debug!(identity = id, ?contribution, increase, score, "contribution recorded");
        ScoreUpdate {
            previous,
            increase,
            score,
        }
    }

    pub fn is_eligible(&self, id: &str) -> bool {
        self.get_score(id) >= self.config.min_score
    }

    pub fn eligible_count(&self) -> usize {
        self.scores
            .values()
            .filter(|score| **score >= self.config.min_score)
            .count()
    }

    pub fn select_validator(&self, candidates: &[String]) -> Result<String, ChainError> {
        self.select_validator_with(candidates, &mut rand::thread_rng())
    }

    /// Weighted draw over eligible candidates using the supplied generator.
    /// Candidates already at the repeat cap are skipped.
    pub fn select_validator_with<R: Rng + ?Sized>(
        &self,
        candidates: &[String],
        rng: &mut R,
    ) -> Result<String, ChainError> {
        let mut seen = HashSet::new();
        let scored: Vec<(&String, u64)> = candidates
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .map(|id| (id, self.get_score(id)))
            .filter(|(_, score)| *score >= self.config.min_score)
            .collect();

        if scored.is_empty() {
            return Err(ChainError::Consensus(format!(
                "no candidate meets the minimum contribution score of {}",
                self.config.min_score
            )));
        }

        let eligible: Vec<(&String, u64)> = scored
            .into_iter()
            .filter(|(id, _)| !self.at_repeat_cap(id))
            .collect();
        if eligible.is_empty() {
            return Err(ChainError::Consensus(format!(
                "every eligible candidate produced {} of the last {} blocks",
                self.config.max_selections_in_window, self.config.selection_window
            )));
        }

        let total: u64 = eligible.iter().map(|(_, score)| *score).sum();
        let (chosen, score) = if total == 0 {
            eligible[rng.gen_range(0..eligible.len())]
        } else {
            let mut ticket = rng.gen_range(0..total);
            let mut pick = eligible[eligible.len() - 1];
            for entry in &eligible {
                if ticket < entry.1 {
                    pick = *entry;
                    break;
                }
                ticket -= entry.1;
            }
            pick
        };

        debug!(validator = %chosen, score, total, "validator selected");
        Ok(chosen.clone())
    }

    fn record(&mut self, validator_id: &str, score: u64) {
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(SelectionRecord {
            validator_id: validator_id.to_string(),
            score,
            selected_at: crate::now_millis(),
        });
    }

    /// Records the validator of a committed block, local or remote, so the
    /// repeat cap sees it.
    pub fn observe_block(&mut self, block: &Block) {
        let score = self.get_score(&block.header.validator_id);
        self.record(&block.header.validator_id, score);
    }

    pub fn recent_selections(&self, id: &str) -> usize {
        self.history
            .iter()
            .rev()
            .take(self.config.selection_window)
            .filter(|record| record.validator_id == id)
            .count()
    }

    fn at_repeat_cap(&self, id: &str) -> bool {
        self.recent_selections(id) >= self.config.max_selections_in_window
    }

    /// Checks `block` before it is committed. Its own appearance counts
    /// towards the repeat cap.
    pub fn validate_block(&self, block: &Block) -> Result<(), ChainError> {
        let validator = &block.header.validator_id;
        let score = self.get_score(validator);
        if score < self.config.min_score {
            return Err(ChainError::Consensus(format!(
                "validator {} score {} is below the minimum {}",
                validator, score, self.config.min_score
            )));
        }

        let recent = self.recent_selections(validator) + 1;
        if recent > self.config.max_selections_in_window {
            return Err(ChainError::Consensus(format!(
                "validator {} would produce {} of the last {} blocks (cap {})",
                validator, recent, self.config.selection_window, self.config.max_selections_in_window
            )));
        }
        Ok(())
    }

    pub fn reward_validator(&mut self, id: &str) -> u64 {
        self.increment_score(id, self.config.block_reward_score)
    }

    /// Highest scores first, ties broken by identity.
    pub fn top_contributors(&self, limit: usize) -> Vec<(String, u64)> {
        let mut ranked: Vec<(String, u64)> = self
            .scores
            .iter()
            .map(|(id, score)| (id.clone(), *score))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    pub fn contribution_stats(&self) -> ContributionStats {
        let mut values: Vec<u64> = self.scores.values().copied().collect();
        if values.is_empty() {
            return ContributionStats::default();
        }
        values.sort_unstable();

        let count = values.len();
        let total: u64 = values.iter().sum();
        let median = if count % 2 == 0 {
            (values[count / 2 - 1] + values[count / 2]) as f64 / 2.0
        } else {
            values[count / 2] as f64
        };
        ContributionStats {
            total,
            average: total as f64 / count as f64,
            median,
            min: values[0],
            max: values[count - 1],
            count,
        }
    }

    /// Most recent selections first.
    pub fn validator_history(&self, limit: usize) -> Vec<SelectionRecord> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn scores(&self) -> &HashMap<String, u64> {
        &self.scores
    }
}
