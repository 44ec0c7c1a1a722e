// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use balance_common::{MatrixCategory, OutcomeRecord, STABILITY_PENALTY_PER_CHANGE, WeightVector};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Scaling constants for each reward term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    pub survival_bonus: f64,
    pub trajectory_stability: f64,
    pub stronger_monster: f64,
    pub death_penalty: f64,
    /// Flat penalty for a death whose killer was not recorded.
    pub unknown_killer_penalty: f64,
    pub scale_spread: f64,
    pub scale_concentration: f64,
    pub missing_scale_penalty: f64,
    pub penalty_per_change: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            survival_bonus: 20.0,
            trajectory_stability: 15.0,
            stronger_monster: 5.0,
            death_penalty: 10.0,
            unknown_killer_penalty: 10.0,
            scale_spread: 2.0,
            scale_concentration: 0.01,
            missing_scale_penalty: 10.0,
            penalty_per_change: STABILITY_PENALTY_PER_CHANGE,
        }
    }
}

impl RewardWeights {
    /// Reads an override file; keys it omits keep their defaults.
    pub fn from_yaml_file(path: &str) -> Option<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(path = %path, error = %error, "failed to read reward weights file");
                return None;
            }
        };

        match serde_yaml::from_str::<RewardWeights>(&raw) {
            Ok(weights) => Some(weights),
            Err(error) => {
                warn!(path = %path, error = %error, "failed to parse reward weights yaml");
                None
            }
        }
    }
}

/// Per-term contributions of the outcome-dependent reward.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub survival: f64,
    pub trajectory_stability: f64,
    pub combat: f64,
    pub death: f64,
    pub attribute: f64,
}

impl RewardBreakdown {
    pub fn total(&self) -> f64 {
        self.survival + self.trajectory_stability + self.combat + self.death + self.attribute
    }

    fn accumulate(&mut self, other: RewardBreakdown) {
        self.survival += other.survival;
        self.trajectory_stability += other.trajectory_stability;
        self.combat += other.combat;
        self.death += other.death;
        self.attribute += other.attribute;
    }
}

/// Scores a balance matrix against a batch of outcomes.
///
/// The outcome-dependent part only looks at the matrix name and the batch, so
/// environments compute it once and subtract the churn penalty per step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RewardModel {
    weights: RewardWeights,
}

impl RewardModel {
    pub fn new(weights: RewardWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RewardWeights {
        &self.weights
    }

    pub fn outcome_reward(&self, matrix_name: &str, outcomes: &[OutcomeRecord]) -> RewardBreakdown {
        let category = MatrixCategory::of(matrix_name);
        let mut total = RewardBreakdown::default();
        for record in outcomes {
            let part = match category {
                MatrixCategory::Combat => self.combat_reward(record),
                MatrixCategory::Attribute => self.attribute_reward(record),
            };
            total.accumulate(part);
        }
        total
    }

    pub fn stability_penalty(&self, total_changes: u64) -> f64 {
        total_changes as f64 * self.weights.penalty_per_change
    }

    pub fn combat_reward(&self, record: &OutcomeRecord) -> RewardBreakdown {
        let w = &self.weights;
        let mut breakdown = RewardBreakdown::default();

        if !record.death {
            breakdown.survival = w.survival_bonus;
        }

        breakdown.trajectory_stability =
            trajectory_smoothness(&record.player_weight_trajectory) * w.trajectory_stability;

        for monster in &record.defeated_monsters {
            let Some(player) = record.player_weight_at(monster.step_killed) else {
                continue;
            };
            let (p, m) = (player.norm(), monster.weight.norm());
            breakdown.combat += if m > p {
                w.stronger_monster * (m - p) / (p + 1.0)
            } else {
                1.0 / f64::from(monster.battle_steps.max(1))
            };
        }

        if record.death {
            breakdown.death = match (&record.killer, record.final_player_weight()) {
                (Some(killer), Some(player)) => -self.death_penalty(&killer.weight, player),
                (None, _) => -w.unknown_killer_penalty,
                (Some(_), None) => 0.0,
            };
        }

        breakdown
    }

    /// Penalty for dying to `killer`. Largest for a killer identical to the
    /// player, shrinking quickly as the killer gets stronger and slowly as it
    /// gets weaker.
    pub fn death_penalty(&self, killer: &WeightVector, player: &WeightVector) -> f64 {
        let cos = killer.cosine_similarity(player);
        let p = player.norm();
        let d = (killer.norm() - p) / (p + 1.0);
        let magnitude = if d >= 0.0 {
            1.0 / (1.0 + 3.0 * d)
        } else {
            1.0 / (1.0 + d.abs())
        };
        self.weights.death_penalty * (1.0 + cos) * magnitude
    }

    pub fn attribute_reward(&self, record: &OutcomeRecord) -> RewardBreakdown {
        let w = &self.weights;
        let attribute = match &record.weight_scale {
            Some(scale) if !scale.is_empty() => {
                w.scale_spread * scale.spread() - w.scale_concentration * scale.concentration()
            }
            _ => -w.missing_scale_penalty,
        };
        RewardBreakdown {
            attribute,
            ..RewardBreakdown::default()
        }
    }
}

/// Mean over weight dimensions of `1 / (stddev(diff) + 1)`; 0 for fewer than two entries.
fn trajectory_smoothness(trajectory: &[WeightVector]) -> f64 {
    if trajectory.len() < 2 {
        return 0.0;
    }
    let dimensions = trajectory.iter().map(WeightVector::len).max().unwrap_or(0);
    if dimensions == 0 {
        return 0.0;
    }

    let total: f64 = (0..dimensions)
        .map(|dim| {
            let diffs: Vec<f64> = trajectory
                .windows(2)
                .map(|pair| pair[1].component(dim) - pair[0].component(dim))
                .collect();
            1.0 / (population_std(&diffs) + 1.0)
        })
        .sum();
    total / dimensions as f64
}

fn population_std(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use balance_common::{DefeatedMonster, WeightScale};

    #[test]
    fn weight_overrides_keep_defaults_for_missing_keys() {
        let path = std::env::temp_dir().join(format!("reward-weights-{}.yaml", std::process::id()));
        std::fs::write(&path, "survival_bonus: 40.0\ndeath_penalty: 2.5\n").unwrap();
        let weights = RewardWeights::from_yaml_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(weights.survival_bonus, 40.0);
        assert_eq!(weights.death_penalty, 2.5);
        assert_eq!(weights.trajectory_stability, RewardWeights::default().trajectory_stability);
        assert_eq!(RewardWeights::from_yaml_file("/nonexistent/reward-weights.yaml"), None);
    }

    #[test]
    fn overridden_weights_change_the_score() {
        let record = OutcomeRecord::new(1);
        let boosted = RewardModel::new(RewardWeights {
            survival_bonus: 40.0,
            ..RewardWeights::default()
        });
        assert_eq!(boosted.combat_reward(&record).survival, 40.0);
        assert_eq!(RewardModel::default().combat_reward(&record).survival, 20.0);
    }

    fn weight(values: &[f64]) -> WeightVector {
        WeightVector::new(values.to_vec())
    }

    fn death_by(killer: &[f64], player: &[f64]) -> OutcomeRecord {
        let mut record = OutcomeRecord::new(1);
        record.death = true;
        record.player_weight_trajectory = vec![weight(player)];
        record.killer = Some(DefeatedMonster {
            weight: weight(killer),
            battle_steps: 3,
            step_killed: None,
        });
        record
    }

    #[test]
    fn empty_batch_scores_zero() {
        let model = RewardModel::default();
        assert_eq!(model.outcome_reward("player_attack", &[]).total(), 0.0);
        assert_eq!(model.outcome_reward("weapon_attr", &[]).total(), 0.0);
    }

    #[test]
    fn survival_with_flat_trajectory() {
        let model = RewardModel::default();
        let mut record = OutcomeRecord::new(1);
        record.player_weight_trajectory = vec![weight(&[1.0, 2.0]), weight(&[1.0, 2.0])];
        let reward = model.outcome_reward("player_attack", &[record]);
        assert_eq!(reward.survival, 20.0);
        assert!((reward.trajectory_stability - 15.0).abs() < 1e-12);
        assert_eq!(reward.death, 0.0);
    }

    #[test]
    fn identical_killer_is_worse_than_much_weaker_killer() {
        let model = RewardModel::default();
        let player = [4.0, 3.0];
        let identical = model.outcome_reward("player_attack", &[death_by(&player, &player)]);
        let weaker = model.outcome_reward("player_attack", &[death_by(&[0.4, 0.3], &player)]);
        assert!(identical.total() < weaker.total());
        assert!((identical.death + 20.0).abs() < 1e-9);
    }

    #[test]
    fn weaker_killer_hurts_more_than_equally_stronger_killer() {
        let model = RewardModel::default();
        let player = weight(&[3.0, 4.0]);
        let stronger = model.death_penalty(&weight(&[4.8, 6.4]), &player);
        let weaker = model.death_penalty(&weight(&[1.2, 1.6]), &player);
        assert!(weaker > stronger);
    }

    #[test]
    fn zero_norm_vectors_do_not_panic() {
        let model = RewardModel::default();
        let reward = model.outcome_reward("monster_attack", &[death_by(&[0.0, 0.0], &[0.0, 0.0])]);
        assert!(reward.total().is_finite());
    }

    #[test]
    fn death_without_killer_is_flat_penalty() {
        let model = RewardModel::default();
        let mut record = OutcomeRecord::new(1);
        record.death = true;
        let reward = model.outcome_reward("player_attack", &[record]);
        assert_eq!(reward.death, -10.0);
        assert_eq!(reward.survival, 0.0);
    }

    #[test]
    fn defeated_monsters_use_weight_at_kill_time() {
        let model = RewardModel::default();
        let mut record = OutcomeRecord::new(1);
        record.player_weight_trajectory = vec![weight(&[1.0]), weight(&[10.0])];
        record.defeated_monsters = vec![
            DefeatedMonster {
                weight: weight(&[3.0]),
                battle_steps: 4,
                step_killed: Some(0),
            },
            DefeatedMonster {
                weight: weight(&[3.0]),
                battle_steps: 4,
                step_killed: None,
            },
        ];
        let reward = model.combat_reward(&record);
        // 5 * (3 - 1) / 2 for the early kill, 1/4 for the late one
        assert!((reward.combat - 5.25).abs() < 1e-12);
    }

    #[test]
    fn attribute_reward_uses_weight_scale() {
        let model = RewardModel::default();
        let mut record = OutcomeRecord::new(1);
        assert_eq!(model.attribute_reward(&record).attribute, -10.0);

        record.weight_scale = Some(WeightScale::new(vec![(1.0, 2), (4.0, 3)]));
        let reward = model.outcome_reward("weapon_attr", &[record]);
        assert!((reward.attribute - (6.0 - 0.13)).abs() < 1e-12);
    }

    #[test]
    fn stability_penalty_scales_with_changes() {
        let model = RewardModel::default();
        assert!((model.stability_penalty(250) - 0.25).abs() < 1e-12);
    }
}
