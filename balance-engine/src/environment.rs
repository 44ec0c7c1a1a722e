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

use std::sync::Arc;

use balance_common::{
    ChangeTracker, DEFAULT_CHANGE_AMOUNT, DEFAULT_MAX_CHANGES_PER_EPISODE, MatrixSpace,
    OutcomeRecord, ValidationError,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::reward::{RewardBreakdown, RewardModel};

/// Capability set shared by the balance environments.
pub trait Environment {
    type Action;

    /// Restores the template and returns the initial observation.
    fn reset(&mut self) -> &MatrixSpace;
    fn step(&mut self, action: &Self::Action) -> Result<StepResult, ValidationError>;
    fn observation_shape(&self) -> (usize, usize);
    fn action_shape(&self) -> ActionShape;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionShape {
    /// One continuous component in `[-1, 1]` per cell.
    Box { rows: usize, cols: usize },
    /// One of `n` discrete choices.
    Discrete(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvConfig {
    pub change_amount: f64,
    pub max_changes_per_episode: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            change_amount: DEFAULT_CHANGE_AMOUNT,
            max_changes_per_episode: DEFAULT_MAX_CHANGES_PER_EPISODE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub observation: MatrixSpace,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub step: u64,
    pub changes: Vec<Vec<u64>>,
    pub last_changed: Option<(usize, usize)>,
    pub outcome_reward: RewardBreakdown,
    pub stability_penalty: f64,
}

/// Per-cell adjustment proposed by a policy, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    rows: usize,
    cols: usize,
    values: Vec<f64>,
}

impl Adjustment {
    pub fn new(rows: usize, cols: usize, values: Vec<f64>) -> Result<Self, ValidationError> {
        if values.len() != rows * cols {
            return Err(ValidationError::ShapeMismatch {
                expected: (rows, cols),
                found: (values.len() / cols.max(1), cols),
            });
        }
        Ok(Self { rows, cols, values })
    }

    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self {
            rows,
            cols,
            values: vec![value; rows * cols],
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        (row < self.rows && col < self.cols).then(|| self.values[row * self.cols + col])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscreteAction {
    Increase,
    Decrease,
    Hold,
}

impl DiscreteAction {
    /// Maps a continuous policy output onto the three discrete moves.
    pub fn from_signal(signal: f64) -> Self {
        if signal > 1.0 / 3.0 {
            DiscreteAction::Increase
        } else if signal < -1.0 / 3.0 {
            DiscreteAction::Decrease
        } else {
            DiscreteAction::Hold
        }
    }

    fn direction(self) -> f64 {
        match self {
            DiscreteAction::Increase => 1.0,
            DiscreteAction::Decrease => -1.0,
            DiscreteAction::Hold => 0.0,
        }
    }
}

/// State shared by both environment variants: template, working copy, change
/// counts and the step counter.
#[derive(Debug, Clone)]
struct Episode {
    template: MatrixSpace,
    working: MatrixSpace,
    tracker: ChangeTracker,
    steps: u64,
    last_changed: Option<(usize, usize)>,
    outcomes: Arc<[OutcomeRecord]>,
    outcome_reward: RewardBreakdown,
    reward_model: RewardModel,
    config: EnvConfig,
}

impl Episode {
    fn new(
        template: MatrixSpace,
        outcomes: Arc<[OutcomeRecord]>,
        reward_model: RewardModel,
        config: EnvConfig,
    ) -> Self {
        let outcome_reward = reward_model.outcome_reward(template.name(), &outcomes);
        let tracker = ChangeTracker::new(template.rows(), template.cols());
        Self {
            working: template.clone(),
            template,
            tracker,
            steps: 0,
            last_changed: None,
            outcomes,
            outcome_reward,
            reward_model,
            config,
        }
    }

    fn reset(&mut self) {
        self.working = self.template.clone();
        self.tracker.reset();
        self.steps = 0;
        self.last_changed = None;
    }

    fn done(&self) -> bool {
        self.steps >= self.config.max_changes_per_episode
    }

    fn ensure_running(&self) -> Result<(), ValidationError> {
        if self.done() {
            return Err(ValidationError::EpisodeFinished { steps: self.steps });
        }
        Ok(())
    }

    /// Applies `direction * change_amount` to one cell, clipping into range.
    fn nudge(&mut self, row: usize, col: usize, direction: f64) -> Result<(), ValidationError> {
        let Some(current) = self.working.get(row, col) else {
            return Ok(());
        };
        let range = self.working.range();
        let next = range.clamp(current + direction.clamp(-1.0, 1.0) * self.config.change_amount);
        if self.working.set(row, col, next)? {
            self.tracker.record(row, col);
            self.last_changed = Some((row, col));
        }
        Ok(())
    }

    /// Runs `mutate` and rolls the working matrix back if it fails or leaves a cell out of range.
    fn transact<F>(&mut self, mutate: F) -> Result<StepResult, ValidationError>
    where
        F: FnOnce(&mut Self) -> Result<(), ValidationError>,
    {
        self.ensure_running()?;
        let snapshot = (
            self.working.clone(),
            self.tracker.clone(),
            self.last_changed,
        );
        if let Err(error) = mutate(&mut *self).and_then(|()| self.working.validate()) {
            (self.working, self.tracker, self.last_changed) = snapshot;
            return Err(error);
        }
        self.steps += 1;
        Ok(self.result())
    }

    fn result(&self) -> StepResult {
        let stability_penalty = self.reward_model.stability_penalty(self.tracker.total());
        StepResult {
            observation: self.working.clone(),
            reward: self.outcome_reward.total() - stability_penalty,
            done: self.done(),
            info: StepInfo {
                step: self.steps,
                changes: self.tracker.to_rows(),
                last_changed: self.last_changed,
                outcome_reward: self.outcome_reward,
                stability_penalty,
            },
        }
    }
}

/// Continuous-action environment: every cell moves by its own action component.
#[derive(Debug, Clone)]
pub struct BalanceEnvironment {
    episode: Episode,
}

impl BalanceEnvironment {
    pub fn new(
        template: MatrixSpace,
        outcomes: impl Into<Arc<[OutcomeRecord]>>,
        reward_model: RewardModel,
        config: EnvConfig,
    ) -> Self {
        Self {
            episode: Episode::new(template, outcomes.into(), reward_model, config),
        }
    }

    pub fn name(&self) -> &str {
        self.episode.template.name()
    }

    pub fn template(&self) -> &MatrixSpace {
        &self.episode.template
    }

    pub fn working(&self) -> &MatrixSpace {
        &self.episode.working
    }

    pub fn outcomes(&self) -> &[OutcomeRecord] {
        &self.episode.outcomes
    }

    pub fn steps(&self) -> u64 {
        self.episode.steps
    }

    pub fn is_done(&self) -> bool {
        self.episode.done()
    }

    pub fn into_working(self) -> MatrixSpace {
        self.episode.working
    }
}

impl Environment for BalanceEnvironment {
    type Action = Adjustment;

    fn reset(&mut self) -> &MatrixSpace {
        self.episode.reset();
        &self.episode.working
    }

    fn step(&mut self, action: &Adjustment) -> Result<StepResult, ValidationError> {
        let shape = self.observation_shape();
        if action.shape() != shape {
            return Err(ValidationError::ShapeMismatch {
                expected: shape,
                found: action.shape(),
            });
        }
        if let Some(index) = action.values.iter().position(|v| !v.is_finite()) {
            return Err(ValidationError::NotFinite {
                row: index / shape.1,
                col: index % shape.1,
            });
        }

        self.episode.transact(|episode| {
            for (index, component) in action.values.iter().enumerate() {
                episode.nudge(index / shape.1, index % shape.1, *component)?;
            }
            Ok(())
        })
    }

    fn observation_shape(&self) -> (usize, usize) {
        self.episode.template.shape()
    }

    fn action_shape(&self) -> ActionShape {
        let (rows, cols) = self.observation_shape();
        ActionShape::Box { rows, cols }
    }
}

/// Discrete-action environment: each step moves a single focus cell up, down
/// or not at all. The focus is drawn uniformly at reset and after every step.
#[derive(Debug, Clone)]
pub struct DiscreteBalanceEnvironment {
    episode: Episode,
    focus: (usize, usize),
    rng: StdRng,
}

impl DiscreteBalanceEnvironment {
    pub fn new(
        template: MatrixSpace,
        outcomes: impl Into<Arc<[OutcomeRecord]>>,
        reward_model: RewardModel,
        config: EnvConfig,
    ) -> Self {
        Self::with_rng(
            template,
            outcomes,
            reward_model,
            config,
            StdRng::from_rng(&mut rand::rng()),
        )
    }

    pub fn with_seed(
        template: MatrixSpace,
        outcomes: impl Into<Arc<[OutcomeRecord]>>,
        reward_model: RewardModel,
        config: EnvConfig,
        seed: u64,
    ) -> Self {
        Self::with_rng(
            template,
            outcomes,
            reward_model,
            config,
            StdRng::seed_from_u64(seed),
        )
    }

    fn with_rng(
        template: MatrixSpace,
        outcomes: impl Into<Arc<[OutcomeRecord]>>,
        reward_model: RewardModel,
        config: EnvConfig,
        rng: StdRng,
    ) -> Self {
        let mut env = Self {
            episode: Episode::new(template, outcomes.into(), reward_model, config),
            focus: (0, 0),
            rng,
        };
        env.refocus();
        env
    }

    fn refocus(&mut self) {
        let (rows, cols) = self.episode.template.shape();
        self.focus = (self.rng.random_range(0..rows), self.rng.random_range(0..cols));
    }

    /// Cell the next step will modify.
    pub fn focus_cell(&self) -> (usize, usize) {
        self.focus
    }

    pub fn working(&self) -> &MatrixSpace {
        &self.episode.working
    }

    pub fn is_done(&self) -> bool {
        self.episode.done()
    }

    pub fn into_working(self) -> MatrixSpace {
        self.episode.working
    }
}

impl Environment for DiscreteBalanceEnvironment {
    type Action = DiscreteAction;

    fn reset(&mut self) -> &MatrixSpace {
        self.episode.reset();
        self.refocus();
        &self.episode.working
    }

    fn step(&mut self, action: &DiscreteAction) -> Result<StepResult, ValidationError> {
        let (row, col) = self.focus;
        let direction = action.direction();
        let result = self
            .episode
            .transact(|episode| episode.nudge(row, col, direction))?;
        self.refocus();
        Ok(result)
    }

    fn observation_shape(&self) -> (usize, usize) {
        self.episode.template.shape()
    }

    fn action_shape(&self) -> ActionShape {
        ActionShape::Discrete(3)
    }
}
