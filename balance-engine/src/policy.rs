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

use balance_common::{MatrixSpace, ValidationError};
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::environment::{Adjustment, Environment};
use crate::error::{BalanceError, Result};
use crate::network::{Adam, Mlp};

/// Per-cell inputs: normalized value, row mean, column mean, global mean, row
/// position and column position.
pub const CELL_FEATURES: usize = 6;

const LOG_STD_BOUNDS: (f64, f64) = (-5.0, 1.0);

/// PPO hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub learning_rate: f64,
    /// Transitions collected before each optimization pass.
    pub rollout_len: usize,
    pub batch_size: usize,
    pub n_epochs: usize,
    pub gamma: f64,
    pub gae_lambda: f64,
    pub clip_range: f64,
    pub ent_coef: f64,
    pub vf_coef: f64,
    pub max_grad_norm: f64,
    pub hidden_sizes: Vec<usize>,
    pub initial_log_std: f64,
    pub seed: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-5,
            rollout_len: 2048,
            batch_size: 64,
            n_epochs: 10,
            gamma: 0.99,
            gae_lambda: 0.95,
            clip_range: 0.2,
            ent_coef: 0.01,
            vf_coef: 0.5,
            max_grad_norm: 0.5,
            hidden_sizes: vec![128, 128],
            initial_log_std: 0.0,
            seed: None,
        }
    }
}

impl PolicyConfig {
    /// Reads an override file. Unreadable or malformed files are logged and ignored.
    pub fn from_yaml_file(path: &str) -> Option<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(path = %path, error = %error, "failed to read policy config file");
                return None;
            }
        };

        match serde_yaml::from_str::<PolicyConfig>(&raw) {
            Ok(config) => Some(config),
            Err(error) => {
                warn!(path = %path, error = %error, "failed to parse policy config yaml");
                None
            }
        }
    }

    /// Small, seeded profile for tests.
    #[cfg(test)]
    pub(crate) fn tiny() -> Self {
        Self {
            learning_rate: 1e-3,
            rollout_len: 16,
            batch_size: 16,
            n_epochs: 2,
            hidden_sizes: vec![8],
            seed: Some(5),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingStats {
    pub timesteps: u64,
    pub total_timesteps: u64,
    pub rollouts: usize,
    pub episodes_finished: usize,
    pub mean_reward: f64,
    pub policy_loss: f64,
    pub value_loss: f64,
    pub optimizer_steps: u64,
}

/// Serialized form of a [`Policy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCheckpoint {
    pub name: String,
    pub config: PolicyConfig,
    pub actor: Mlp,
    pub critic: Mlp,
    pub log_std: f64,
    pub actor_optimizer: Adam,
    pub critic_optimizer: Adam,
    pub log_std_optimizer: Adam,
    pub timesteps: u64,
    pub saved_at: DateTime<Utc>,
}

/// Parameter-shared Gaussian actor-critic over matrix cells.
///
/// Every cell is scored from the same feature layout, so one policy serves a
/// matrix name regardless of the dimensions requested.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    config: PolicyConfig,
    actor: Mlp,
    critic: Mlp,
    log_std: f64,
    actor_optimizer: Adam,
    critic_optimizer: Adam,
    log_std_optimizer: Adam,
    timesteps: u64,
    rng: StdRng,
}

struct Transition {
    features: Vec<[f64; CELL_FEATURES]>,
    actions: Vec<f64>,
    log_probs: Vec<f64>,
    value: f64,
    reward: f64,
    done: bool,
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

impl Policy {
    pub fn new(name: impl Into<String>, config: PolicyConfig) -> Self {
        let mut rng = seeded_rng(config.seed);
        let actor = Mlp::new(CELL_FEATURES, &config.hidden_sizes, 1, 0.01, &mut rng);
        let critic = Mlp::new(CELL_FEATURES, &config.hidden_sizes, 1, 1.0, &mut rng);
        Self {
            name: name.into(),
            actor_optimizer: Adam::new(actor.param_count()),
            critic_optimizer: Adam::new(critic.param_count()),
            log_std_optimizer: Adam::new(1),
            log_std: config.initial_log_std,
            actor,
            critic,
            config,
            timesteps: 0,
            rng,
        }
    }

    pub fn from_checkpoint(checkpoint: PolicyCheckpoint) -> Result<Self> {
        let name = checkpoint.name;
        for (label, net) in [("actor", &checkpoint.actor), ("critic", &checkpoint.critic)] {
            if net.input_size() != CELL_FEATURES {
                return Err(BalanceError::model(
                    &name,
                    format!("{label} expects {} inputs", net.input_size()),
                ));
            }
            if net.params().iter().any(|p| !p.is_finite()) {
                return Err(BalanceError::model(&name, format!("{label} has non-finite weights")));
            }
        }

        Ok(Self {
            rng: seeded_rng(checkpoint.config.seed),
            name,
            config: checkpoint.config,
            actor: checkpoint.actor,
            critic: checkpoint.critic,
            log_std: checkpoint.log_std,
            actor_optimizer: checkpoint.actor_optimizer,
            critic_optimizer: checkpoint.critic_optimizer,
            log_std_optimizer: checkpoint.log_std_optimizer,
            timesteps: checkpoint.timesteps,
        })
    }

    pub fn checkpoint(&self) -> PolicyCheckpoint {
        PolicyCheckpoint {
            name: self.name.clone(),
            config: self.config.clone(),
            actor: self.actor.clone(),
            critic: self.critic.clone(),
            log_std: self.log_std,
            actor_optimizer: self.actor_optimizer.clone(),
            critic_optimizer: self.critic_optimizer.clone(),
            log_std_optimizer: self.log_std_optimizer.clone(),
            timesteps: self.timesteps,
            saved_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Environment steps consumed across every training increment.
    pub fn timesteps(&self) -> u64 {
        self.timesteps
    }

    pub fn optimizer_steps(&self) -> u64 {
        self.actor_optimizer.step_count()
    }

    pub fn predict(
        &mut self,
        observation: &MatrixSpace,
        deterministic: bool,
    ) -> std::result::Result<Adjustment, ValidationError> {
        let std = self.log_std.exp();
        let values = cell_features(observation)
            .iter()
            .map(|features| {
                let mean = self.actor.forward(features)[0];
                let action = if deterministic {
                    mean
                } else {
                    let noise: f64 = self.rng.sample(StandardNormal);
                    mean + std * noise
                };
                action.clamp(-1.0, 1.0)
            })
            .collect();
        Adjustment::new(observation.rows(), observation.cols(), values)
    }

    /// Critic estimate for an observation: mean of the per-cell values.
    pub fn state_value(&self, observation: &MatrixSpace) -> f64 {
        self.value_of(&cell_features(observation))
    }

    fn value_of(&self, features: &[[f64; CELL_FEATURES]]) -> f64 {
        let total: f64 = features.iter().map(|f| self.critic.forward(f)[0]).sum();
        total / features.len().max(1) as f64
    }

    /// Runs PPO for `timesteps` environment steps, continuing the optimizer
    /// schedule from earlier calls. `cancel` is checked between epochs.
    pub fn learn<E>(
        &mut self,
        env: &mut E,
        timesteps: u64,
        cancel: &watch::Receiver<bool>,
    ) -> Result<TrainingStats>
    where
        E: Environment<Action = Adjustment>,
    {
        let mut stats = TrainingStats::default();
        let mut observation = env.reset().clone();
        let mut remaining = timesteps;
        let mut reward_sum = 0.0;

        while remaining > 0 {
            let horizon = remaining.min(self.config.rollout_len.max(1) as u64) as usize;
            let mut rollout = Vec::with_capacity(horizon);

            for _ in 0..horizon {
                let features = cell_features(&observation);
                let std = self.log_std.exp();
                let mut actions = Vec::with_capacity(features.len());
                let mut log_probs = Vec::with_capacity(features.len());
                for f in &features {
                    let mean = self.actor.forward(f)[0];
                    let noise: f64 = self.rng.sample(StandardNormal);
                    let action = mean + std * noise;
                    log_probs.push(gaussian_log_prob(action, mean, self.log_std));
                    actions.push(action);
                }
                let value = self.value_of(&features);
                let proposal = Adjustment::new(observation.rows(), observation.cols(), actions.clone())?;
                let result = env.step(&proposal)?;

                reward_sum += result.reward;
                if result.done {
                    stats.episodes_finished += 1;
                }
                rollout.push(Transition {
                    features,
                    actions,
                    log_probs,
                    value,
                    reward: result.reward,
                    done: result.done,
                });
                observation = if result.done {
                    env.reset().clone()
                } else {
                    result.observation
                };
            }

            let bootstrap = match rollout.last() {
                Some(last) if !last.done => self.state_value(&observation),
                _ => 0.0,
            };
            let (advantages, returns) = self.advantages(&rollout, bootstrap);
            let (policy_loss, value_loss) = self.optimize(&rollout, &advantages, &returns, cancel)?;

            stats.policy_loss = policy_loss;
            stats.value_loss = value_loss;
            stats.rollouts += 1;
            stats.timesteps += horizon as u64;
            self.timesteps += horizon as u64;
            remaining -= horizon as u64;
        }

        stats.total_timesteps = self.timesteps;
        stats.optimizer_steps = self.optimizer_steps();
        if stats.timesteps > 0 {
            stats.mean_reward = reward_sum / stats.timesteps as f64;
        }
        debug!(
            policy = %self.name,
            timesteps = stats.timesteps,
            total_timesteps = stats.total_timesteps,
            mean_reward = stats.mean_reward,
            "policy update finished"
        );
        Ok(stats)
    }

    /// Generalized advantage estimates and discounted returns, advantages normalized.
    fn advantages(&self, rollout: &[Transition], bootstrap: f64) -> (Vec<f64>, Vec<f64>) {
        let (gamma, lambda) = (self.config.gamma, self.config.gae_lambda);
        let mut advantages = vec![0.0; rollout.len()];
        let mut running = 0.0;
        for t in (0..rollout.len()).rev() {
            let next_value = rollout.get(t + 1).map_or(bootstrap, |next| next.value);
            let live = if rollout[t].done { 0.0 } else { 1.0 };
            let delta = rollout[t].reward + gamma * next_value * live - rollout[t].value;
            running = delta + gamma * lambda * live * running;
            advantages[t] = running;
        }

        let returns = advantages
            .iter()
            .zip(rollout)
            .map(|(advantage, transition)| advantage + transition.value)
            .collect();

        if advantages.len() > 1 {
            let n = advantages.len() as f64;
            let mean = advantages.iter().sum::<f64>() / n;
            let std = (advantages.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n).sqrt();
            for advantage in &mut advantages {
                *advantage = (*advantage - mean) / (std + 1e-8);
            }
        }
        (advantages, returns)
    }

    fn optimize(
        &mut self,
        rollout: &[Transition],
        advantages: &[f64],
        returns: &[f64],
        cancel: &watch::Receiver<bool>,
    ) -> Result<(f64, f64)> {
        let mut samples: Vec<(usize, usize)> = rollout
            .iter()
            .enumerate()
            .flat_map(|(t, transition)| (0..transition.features.len()).map(move |cell| (t, cell)))
            .collect();
        let clip = self.config.clip_range;
        let (mut policy_loss, mut value_loss) = (0.0, 0.0);

        for _ in 0..self.config.n_epochs {
            if *cancel.borrow() {
                return Err(BalanceError::Cancelled(self.name.clone()));
            }
            samples.shuffle(&mut self.rng);
            let (mut epoch_policy, mut epoch_value) = (0.0, 0.0);

            for chunk in samples.chunks(self.config.batch_size.max(1)) {
                let scale = 1.0 / chunk.len() as f64;
                let mut actor_grads = vec![0.0; self.actor.param_count()];
                let mut critic_grads = vec![0.0; self.critic.param_count()];
                let mut log_std_grad = 0.0;
                let std = self.log_std.exp();

                for &(t, cell) in chunk {
                    let transition = &rollout[t];
                    let features = &transition.features[cell];
                    let advantage = advantages[t];

                    let trace = self.actor.forward_trace(features);
                    let mean = trace.output()[0];
                    let action = transition.actions[cell];
                    let z = (action - mean) / std;
                    let log_prob = gaussian_log_prob(action, mean, self.log_std);
                    let ratio = (log_prob - transition.log_probs[cell]).exp();

                    let unclipped = ratio * advantage;
                    let clipped = ratio.clamp(1.0 - clip, 1.0 + clip) * advantage;
                    epoch_policy -= unclipped.min(clipped) * scale;
                    let clip_active = (advantage > 0.0 && ratio > 1.0 + clip)
                        || (advantage < 0.0 && ratio < 1.0 - clip);
                    let d_log_prob = if clip_active { 0.0 } else { -unclipped };

                    self.actor
                        .backward(&trace, &[d_log_prob * z / std * scale], &mut actor_grads);
                    log_std_grad += (d_log_prob * (z * z - 1.0) - self.config.ent_coef) * scale;

                    let value_trace = self.critic.forward_trace(features);
                    let error = value_trace.output()[0] - returns[t];
                    epoch_value += error * error * scale;
                    self.critic.backward(
                        &value_trace,
                        &[2.0 * self.config.vf_coef * error * scale],
                        &mut critic_grads,
                    );
                }

                let norm = (actor_grads.iter().chain(&critic_grads).map(|g| g * g).sum::<f64>()
                    + log_std_grad * log_std_grad)
                    .sqrt();
                if norm > self.config.max_grad_norm && norm > 0.0 {
                    let factor = self.config.max_grad_norm / norm;
                    actor_grads.iter_mut().for_each(|g| *g *= factor);
                    critic_grads.iter_mut().for_each(|g| *g *= factor);
                    log_std_grad *= factor;
                }

                let lr = self.config.learning_rate;
                self.actor_optimizer.update(self.actor.params_mut(), &actor_grads, lr);
                self.critic_optimizer.update(self.critic.params_mut(), &critic_grads, lr);
                self.log_std_optimizer
                    .update(std::slice::from_mut(&mut self.log_std), &[log_std_grad], lr);
                self.log_std = self.log_std.clamp(LOG_STD_BOUNDS.0, LOG_STD_BOUNDS.1);
            }

            let batches = samples.len().div_ceil(self.config.batch_size.max(1)).max(1) as f64;
            policy_loss = epoch_policy / batches;
            value_loss = epoch_value / batches;
        }

        if !policy_loss.is_finite() || !value_loss.is_finite() {
            return Err(BalanceError::model(&self.name, "loss diverged"));
        }
        Ok((policy_loss, value_loss))
    }
}

fn gaussian_log_prob(action: f64, mean: f64, log_std: f64) -> f64 {
    let z = (action - mean) / log_std.exp();
    -0.5 * z * z - log_std - 0.5 * (2.0 * std::f64::consts::PI).ln()
}

fn position(index: usize, len: usize) -> f64 {
    if len > 1 {
        index as f64 / (len - 1) as f64 * 2.0 - 1.0
    } else {
        0.0
    }
}

pub fn cell_features(matrix: &MatrixSpace) -> Vec<[f64; CELL_FEATURES]> {
    let range = matrix.range();
    let (rows, cols) = matrix.shape();
    let row_means: Vec<f64> = (0..rows).map(|r| range.normalize(matrix.row_mean(r))).collect();
    let col_means: Vec<f64> = (0..cols).map(|c| range.normalize(matrix.col_mean(c))).collect();
    let global = range.normalize(matrix.mean());

    matrix
        .values()
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let (row, col) = (index / cols, index % cols);
            [
                range.normalize(*value),
                row_means[row],
                col_means[col],
                global,
                position(row, rows),
                position(col, cols),
            ]
        })
        .collect()
}
