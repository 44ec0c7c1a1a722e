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

//! Reinforcement-learning core that nudges balance matrices toward recorded
//! game outcomes.

pub mod checkpoint;
pub mod environment;
pub mod error;
pub mod generator;
pub mod manager;
pub mod network;
pub mod policy;
pub mod reward;
pub mod store;

pub use checkpoint::{CheckpointStore, FsCheckpointStore, InMemoryCheckpointStore};
pub use environment::{
    ActionShape, Adjustment, BalanceEnvironment, DiscreteAction, DiscreteBalanceEnvironment,
    EnvConfig, Environment, StepInfo, StepResult,
};
pub use error::{BalanceError, Result};
pub use generator::{AdjustmentMode, BalanceGenerator};
pub use manager::{PolicyHandle, PolicyManager};
pub use policy::{Policy, PolicyCheckpoint, PolicyConfig, TrainingStats};
pub use reward::{RewardBreakdown, RewardModel, RewardWeights};
pub use store::{BalanceStore, InMemoryBalanceStore};
