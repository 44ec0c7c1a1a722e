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

use balance_common::{ChatId, MatrixSpace, OutcomeRecord, ValidationError, ValueRange, check_shape};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::environment::{BalanceEnvironment, DiscreteAction, DiscreteBalanceEnvironment, Environment};
use crate::error::Result;
use crate::manager::PolicyManager;
use crate::store::BalanceStore;

pub const DEFAULT_GENERATION_TIMESTEPS: u64 = 2000;
const MIN_ADJUSTMENT_STEPS: usize = 10;

/// How the policy's output is applied while generating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentMode {
    #[default]
    Continuous,
    Discrete,
}

impl std::str::FromStr for AdjustmentMode {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "continuous" => Ok(AdjustmentMode::Continuous),
            "discrete" => Ok(AdjustmentMode::Discrete),
            other => Err(format!("unknown adjustment mode `{other}`")),
        }
    }
}

/// Produces balance matrices: template or random fill, then a short policy-driven
/// adjustment pass.
pub struct BalanceGenerator {
    store: Arc<dyn BalanceStore>,
    policies: Arc<PolicyManager>,
    mode: AdjustmentMode,
    train_timesteps: u64,
}

impl BalanceGenerator {
    pub fn new(store: Arc<dyn BalanceStore>, policies: Arc<PolicyManager>) -> Self {
        Self {
            store,
            policies,
            mode: AdjustmentMode::default(),
            train_timesteps: DEFAULT_GENERATION_TIMESTEPS,
        }
    }

    pub fn with_mode(mut self, mode: AdjustmentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_train_timesteps(mut self, timesteps: u64) -> Self {
        self.train_timesteps = timesteps;
        self
    }

    pub async fn generate(
        &self,
        chat_id: ChatId,
        matrix_name: &str,
        rows: usize,
        cols: usize,
    ) -> Result<MatrixSpace> {
        check_shape(rows, cols)?;

        // Zero cells are decided on the raw rows; clamping would turn them into 0.7.
        let template = match self.store.load_template_matrix(matrix_name).await {
            Ok(Some(raw)) => match MatrixSpace::from_rows_clamped(matrix_name, &raw, ValueRange::ADJUSTMENT) {
                Ok(_) => Some(raw),
                Err(error) => {
                    warn!(matrix = %matrix_name, error = %error, "ignoring unusable template");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(matrix = %matrix_name, error = %format!("{error:#}"), "failed to load template; generating without it");
                None
            }
        };

        let outcomes = match self.store.load_outcomes(chat_id).await {
            Ok(outcomes) => outcomes,
            Err(error) => {
                warn!(chat_id, error = %format!("{error:#}"), "failed to load outcomes; using an empty batch");
                Vec::new()
            }
        };

        let base = seed_matrix(matrix_name, rows, cols, template.as_deref(), &mut rand::rng())?;
        debug!(
            chat_id,
            matrix = %matrix_name,
            rows,
            cols,
            has_template = template.is_some(),
            outcomes = outcomes.len(),
            "generating balance matrix"
        );

        match self.adjust(matrix_name, base.clone(), outcomes).await {
            Ok(adjusted) => {
                info!(chat_id, matrix = %matrix_name, mean = adjusted.mean(), "balance matrix generated");
                Ok(adjusted)
            }
            Err(error) => {
                warn!(chat_id, matrix = %matrix_name, error = %error, "policy adjustment failed; using unadjusted matrix");
                Ok(base)
            }
        }
    }

    async fn adjust(
        &self,
        name: &str,
        base: MatrixSpace,
        outcomes: Vec<OutcomeRecord>,
    ) -> Result<MatrixSpace> {
        let outcomes: Arc<[OutcomeRecord]> = outcomes.into();
        let reward_model = self.policies.reward_model();
        let env_config = self.policies.env_config();
        let steps = adjustment_steps(base.rows(), base.cols());

        let mut env = BalanceEnvironment::new(base.clone(), outcomes.clone(), reward_model, env_config);
        self.policies.get_or_create(name, &env).await?;
        self.policies
            .train_increment(name, env.clone(), self.train_timesteps)
            .await?;

        match self.mode {
            AdjustmentMode::Continuous => {
                env.reset();
                for _ in 0..steps {
                    let action = self.policies.predict(name, env.working(), true).await?;
                    if env.step(&action)?.done {
                        break;
                    }
                }
                Ok(env.into_working())
            }
            AdjustmentMode::Discrete => {
                let mut env = DiscreteBalanceEnvironment::new(base, outcomes, reward_model, env_config);
                env.reset();
                for _ in 0..steps {
                    let (row, col) = env.focus_cell();
                    let action = self.policies.predict(name, env.working(), true).await?;
                    let signal = action.get(row, col).unwrap_or(0.0);
                    if env.step(&DiscreteAction::from_signal(signal))?.done {
                        break;
                    }
                }
                Ok(env.into_working())
            }
        }
    }
}

/// `max(10, floor(sqrt(rows * cols)))`.
pub fn adjustment_steps(rows: usize, cols: usize) -> usize {
    ((rows * cols) as f64).sqrt().floor().max(MIN_ADJUSTMENT_STEPS as f64) as usize
}

/// Raw template value (clamped into the adjustment range) where the template
/// covers the cell with a finite non-zero value, uniform random elsewhere.
fn seed_matrix<R: Rng + ?Sized>(
    name: &str,
    rows: usize,
    cols: usize,
    template: Option<&[Vec<f64>]>,
    rng: &mut R,
) -> std::result::Result<MatrixSpace, ValidationError> {
    let range = ValueRange::ADJUSTMENT;
    let mut matrix = MatrixSpace::random(name, rows, cols, range, rng)?;
    let Some(template) = template else {
        return Ok(matrix);
    };
    for (row, values) in template.iter().take(rows).enumerate() {
        for (col, &value) in values.iter().take(cols).enumerate() {
            if value.is_finite() && value != 0.0 {
                matrix.set(row, col, range.clamp(value))?;
            }
        }
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::policy::PolicyConfig;
    use crate::store::InMemoryBalanceStore;
    use balance_common::WeightVector;
    use rand::{SeedableRng, rngs::StdRng};
    use tokio::sync::watch;

    struct Fixture {
        _shutdown: watch::Sender<bool>,
        store: Arc<InMemoryBalanceStore>,
        generator: BalanceGenerator,
    }

    fn fixture(mode: AdjustmentMode, cancelled: bool) -> Fixture {
        let (tx, rx) = watch::channel(cancelled);
        let store = Arc::new(InMemoryBalanceStore::new());
        let policies = Arc::new(PolicyManager::new(
            PolicyConfig::tiny(),
            Arc::new(InMemoryCheckpointStore::new()),
            rx,
        ));
        let generator = BalanceGenerator::new(store.clone(), policies)
            .with_mode(mode)
            .with_train_timesteps(16);
        Fixture {
            _shutdown: tx,
            store,
            generator,
        }
    }

    #[test]
    fn adjustment_steps_have_a_floor_of_ten() {
        assert_eq!(adjustment_steps(2, 2), 10);
        assert_eq!(adjustment_steps(10, 10), 10);
        assert_eq!(adjustment_steps(12, 13), 12);
    }

    #[test]
    fn seed_matrix_keeps_usable_template_cells() {
        let template = vec![vec![1.1, 0.0, 4.0]];
        let mut rng = StdRng::seed_from_u64(4);
        let matrix = seed_matrix("player_attack", 2, 3, Some(&template), &mut rng).unwrap();
        assert_eq!(matrix.get(0, 0), Some(1.1));
        assert_eq!(matrix.get(0, 2), Some(1.3));
        assert_ne!(matrix.get(0, 1), Some(0.0));
        assert!(matrix.values().iter().all(|v| (0.7..=1.3).contains(v)));
    }

    #[tokio::test]
    async fn zero_template_cells_are_drawn_at_random() {
        let fixture = fixture(AdjustmentMode::Continuous, true);
        fixture
            .store
            .insert_template("player_attack", vec![vec![0.0, 1.0]])
            .unwrap();
        let mut zero_cells = Vec::new();
        for _ in 0..5 {
            let matrix = fixture
                .generator
                .generate(5, "player_attack", 1, 2)
                .await
                .unwrap();
            assert_eq!(matrix.get(0, 1), Some(1.0));
            zero_cells.push(matrix.get(0, 0).unwrap());
        }
        assert!(zero_cells.iter().all(|v| (0.7..=1.3).contains(v)));
        assert!(zero_cells.iter().any(|v| *v != 0.7));
    }

    #[tokio::test]
    async fn generated_matrices_have_requested_shape_and_bounds() {
        let fixture = fixture(AdjustmentMode::Continuous, false);
        for (rows, cols) in [(1, 1), (2, 5), (7, 3)] {
            let matrix = fixture
                .generator
                .generate(1, "monster_attack", rows, cols)
                .await
                .unwrap();
            assert_eq!(matrix.shape(), (rows, cols));
            assert!(matrix.values().iter().all(|v| (0.7..=1.3).contains(v)));
        }
    }

    #[tokio::test]
    async fn zero_dimensions_are_rejected() {
        let fixture = fixture(AdjustmentMode::Continuous, false);
        assert!(matches!(
            fixture.generator.generate(1, "player_attack", 0, 3).await,
            Err(crate::BalanceError::Validation(ValidationError::EmptyShape { .. }))
        ));
    }

    #[tokio::test]
    async fn oversized_dimensions_are_rejected_before_allocating() {
        let fixture = fixture(AdjustmentMode::Continuous, false);
        let huge = 1usize << 33;
        assert!(matches!(
            fixture.generator.generate(1, "player_attack", huge, huge).await,
            Err(crate::BalanceError::Validation(ValidationError::TooManyCells { .. }))
        ));
        assert!(matches!(
            fixture.generator.generate(1, "player_attack", 100, 100).await,
            Err(crate::BalanceError::Validation(ValidationError::TooManyCells { .. }))
        ));
    }

    #[tokio::test]
    async fn all_ones_template_barely_drifts() {
        let fixture = fixture(AdjustmentMode::Continuous, false);
        fixture
            .store
            .insert_template("player_attack", vec![vec![1.0, 1.0], vec![1.0, 1.0]])
            .unwrap();
        let matrix = fixture
            .generator
            .generate(5, "player_attack", 2, 2)
            .await
            .unwrap();
        assert!(matrix.values().iter().all(|v| (v - 1.0).abs() < 0.01));
        assert!(matrix.values().iter().all(|v| (0.7..=1.3).contains(v)));
    }

    #[tokio::test]
    async fn out_of_range_template_is_clamped_on_load() {
        let fixture = fixture(AdjustmentMode::Continuous, true);
        fixture
            .store
            .insert_template("player_attack", vec![vec![5.0, 0.2], vec![1.0, 1.0]])
            .unwrap();
        let matrix = fixture
            .generator
            .generate(5, "player_attack", 2, 2)
            .await
            .unwrap();
        assert_eq!(matrix.to_rows(), vec![vec![1.3, 0.7], vec![1.0, 1.0]]);
    }

    #[tokio::test]
    async fn failed_adjustment_falls_back_to_seed_matrix() {
        let fixture = fixture(AdjustmentMode::Continuous, true);
        fixture
            .store
            .insert_template("monster_attack", vec![vec![0.9, 1.2]])
            .unwrap();
        let matrix = fixture
            .generator
            .generate(5, "monster_attack", 1, 2)
            .await
            .unwrap();
        assert_eq!(matrix.to_rows(), vec![vec![0.9, 1.2]]);
    }

    #[tokio::test]
    async fn discrete_mode_moves_at_most_one_cell_per_step() {
        let fixture = fixture(AdjustmentMode::Discrete, false);
        fixture
            .store
            .insert_template("weapon_attr", vec![vec![1.0; 3]; 3])
            .unwrap();
        let mut record = OutcomeRecord::new(8);
        record.player_weight_trajectory = vec![WeightVector::new(vec![1.0])];
        fixture.store.save_outcome(&record).await.unwrap();

        let matrix = fixture.generator.generate(8, "weapon_attr", 3, 3).await.unwrap();
        let total_drift: f64 = matrix.values().iter().map(|v| (v - 1.0).abs()).sum();
        assert!(total_drift <= adjustment_steps(3, 3) as f64 * 0.01 + 1e-9);
    }

    #[test]
    fn adjustment_mode_parses_from_env_strings() {
        assert_eq!("Discrete".parse::<AdjustmentMode>(), Ok(AdjustmentMode::Discrete));
        assert_eq!(" continuous ".parse::<AdjustmentMode>(), Ok(AdjustmentMode::Continuous));
        assert!("sideways".parse::<AdjustmentMode>().is_err());
    }
}
