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

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use balance_common::{COMBAT_MATRIX_NAMES, MatrixSpace, OutcomeRecord, ValueRange};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::environment::{Adjustment, BalanceEnvironment, EnvConfig, Environment};
use crate::error::{BalanceError, Result};
use crate::policy::{Policy, PolicyConfig, TrainingStats};
use crate::reward::RewardModel;
use crate::store::BalanceStore;

pub const DEFAULT_INGEST_TIMESTEPS: u64 = 1000;

/// The process-wide slot for one matrix name's policy.
#[derive(Debug)]
pub struct PolicyHandle {
    name: String,
    slot: Arc<Mutex<Option<Policy>>>,
    initializations: AtomicU64,
    updates: AtomicU64,
    last_trained_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl PolicyHandle {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            slot: Arc::new(Mutex::new(None)),
            initializations: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            last_trained_at: std::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initializations(&self) -> u64 {
        self.initializations.load(Ordering::Relaxed)
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn last_trained_at(&self) -> Option<DateTime<Utc>> {
        self.last_trained_at.lock().ok().and_then(|at| *at)
    }

    /// Cumulative training timesteps, waiting for any running update.
    pub async fn timesteps(&self) -> Option<u64> {
        self.slot.lock().await.as_ref().map(Policy::timesteps)
    }

    fn mark_trained(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut at) = self.last_trained_at.lock() {
            *at = Some(Utc::now());
        }
    }
}

/// Registry of policies keyed by matrix name.
///
/// Every operation on one name runs inside that name's async mutex; different
/// names proceed in parallel. Callers that hit a busy name queue behind it.
pub struct PolicyManager {
    config: PolicyConfig,
    checkpoints: Arc<dyn CheckpointStore>,
    handles: Mutex<HashMap<String, Arc<PolicyHandle>>>,
    shutdown: watch::Receiver<bool>,
    reward_model: RewardModel,
    env_config: EnvConfig,
    ingest_timesteps: u64,
    default_matrices: Vec<String>,
}

impl PolicyManager {
    pub fn new(
        config: PolicyConfig,
        checkpoints: Arc<dyn CheckpointStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            checkpoints,
            handles: Mutex::new(HashMap::new()),
            shutdown,
            reward_model: RewardModel::default(),
            env_config: EnvConfig::default(),
            ingest_timesteps: DEFAULT_INGEST_TIMESTEPS,
            default_matrices: COMBAT_MATRIX_NAMES.iter().map(|n| n.to_string()).collect(),
        }
    }

    pub fn with_ingest_timesteps(mut self, timesteps: u64) -> Self {
        self.ingest_timesteps = timesteps;
        self
    }

    pub fn with_environment(mut self, reward_model: RewardModel, env_config: EnvConfig) -> Self {
        self.reward_model = reward_model;
        self.env_config = env_config;
        self
    }

    pub fn with_default_matrices(mut self, names: Vec<String>) -> Self {
        self.default_matrices = names;
        self
    }

    pub fn reward_model(&self) -> RewardModel {
        self.reward_model
    }

    pub fn env_config(&self) -> EnvConfig {
        self.env_config
    }

    async fn handle(&self, name: &str) -> Arc<PolicyHandle> {
        let mut handles = self.handles.lock().await;
        handles
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(PolicyHandle::new(name)))
            .clone()
    }

    pub async fn get_or_create(
        &self,
        name: &str,
        env: &BalanceEnvironment,
    ) -> Result<Arc<PolicyHandle>> {
        let handle = self.handle(name).await;
        let mut slot = handle.slot.lock().await;
        if slot.is_some() {
            drop(slot);
            return Ok(handle);
        }

        let policy = match self.checkpoints.load(name).await {
            Ok(Some(checkpoint)) => match Policy::from_checkpoint(checkpoint) {
                Ok(policy) => {
                    info!(
                        matrix = %name,
                        timesteps = policy.timesteps(),
                        "restored policy from checkpoint"
                    );
                    policy
                }
                Err(error) => {
                    error!(matrix = %name, error = %error, "failed to restore policy checkpoint");
                    return Err(error);
                }
            },
            Ok(None) => {
                let (rows, cols) = env.observation_shape();
                info!(matrix = %name, rows, cols, "initializing new policy");
                Policy::new(name, self.config.clone())
            }
            Err(error) => {
                error!(matrix = %name, error = %format!("{error:#}"), "failed to load policy checkpoint");
                return Err(BalanceError::persistence(error));
            }
        };

        *slot = Some(policy);
        handle.initializations.fetch_add(1, Ordering::Relaxed);
        drop(slot);
        Ok(handle)
    }

    /// Trains the named policy for `timesteps` steps and checkpoints it.
    ///
    /// The name's lock is held across the update and the save. A failed or
    /// cancelled update leaves the previous policy in place.
    pub async fn train_increment(
        &self,
        name: &str,
        env: BalanceEnvironment,
        timesteps: u64,
    ) -> Result<TrainingStats> {
        let handle = self.get_or_create(name, &env).await?;
        let guard = handle.slot.clone().lock_owned().await;
        let cancel = self.shutdown.clone();
        let task_name = name.to_string();
        let mut env = env;

        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = guard;
            let outcome = match guard.as_mut() {
                Some(policy) => {
                    let mut candidate = policy.clone();
                    candidate
                        .learn(&mut env, timesteps, &cancel)
                        .map(|stats| {
                            *policy = candidate;
                            stats
                        })
                }
                None => Err(BalanceError::model(&task_name, "policy slot is empty")),
            };
            (guard, outcome)
        })
        .await;

        let (guard, outcome) = joined.map_err(|error| {
            error!(matrix = %name, error = %error, "training task panicked");
            BalanceError::model(name, format!("training task failed: {error}"))
        })?;

        let stats = match outcome {
            Ok(stats) => stats,
            Err(error @ BalanceError::Cancelled(_)) => {
                warn!(matrix = %name, "policy update cancelled; keeping previous policy");
                return Err(error);
            }
            Err(error) => {
                error!(matrix = %name, timesteps, error = %error, "policy update failed");
                return Err(error);
            }
        };
        handle.mark_trained();

        match guard.as_ref() {
            Some(policy) => self.persist(name, policy).await?,
            None => return Err(BalanceError::model(name, "policy slot is empty")),
        }
        drop(guard);

        debug!(
            matrix = %name,
            timesteps = stats.timesteps,
            total_timesteps = stats.total_timesteps,
            mean_reward = stats.mean_reward,
            "policy trained and saved"
        );
        Ok(stats)
    }

    pub async fn predict(
        &self,
        name: &str,
        observation: &MatrixSpace,
        deterministic: bool,
    ) -> Result<Adjustment> {
        let handle = self
            .handles
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BalanceError::model(name, "policy has not been initialized"))?;
        let mut slot = handle.slot.lock().await;
        let policy = slot
            .as_mut()
            .ok_or_else(|| BalanceError::model(name, "policy has not been initialized"))?;
        Ok(policy.predict(observation, deterministic)?)
    }

    pub async fn save(&self, name: &str) -> Result<()> {
        let handle = self
            .handles
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BalanceError::model(name, "policy has not been initialized"))?;
        let slot = handle.slot.lock().await;
        match slot.as_ref() {
            Some(policy) => self.persist(name, policy).await,
            None => Err(BalanceError::model(name, "policy has not been initialized")),
        }
    }

    async fn persist(&self, name: &str, policy: &Policy) -> Result<()> {
        let checkpoint = policy.checkpoint();
        self.checkpoints
            .save(name, &checkpoint)
            .await
            .map_err(|error| {
                error!(matrix = %name, error = %format!("{error:#}"), "failed to save policy checkpoint");
                BalanceError::persistence(error)
            })
    }

    /// Feeds one outcome into every policy associated with its chat.
    ///
    /// Matrices come from the record itself, else from what the chat has
    /// stored, else from the templates of the default combat matrices.
    pub async fn train_on_outcome(
        &self,
        record: &OutcomeRecord,
        store: &dyn BalanceStore,
    ) -> Result<Vec<String>> {
        let outcomes: Arc<[OutcomeRecord]> = Arc::from(vec![record.clone()]);
        let mut trained = Vec::new();

        for matrix in self.associated_matrices(record, store).await? {
            let name = matrix.name().to_string();
            let env = BalanceEnvironment::new(
                matrix,
                outcomes.clone(),
                self.reward_model,
                self.env_config,
            );
            self.train_increment(&name, env, self.ingest_timesteps).await?;
            trained.push(name);
        }

        info!(chat_id = record.chat_id, matrices = ?trained, "policies updated from outcome");
        Ok(trained)
    }

    async fn associated_matrices(
        &self,
        record: &OutcomeRecord,
        store: &dyn BalanceStore,
    ) -> Result<Vec<MatrixSpace>> {
        let sources: BTreeMap<String, Vec<Vec<f64>>> = match &record.balance_matrices {
            Some(matrices) if !matrices.is_empty() => matrices.clone(),
            _ => {
                let stored = store
                    .load_all_matrices_for_chat(record.chat_id)
                    .await
                    .map_err(BalanceError::persistence)?;
                if stored.is_empty() {
                    self.default_templates(store).await?
                } else {
                    stored
                }
            }
        };

        let mut matrices = Vec::with_capacity(sources.len());
        for (name, rows) in sources {
            match MatrixSpace::from_rows_clamped(name.as_str(), &rows, ValueRange::infer(&rows)) {
                Ok(matrix) => matrices.push(matrix),
                Err(error) => {
                    warn!(chat_id = record.chat_id, matrix = %name, error = %error, "skipping unusable matrix");
                }
            }
        }
        Ok(matrices)
    }

    async fn default_templates(
        &self,
        store: &dyn BalanceStore,
    ) -> Result<BTreeMap<String, Vec<Vec<f64>>>> {
        let mut templates = BTreeMap::new();
        for name in &self.default_matrices {
            match store
                .load_template_matrix(name)
                .await
                .map_err(BalanceError::persistence)?
            {
                Some(rows) => {
                    templates.insert(name.clone(), rows);
                }
                None => debug!(matrix = %name, "no template stored; skipping"),
            }
        }
        Ok(templates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::policy::PolicyCheckpoint;
    use crate::store::InMemoryBalanceStore;
    use async_trait::async_trait;

    struct FailingCheckpointStore;

    #[async_trait]
    impl CheckpointStore for FailingCheckpointStore {
        async fn load(&self, _name: &str) -> anyhow::Result<Option<PolicyCheckpoint>> {
            Ok(None)
        }

        async fn save(&self, _name: &str, _checkpoint: &PolicyCheckpoint) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk full"))
        }
    }

    fn manager(checkpoints: Arc<dyn CheckpointStore>) -> (watch::Sender<bool>, PolicyManager) {
        let (tx, rx) = watch::channel(false);
        let manager = PolicyManager::new(PolicyConfig::tiny(), checkpoints, rx).with_ingest_timesteps(8);
        (tx, manager)
    }

    fn env(name: &str) -> BalanceEnvironment {
        let template = MatrixSpace::new(name, 2, 2, 1.0, ValueRange::ADJUSTMENT).unwrap();
        BalanceEnvironment::new(
            template,
            Vec::<OutcomeRecord>::new(),
            RewardModel::default(),
            EnvConfig::default(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_initializes_once() {
        let (_tx, manager) = manager(Arc::new(InMemoryCheckpointStore::new()));
        let manager = Arc::new(manager);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .get_or_create("player_attack", &env("player_attack"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(handles[0].initializations(), 1);
    }

    #[tokio::test]
    async fn training_checkpoints_and_continues_after_restart() {
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let (_tx, first) = manager(checkpoints.clone());
        first
            .train_increment("player_attack", env("player_attack"), 10)
            .await
            .unwrap();
        assert!(checkpoints.contains("player_attack"));

        let (_tx, second) = manager(checkpoints.clone());
        let stats = second
            .train_increment("player_attack", env("player_attack"), 6)
            .await
            .unwrap();
        assert_eq!(stats.total_timesteps, 16);
        let handle = second.get_or_create("player_attack", &env("player_attack")).await.unwrap();
        assert_eq!(handle.updates(), 1);
        assert!(handle.last_trained_at().is_some());
    }

    #[tokio::test]
    async fn same_name_updates_queue_instead_of_failing() {
        let (_tx, manager) = manager(Arc::new(InMemoryCheckpointStore::new()));
        let (a, b) = tokio::join!(
            manager.train_increment("monster_attack", env("monster_attack"), 8),
            manager.train_increment("monster_attack", env("monster_attack"), 8),
        );
        a.unwrap();
        b.unwrap();
        let handle = manager.get_or_create("monster_attack", &env("monster_attack")).await.unwrap();
        assert_eq!(handle.updates(), 2);
        assert_eq!(handle.timesteps().await, Some(16));
    }

    #[tokio::test]
    async fn cancelled_update_is_not_saved() {
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let (tx, manager) = manager(checkpoints.clone());
        tx.send(true).unwrap();

        let result = manager
            .train_increment("player_attack", env("player_attack"), 8)
            .await;
        assert!(matches!(result, Err(BalanceError::Cancelled(_))));
        assert!(!checkpoints.contains("player_attack"));
        let handle = manager.get_or_create("player_attack", &env("player_attack")).await.unwrap();
        assert_eq!(handle.timesteps().await, Some(0));
        assert_eq!(handle.updates(), 0);
    }

    #[tokio::test]
    async fn save_failures_surface_to_the_caller() {
        let (_tx, manager) = manager(Arc::new(FailingCheckpointStore));
        let result = manager
            .train_increment("player_attack", env("player_attack"), 4)
            .await;
        assert!(matches!(result, Err(BalanceError::Persistence(message)) if message.contains("disk full")));
        assert!(matches!(
            manager.save("player_attack").await,
            Err(BalanceError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn predict_requires_an_initialized_policy() {
        let (_tx, manager) = manager(Arc::new(InMemoryCheckpointStore::new()));
        let observation = env("player_attack").working().clone();
        assert!(matches!(
            manager.predict("player_attack", &observation, true).await,
            Err(BalanceError::Model { .. })
        ));

        manager.get_or_create("player_attack", &env("player_attack")).await.unwrap();
        let action = manager.predict("player_attack", &observation, true).await.unwrap();
        assert_eq!(action.shape(), (2, 2));
    }

    #[tokio::test]
    async fn outcome_training_prefers_matrices_on_the_record() {
        let (_tx, manager) = manager(Arc::new(InMemoryCheckpointStore::new()));
        let store = InMemoryBalanceStore::new();
        store.insert_template("player_attack", vec![vec![1.0]]).unwrap();

        let mut record = OutcomeRecord::new(9);
        record.balance_matrices = Some(BTreeMap::from([(
            "loot_attr".to_string(),
            vec![vec![3.0, 40.0], vec![12.0, 7.0]],
        )]));
        let trained = manager.train_on_outcome(&record, &store).await.unwrap();
        assert_eq!(trained, vec!["loot_attr".to_string()]);
    }

    #[tokio::test]
    async fn outcome_training_falls_back_to_chat_then_templates() {
        let (_tx, manager) = manager(Arc::new(InMemoryCheckpointStore::new()));
        let store = InMemoryBalanceStore::new();
        store.insert_template("monster_attack", vec![vec![1.0, 1.0]]).unwrap();

        let record = OutcomeRecord::new(9);
        let trained = manager.train_on_outcome(&record, &store).await.unwrap();
        assert_eq!(trained, vec!["monster_attack".to_string()]);

        let stored = MatrixSpace::new("player_attack", 1, 1, 1.1, ValueRange::ADJUSTMENT).unwrap();
        store.save_balance_matrix(9, "player_attack", &stored).await.unwrap();
        let trained = manager.train_on_outcome(&record, &store).await.unwrap();
        assert_eq!(trained, vec!["player_attack".to_string()]);
    }

    #[tokio::test]
    async fn configured_default_matrices_replace_the_combat_pair() {
        let (_tx, manager) = manager(Arc::new(InMemoryCheckpointStore::new()));
        let manager = manager.with_default_matrices(vec!["loot_attr".to_string()]);
        let store = InMemoryBalanceStore::new();
        store.insert_template("monster_attack", vec![vec![1.0, 1.0]]).unwrap();
        store.insert_template("loot_attr", vec![vec![4.0, 9.0]]).unwrap();

        let trained = manager.train_on_outcome(&OutcomeRecord::new(4), &store).await.unwrap();
        assert_eq!(trained, vec!["loot_attr".to_string()]);
    }

    #[test]
    fn environment_overrides_reach_new_environments() {
        let (_tx, manager) = manager(Arc::new(InMemoryCheckpointStore::new()));
        let weights = crate::RewardWeights {
            death_penalty: 1.0,
            ..crate::RewardWeights::default()
        };
        let env_config = EnvConfig {
            change_amount: 0.02,
            ..EnvConfig::default()
        };
        let manager = manager.with_environment(RewardModel::new(weights), env_config);
        assert_eq!(manager.reward_model().weights().death_penalty, 1.0);
        assert_eq!(manager.env_config().change_amount, 0.02);
    }
}
