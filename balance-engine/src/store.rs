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
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use balance_common::{ChatId, MatrixSpace, OutcomeRecord, TEMPLATE_CHAT_KEY};

/// Persistence collaborator for matrices, outcomes and item names.
///
/// Matrices are stored by `(chat key, name)` as nested rows; templates live
/// under the [`TEMPLATE_CHAT_KEY`] chat key.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn load_template_matrix(&self, name: &str) -> anyhow::Result<Option<Vec<Vec<f64>>>>;
    async fn save_balance_matrix(
        &self,
        chat_id: ChatId,
        name: &str,
        matrix: &MatrixSpace,
    ) -> anyhow::Result<()>;
    async fn load_outcomes(&self, chat_id: ChatId) -> anyhow::Result<Vec<OutcomeRecord>>;
    async fn save_outcome(&self, record: &OutcomeRecord) -> anyhow::Result<()>;
    async fn load_all_matrices_for_chat(
        &self,
        chat_id: ChatId,
    ) -> anyhow::Result<BTreeMap<String, Vec<Vec<f64>>>>;
    async fn update_item_name(
        &self,
        chat_id: ChatId,
        item_id: &str,
        name: &str,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    matrices: BTreeMap<(String, String), Vec<Vec<f64>>>,
    outcomes: HashMap<ChatId, Vec<OutcomeRecord>>,
    item_names: HashMap<(ChatId, String), String>,
}

/// Process-local store used for tests and for running without DynamoDB.
#[derive(Debug, Default)]
pub struct InMemoryBalanceStore {
    state: Mutex<MemoryState>,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> anyhow::Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("in-memory store poisoned"))?;
        Ok(f(&mut state))
    }

    pub fn insert_template(&self, name: &str, rows: Vec<Vec<f64>>) -> anyhow::Result<()> {
        self.with_state(|state| {
            state
                .matrices
                .insert((TEMPLATE_CHAT_KEY.to_string(), name.to_string()), rows);
        })
    }

    pub fn item_name(&self, chat_id: ChatId, item_id: &str) -> Option<String> {
        self.with_state(|state| state.item_names.get(&(chat_id, item_id.to_string())).cloned())
            .ok()
            .flatten()
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn load_template_matrix(&self, name: &str) -> anyhow::Result<Option<Vec<Vec<f64>>>> {
        self.with_state(|state| {
            state
                .matrices
                .get(&(TEMPLATE_CHAT_KEY.to_string(), name.to_string()))
                .cloned()
        })
    }

    async fn save_balance_matrix(
        &self,
        chat_id: ChatId,
        name: &str,
        matrix: &MatrixSpace,
    ) -> anyhow::Result<()> {
        self.with_state(|state| {
            state
                .matrices
                .insert((chat_id.to_string(), name.to_string()), matrix.to_rows());
        })
    }

    async fn load_outcomes(&self, chat_id: ChatId) -> anyhow::Result<Vec<OutcomeRecord>> {
        self.with_state(|state| state.outcomes.get(&chat_id).cloned().unwrap_or_default())
    }

    async fn save_outcome(&self, record: &OutcomeRecord) -> anyhow::Result<()> {
        self.with_state(|state| {
            state
                .outcomes
                .entry(record.chat_id)
                .or_default()
                .push(record.clone());
        })
    }

    async fn load_all_matrices_for_chat(
        &self,
        chat_id: ChatId,
    ) -> anyhow::Result<BTreeMap<String, Vec<Vec<f64>>>> {
        let chat_key = chat_id.to_string();
        self.with_state(|state| {
            state
                .matrices
                .iter()
                .filter(|((chat, _), _)| *chat == chat_key)
                .map(|((_, name), rows)| (name.clone(), rows.clone()))
                .collect()
        })
    }

    async fn update_item_name(
        &self,
        chat_id: ChatId,
        item_id: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        self.with_state(|state| {
            state
                .item_names
                .insert((chat_id, item_id.to_string()), name.to_string());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balance_common::ValueRange;

    #[tokio::test]
    async fn saved_matrix_loads_back_for_the_chat() {
        let store = InMemoryBalanceStore::new();
        let rows = vec![vec![0.8123456789, 1.2], vec![1.0, 0.7]];
        let matrix = MatrixSpace::from_rows("player_attack", &rows, ValueRange::ADJUSTMENT).unwrap();
        store.save_balance_matrix(17, "player_attack", &matrix).await.unwrap();

        let all = store.load_all_matrices_for_chat(17).await.unwrap();
        let loaded =
            MatrixSpace::from_rows("player_attack", &all["player_attack"], ValueRange::ADJUSTMENT)
                .unwrap();
        assert!(loaded.max_abs_diff(&matrix).unwrap() < 1e-12);
        assert!(store.load_all_matrices_for_chat(18).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn templates_are_kept_apart_from_chat_matrices() {
        let store = InMemoryBalanceStore::new();
        store
            .insert_template("monster_attack", vec![vec![1.0, 1.1]])
            .unwrap();
        assert_eq!(
            store.load_template_matrix("monster_attack").await.unwrap(),
            Some(vec![vec![1.0, 1.1]])
        );
        assert!(store.load_template_matrix("player_attack").await.unwrap().is_none());
        assert!(store.load_all_matrices_for_chat(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outcomes_accumulate_per_chat() {
        let store = InMemoryBalanceStore::new();
        store.save_outcome(&OutcomeRecord::new(4)).await.unwrap();
        store.save_outcome(&OutcomeRecord::new(4)).await.unwrap();
        store.save_outcome(&OutcomeRecord::new(5)).await.unwrap();
        assert_eq!(store.load_outcomes(4).await.unwrap().len(), 2);
        assert!(store.load_outcomes(6).await.unwrap().is_empty());
    }
}
