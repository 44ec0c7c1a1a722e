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

use balance_common::{ChatId, ItemNamingRequest, MatrixSpace, OutcomeRecord, ValueRange};
use balance_engine::{BalanceError, BalanceGenerator, BalanceStore, PolicyManager};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::TopicConfig;
use crate::naming::ItemNamer;

/// Logical stream an event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    BalanceRequest,
    ItemNaming,
    OutcomeIngest,
}

/// What happens to a handler failure on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and move on to the next event.
    Isolate,
    /// Hand the error back to the consumer loop.
    Propagate,
}

impl Channel {
    pub const fn failure_policy(self) -> FailurePolicy {
        match self {
            Channel::BalanceRequest => FailurePolicy::Isolate,
            Channel::ItemNaming => FailurePolicy::Isolate,
            Channel::OutcomeIngest => FailurePolicy::Propagate,
        }
    }

    pub fn for_topic(topic: &str, topics: &TopicConfig) -> Option<Self> {
        if topic == topics.balance_requests {
            Some(Channel::BalanceRequest)
        } else if topic == topics.item_naming {
            Some(Channel::ItemNaming)
        } else if topic == topics.game_results {
            Some(Channel::OutcomeIngest)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceReport {
    pub chat_id: ChatId,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Balance(BalanceReport),
    ItemNamed { item_id: String, name: String },
    OutcomeIngested { chat_id: ChatId, trained: Vec<String> },
    /// Handler failed on a channel that isolates failures.
    Isolated { channel: Channel, error: String },
    /// No channel is configured for the topic.
    Ignored,
}

struct MatrixJob {
    name: String,
    rows: usize,
    cols: usize,
}

pub struct EventDispatcher {
    topics: TopicConfig,
    store: Arc<dyn BalanceStore>,
    generator: Arc<BalanceGenerator>,
    policies: Arc<PolicyManager>,
    namer: Arc<ItemNamer>,
}

impl EventDispatcher {
    pub fn new(
        topics: TopicConfig,
        store: Arc<dyn BalanceStore>,
        generator: Arc<BalanceGenerator>,
        policies: Arc<PolicyManager>,
        namer: Arc<ItemNamer>,
    ) -> Self {
        Self {
            topics,
            store,
            generator,
            policies,
            namer,
        }
    }

    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<Dispatched, BalanceError> {
        let Some(channel) = Channel::for_topic(topic, &self.topics) else {
            warn!(topic = %topic, "no handler registered for topic");
            return Ok(Dispatched::Ignored);
        };

        let outcome = match channel {
            Channel::BalanceRequest => self.handle_balance_request(payload).await.map(Dispatched::Balance),
            Channel::ItemNaming => self.handle_item_naming(payload).await,
            Channel::OutcomeIngest => self.handle_outcome(payload).await,
        };

        match (outcome, channel.failure_policy()) {
            (Ok(dispatched), _) => Ok(dispatched),
            (Err(error), FailurePolicy::Isolate) => {
                warn!(topic = %topic, channel = ?channel, error = %error, "event handling failed; skipping event");
                Ok(Dispatched::Isolated {
                    channel,
                    error: error.to_string(),
                })
            }
            (Err(error), FailurePolicy::Propagate) => Err(error),
        }
    }

    async fn handle_balance_request(&self, payload: &[u8]) -> Result<BalanceReport, BalanceError> {
        let value: Value = serde_json::from_slice(payload)?;
        let chat_id = chat_id_of(&value).ok_or(BalanceError::MissingField("chatId"))?;
        let mut report = BalanceReport {
            chat_id,
            ..BalanceReport::default()
        };

        match value.get("requests") {
            Some(Value::Array(requests)) => {
                for (index, entry) in requests.iter().enumerate() {
                    let label = entry
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("#{index}"));
                    match matrix_job(entry) {
                        Ok(job) => self.run_job(chat_id, job, &mut report).await,
                        Err(error) => {
                            warn!(chat_id, request = %label, error = %error, "skipping balance sub-request");
                            report.skipped.push(label);
                        }
                    }
                }
            }
            Some(_) => return Err(BalanceError::Decode("`requests` must be an array".to_string())),
            None => {
                let job = self.legacy_job(&value).await?;
                self.run_job(chat_id, job, &mut report).await;
            }
        }

        match self.store.load_all_matrices_for_chat(chat_id).await {
            Ok(matrices) => info!(
                chat_id,
                completed = report.completed.len(),
                skipped = report.skipped.len(),
                matrices = matrices.len(),
                "balance request processed"
            ),
            Err(error) => warn!(chat_id, error = %format!("{error:#}"), "failed to count matrices for chat"),
        }
        Ok(report)
    }

    /// Single-matrix form `{chatId, name, database}`: dimensions come from the template.
    async fn legacy_job(&self, value: &Value) -> Result<MatrixJob, BalanceError> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or(BalanceError::MissingField("name"))?;
        let rows = self
            .store
            .load_template_matrix(name)
            .await
            .map_err(BalanceError::persistence)?
            .ok_or(BalanceError::MissingField("template"))?;
        let template = MatrixSpace::from_rows_clamped(name, &rows, ValueRange::ADJUSTMENT)?;
        Ok(MatrixJob {
            name: name.to_string(),
            rows: template.rows(),
            cols: template.cols(),
        })
    }

    async fn run_job(&self, chat_id: ChatId, job: MatrixJob, report: &mut BalanceReport) {
        let matrix = match self.generator.generate(chat_id, &job.name, job.rows, job.cols).await {
            Ok(matrix) => matrix,
            Err(error) => {
                warn!(chat_id, matrix = %job.name, error = %error, "balance generation failed");
                report.skipped.push(job.name);
                return;
            }
        };
        match self.store.save_balance_matrix(chat_id, &job.name, &matrix).await {
            Ok(()) => {
                debug!(chat_id, matrix = %job.name, rows = job.rows, cols = job.cols, "balance matrix saved");
                report.completed.push(job.name);
            }
            Err(error) => {
                warn!(chat_id, matrix = %job.name, error = %format!("{error:#}"), "failed to save balance matrix");
                report.skipped.push(job.name);
            }
        }
    }

    async fn handle_item_naming(&self, payload: &[u8]) -> Result<Dispatched, BalanceError> {
        let request: ItemNamingRequest = serde_json::from_slice(payload)?;
        let name = self.namer.handle(&request).await?;
        Ok(Dispatched::ItemNamed {
            item_id: request.id,
            name,
        })
    }

    async fn handle_outcome(&self, payload: &[u8]) -> Result<Dispatched, BalanceError> {
        let value: Value = serde_json::from_slice(payload)?;
        if chat_id_of(&value).is_none() {
            return Err(BalanceError::MissingField("chat_id"));
        }
        let record: OutcomeRecord = serde_json::from_value(value)?;

        self.store
            .save_outcome(&record)
            .await
            .map_err(BalanceError::persistence)?;
        let trained = self
            .policies
            .train_on_outcome(&record, self.store.as_ref())
            .await?;
        Ok(Dispatched::OutcomeIngested {
            chat_id: record.chat_id,
            trained,
        })
    }
}

fn chat_id_of(value: &Value) -> Option<ChatId> {
    value
        .get("chatId")
        .or_else(|| value.get("chat_id"))
        .and_then(Value::as_i64)
}

fn matrix_job(entry: &Value) -> Result<MatrixJob, BalanceError> {
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .ok_or(BalanceError::MissingField("name"))?;
    let dimension = |key: &'static str| {
        entry
            .get(key)
            .and_then(Value::as_u64)
            .map(|value| usize::try_from(value).unwrap_or(usize::MAX))
            .ok_or(BalanceError::MissingField(key))
    };
    Ok(MatrixJob {
        name: name.to_string(),
        rows: dimension("rows")?,
        cols: dimension("cols")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::{InferenceClient, NamingPrompts};
    use async_trait::async_trait;
    use balance_engine::{InMemoryBalanceStore, InMemoryCheckpointStore, PolicyConfig};
    use serde_json::json;
    use tokio::sync::watch;

    struct FixedInference;

    #[async_trait]
    impl InferenceClient for FixedInference {
        async fn complete(&self, _: &str, _: &str, _: f32, _: u32) -> anyhow::Result<String> {
            Ok("Moonlit Dagger".to_string())
        }

        async fn synthesize_image(&self, _prompt: &str) -> anyhow::Result<Vec<u8>> {
            Err(anyhow::anyhow!("no image backend in tests"))
        }
    }

    struct Fixture {
        _shutdown: watch::Sender<bool>,
        store: Arc<InMemoryBalanceStore>,
        dispatcher: EventDispatcher,
    }

    fn topics() -> TopicConfig {
        TopicConfig {
            balance_requests: "balance".to_string(),
            item_naming: "naming".to_string(),
            game_results: "results".to_string(),
        }
    }

    fn fixture() -> Fixture {
        let (tx, rx) = watch::channel(false);
        let store = Arc::new(InMemoryBalanceStore::new());
        let config = PolicyConfig {
            rollout_len: 8,
            batch_size: 8,
            n_epochs: 1,
            hidden_sizes: vec![4],
            seed: Some(1),
            ..PolicyConfig::default()
        };
        let policies = Arc::new(
            PolicyManager::new(config, Arc::new(InMemoryCheckpointStore::new()), rx)
                .with_ingest_timesteps(8),
        );
        let generator = Arc::new(
            BalanceGenerator::new(store.clone(), policies.clone()).with_train_timesteps(8),
        );
        let namer = Arc::new(ItemNamer::new(
            Arc::new(FixedInference),
            store.clone(),
            NamingPrompts::default(),
            std::env::temp_dir().join("balance-dispatcher-tests"),
        ));
        let dispatcher = EventDispatcher::new(topics(), store.clone(), generator, policies, namer);
        Fixture {
            _shutdown: tx,
            store,
            dispatcher,
        }
    }

    fn bytes(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn failure_policy_table() {
        assert_eq!(Channel::BalanceRequest.failure_policy(), FailurePolicy::Isolate);
        assert_eq!(Channel::ItemNaming.failure_policy(), FailurePolicy::Isolate);
        assert_eq!(Channel::OutcomeIngest.failure_policy(), FailurePolicy::Propagate);
        assert_eq!(Channel::for_topic("results", &topics()), Some(Channel::OutcomeIngest));
        assert_eq!(Channel::for_topic("other", &topics()), None);
    }

    #[tokio::test]
    async fn bad_sub_request_does_not_stop_its_siblings() {
        let fixture = fixture();
        let payload = bytes(json!({
            "chatId": 77,
            "requests": [
                {"name": "player_attack", "rows": 2, "cols": 3},
                {"name": "monster_attack", "rows": 2},
                {"name": "loot_attr", "rows": 1, "cols": 4},
            ]
        }));

        let dispatched = fixture.dispatcher.dispatch("balance", &payload).await.unwrap();
        let Dispatched::Balance(report) = dispatched else {
            panic!("expected a balance report");
        };
        assert_eq!(report.completed, vec!["player_attack", "loot_attr"]);
        assert_eq!(report.skipped, vec!["monster_attack"]);

        let stored = fixture.store.load_all_matrices_for_chat(77).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored["player_attack"].len(), 2);
        assert_eq!(stored["player_attack"][0].len(), 3);
        assert_eq!(stored["loot_attr"][0].len(), 4);
    }

    #[tokio::test]
    async fn zero_sized_sub_request_is_skipped() {
        let fixture = fixture();
        let payload = bytes(json!({"chatId": 3, "requests": [{"name": "player_attack", "rows": 0, "cols": 2}]}));
        let Dispatched::Balance(report) = fixture.dispatcher.dispatch("balance", &payload).await.unwrap() else {
            panic!("expected a balance report");
        };
        assert!(report.completed.is_empty());
        assert_eq!(report.skipped, vec!["player_attack"]);
    }

    #[tokio::test]
    async fn oversized_sub_requests_are_skipped_next_to_valid_ones() {
        let fixture = fixture();
        let payload = bytes(json!({
            "chatId": 12,
            "requests": [
                {"name": "player_attack", "rows": 8589934592u64, "cols": 8589934592u64},
                {"name": "monster_attack", "rows": 2, "cols": 2},
                {"name": "loot_attr", "rows": 100, "cols": 100},
            ]
        }));

        let Dispatched::Balance(report) = fixture.dispatcher.dispatch("balance", &payload).await.unwrap() else {
            panic!("expected a balance report");
        };
        assert_eq!(report.completed, vec!["monster_attack"]);
        assert_eq!(report.skipped, vec!["player_attack", "loot_attr"]);
        let stored = fixture.store.load_all_matrices_for_chat(12).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn legacy_request_takes_dimensions_from_template() {
        let fixture = fixture();
        fixture
            .store
            .insert_template("monster_attack", vec![vec![1.0; 3]; 4])
            .unwrap();
        let payload = bytes(json!({"chatId": 5, "name": "monster_attack", "database": "balance"}));
        fixture.dispatcher.dispatch("balance", &payload).await.unwrap();

        let stored = fixture.store.load_all_matrices_for_chat(5).await.unwrap();
        assert_eq!(stored["monster_attack"].len(), 4);
        assert_eq!(stored["monster_attack"][0].len(), 3);

        let missing = bytes(json!({"chatId": 5, "name": "player_attack", "database": "balance"}));
        let dispatched = fixture.dispatcher.dispatch("balance", &missing).await.unwrap();
        assert!(matches!(dispatched, Dispatched::Isolated { channel: Channel::BalanceRequest, .. }));
    }

    #[tokio::test]
    async fn malformed_events_are_isolated_or_propagated_per_channel() {
        let fixture = fixture();
        let dispatched = fixture.dispatcher.dispatch("balance", b"{not json").await.unwrap();
        assert!(matches!(dispatched, Dispatched::Isolated { .. }));

        let dispatched = fixture.dispatcher.dispatch("naming", b"[]").await.unwrap();
        assert!(matches!(dispatched, Dispatched::Isolated { channel: Channel::ItemNaming, .. }));

        let result = fixture.dispatcher.dispatch("results", b"{not json").await;
        assert!(matches!(result, Err(BalanceError::Decode(_))));

        let result = fixture.dispatcher.dispatch("results", &bytes(json!({"death": true}))).await;
        assert!(matches!(result, Err(BalanceError::MissingField("chat_id"))));
    }

    #[tokio::test]
    async fn outcome_is_saved_then_trained() {
        let fixture = fixture();
        fixture
            .store
            .insert_template("player_attack", vec![vec![1.0, 1.0]])
            .unwrap();
        let payload = bytes(json!({
            "chat_id": 42,
            "death": false,
            "playerWeightDynamic": [[1.0, 2.0], [1.5, 2.0]],
        }));

        let dispatched = fixture.dispatcher.dispatch("results", &payload).await.unwrap();
        assert_eq!(
            dispatched,
            Dispatched::OutcomeIngested {
                chat_id: 42,
                trained: vec!["player_attack".to_string()],
            }
        );
        assert_eq!(fixture.store.load_outcomes(42).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn item_naming_updates_the_item() {
        let fixture = fixture();
        let payload = bytes(json!({"chatId": 8, "id": "abc", "prompt": "a pale knife"}));
        let dispatched = fixture.dispatcher.dispatch("naming", &payload).await.unwrap();
        assert_eq!(
            dispatched,
            Dispatched::ItemNamed {
                item_id: "abc".to_string(),
                name: "Moonlit Dagger".to_string(),
            }
        );
        assert_eq!(fixture.store.item_name(8, "abc").as_deref(), Some("Moonlit Dagger"));
    }

    #[tokio::test]
    async fn unknown_topics_are_ignored() {
        let fixture = fixture();
        assert_eq!(
            fixture.dispatcher.dispatch("elsewhere", b"{}").await.unwrap(),
            Dispatched::Ignored
        );
    }
}
