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

use balance_common::COMBAT_MATRIX_NAMES;
use balance_engine::{AdjustmentMode, PolicyConfig, RewardWeights};
use tracing::warn;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Comma-separated names, blanks dropped.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub balance_requests: String,
    pub item_naming: String,
    pub game_results: String,
}

impl TopicConfig {
    pub fn from_env() -> Self {
        Self {
            balance_requests: env_or("KAFKA_BALANCE_MATRIX_TOPIC", "balance-matrix-requests"),
            item_naming: env_or("KAFKA_TOPIC_ITEM_NAMING", "item-naming-requests"),
            game_results: env_or("KAFKA_GAME_RESULTS_TOPIC", "game-results"),
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [
            self.balance_requests.as_str(),
            self.item_naming.as_str(),
            self.game_results.as_str(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub consumer_group_id: String,
    pub topics: TopicConfig,
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    pub balance_matrices: String,
    pub game_results: String,
    pub items: String,
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub text_url: String,
    pub text_model: String,
    pub image_url: String,
    pub image_model: String,
    pub api_key: Option<String>,
    pub image_path: String,
    pub prompts_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub kafka: KafkaConfig,
    pub tables: TableConfig,
    pub inference: InferenceConfig,
    pub model_dir: String,
    pub policy: PolicyConfig,
    pub generation_timesteps: u64,
    pub ingest_timesteps: u64,
    pub adjustment_mode: AdjustmentMode,
    pub reward_weights: RewardWeights,
    /// Matrices trained from templates when an outcome's chat has none stored.
    pub default_matrices: Vec<String>,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let policy = env_optional("BALANCE_POLICY_CONFIG_PATH")
            .and_then(|path| PolicyConfig::from_yaml_file(&path))
            .unwrap_or_default();

        let reward_weights = env_optional("BALANCE_REWARD_WEIGHTS_PATH")
            .and_then(|path| RewardWeights::from_yaml_file(&path))
            .unwrap_or_default();

        let default_matrices = env_optional("BALANCE_DEFAULT_MATRICES")
            .map(|raw| split_list(&raw))
            .filter(|names| !names.is_empty())
            .unwrap_or_else(|| COMBAT_MATRIX_NAMES.iter().map(|n| n.to_string()).collect());

        let adjustment_mode = match env_optional("BALANCE_ADJUSTMENT_MODE") {
            Some(raw) => raw.parse::<AdjustmentMode>().unwrap_or_else(|error| {
                warn!(error = %error, "falling back to continuous adjustment mode");
                AdjustmentMode::Continuous
            }),
            None => AdjustmentMode::Continuous,
        };

        Self {
            kafka: KafkaConfig {
                bootstrap_servers: env_or("KAFKA_BOOTSTRAP_SERVERS", "kafka:9092"),
                consumer_group_id: env_or("BALANCE_CONSUMER_GROUP_ID", "balance-processing-group"),
                topics: TopicConfig::from_env(),
            },
            tables: TableConfig {
                balance_matrices: env_or("BALANCE_MATRICES_TABLE", "balance_matrices"),
                game_results: env_or("GAME_RESULTS_TABLE", "game_results"),
                items: env_or("ITEMS_TABLE", "items"),
            },
            inference: InferenceConfig {
                text_url: env_or(
                    "INFERENCE_TEXT_URL",
                    "http://llm:8080/v1/chat/completions",
                ),
                text_model: env_or("INFERENCE_TEXT_MODEL", "llama-3-fantasy-writer-8b"),
                image_url: env_or(
                    "INFERENCE_IMAGE_URL",
                    "https://router.huggingface.co/hf-inference/models",
                ),
                image_model: env_or(
                    "INFERENCE_IMAGE_MODEL",
                    "proximasanfinetuning/fantassified_icons_v2",
                ),
                api_key: env_optional("HF_API_KEY"),
                image_path: env_or("IMAGE_PATH", "./images"),
                prompts_path: env_optional("ITEM_NAMING_PROMPTS_PATH"),
            },
            model_dir: env_or("BALANCE_MODEL_DIR", "./models"),
            policy,
            generation_timesteps: env_u64(
                "BALANCE_GENERATION_TRAIN_TIMESTEPS",
                balance_engine::generator::DEFAULT_GENERATION_TIMESTEPS,
            ),
            ingest_timesteps: env_u64(
                "BALANCE_INGEST_TRAIN_TIMESTEPS",
                balance_engine::manager::DEFAULT_INGEST_TIMESTEPS,
            ),
            adjustment_mode,
            reward_weights,
            default_matrices,
        }
    }

    /// DynamoDB is used when an endpoint or region is configured.
    pub fn dynamo_enabled() -> bool {
        std::env::var("DYNAMODB_ENDPOINT").is_ok() || std::env::var("AWS_REGION").is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variables_fall_back_to_defaults() {
        assert_eq!(env_or("BALANCE_CONFIG_SURELY_UNSET", "kafka:9092"), "kafka:9092");
        assert_eq!(env_u64("BALANCE_CONFIG_SURELY_UNSET", 2000), 2000);
        assert_eq!(env_optional("BALANCE_CONFIG_SURELY_UNSET"), None);
    }

    #[test]
    fn topics_are_listed_in_subscription_order() {
        let topics = TopicConfig {
            balance_requests: "a".to_string(),
            item_naming: "b".to_string(),
            game_results: "c".to_string(),
        };
        assert_eq!(topics.all(), ["a", "b", "c"]);
    }

    #[test]
    fn matrix_lists_split_on_commas() {
        assert_eq!(
            split_list(" player_attack, ,loot_attr ,"),
            vec!["player_attack".to_string(), "loot_attr".to_string()]
        );
        assert!(split_list(" , ").is_empty());
    }
}
