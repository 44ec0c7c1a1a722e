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

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{Client as DynamoClient, types::AttributeValue};
use balance_common::{ChatId, MatrixSpace, OutcomeRecord, TEMPLATE_CHAT_KEY};
use balance_engine::BalanceStore;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::config::TableConfig;

type Item = HashMap<String, AttributeValue>;

/// DynamoDB-backed [`BalanceStore`].
///
/// - matrices: `chat_id` (S, chat id or `TEMPLATE`) + `name` (S), rows as JSON in `data`
/// - game results: `chat_id` (N) + `result_id` (S), record as JSON in `record`
/// - items: `chat_id` (N) + `item_id` (S)
pub struct DynamoBalanceStore {
    client: DynamoClient,
    tables: TableConfig,
}

impl DynamoBalanceStore {
    pub async fn from_env(tables: TableConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Ok(endpoint) = std::env::var("DYNAMODB_ENDPOINT") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self {
            client: DynamoClient::new(&config),
            tables,
        }
    }

    async fn load_matrix(&self, chat_key: &str, name: &str) -> anyhow::Result<Option<Vec<Vec<f64>>>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.tables.balance_matrices)
            .key("chat_id", AttributeValue::S(chat_key.to_string()))
            .key("name", AttributeValue::S(name.to_string()))
            .send()
            .await
            .with_context(|| format!("failed to get matrix {name} for {chat_key}"))?;
        output.item().map(matrix_rows).transpose()
    }

    async fn query_chat(&self, table: &str, chat_id: AttributeValue) -> anyhow::Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut start = None;
        loop {
            let output = self
                .client
                .query()
                .table_name(table)
                .key_condition_expression("chat_id = :chat_id")
                .expression_attribute_values(":chat_id", chat_id.clone())
                .set_exclusive_start_key(start)
                .send()
                .await
                .with_context(|| format!("failed to query {table}"))?;
            items.extend(output.items().iter().cloned());
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }
}

fn string_attr<'a>(item: &'a Item, key: &str) -> anyhow::Result<&'a str> {
    item.get(key)
        .and_then(|value| value.as_s().ok())
        .map(String::as_str)
        .with_context(|| format!("item is missing string attribute `{key}`"))
}

fn matrix_item(chat_key: &str, matrix: &MatrixSpace) -> anyhow::Result<Item> {
    let mut item = HashMap::new();
    item.insert("chat_id".to_string(), AttributeValue::S(chat_key.to_string()));
    item.insert("name".to_string(), AttributeValue::S(matrix.name().to_string()));
    item.insert(
        "data".to_string(),
        AttributeValue::S(serde_json::to_string(&matrix.to_rows())?),
    );
    item.insert("rows".to_string(), AttributeValue::N(matrix.rows().to_string()));
    item.insert("cols".to_string(), AttributeValue::N(matrix.cols().to_string()));
    item.insert(
        "updated_at".to_string(),
        AttributeValue::S(Utc::now().to_rfc3339()),
    );
    Ok(item)
}

fn matrix_rows(item: &Item) -> anyhow::Result<Vec<Vec<f64>>> {
    let data = string_attr(item, "data")?;
    serde_json::from_str(data).context("invalid matrix data")
}

fn outcome_item(record: &OutcomeRecord) -> anyhow::Result<Item> {
    let now = Utc::now();
    let mut item = HashMap::new();
    item.insert("chat_id".to_string(), AttributeValue::N(record.chat_id.to_string()));
    item.insert(
        "result_id".to_string(),
        AttributeValue::S(format!("{}-{}", now.timestamp_millis(), Uuid::new_v4())),
    );
    item.insert(
        "record".to_string(),
        AttributeValue::S(serde_json::to_string(record).context("failed to encode outcome")?),
    );
    item.insert("created_at".to_string(), AttributeValue::S(now.to_rfc3339()));
    Ok(item)
}

#[async_trait]
impl BalanceStore for DynamoBalanceStore {
    async fn load_template_matrix(&self, name: &str) -> anyhow::Result<Option<Vec<Vec<f64>>>> {
        self.load_matrix(TEMPLATE_CHAT_KEY, name).await
    }

    async fn save_balance_matrix(
        &self,
        chat_id: ChatId,
        name: &str,
        matrix: &MatrixSpace,
    ) -> anyhow::Result<()> {
        let mut item = matrix_item(&chat_id.to_string(), matrix)?;
        item.insert("name".to_string(), AttributeValue::S(name.to_string()));
        self.client
            .put_item()
            .table_name(&self.tables.balance_matrices)
            .set_item(Some(item))
            .send()
            .await
            .context("failed to put item into balance_matrices table")?;
        Ok(())
    }

    async fn load_outcomes(&self, chat_id: ChatId) -> anyhow::Result<Vec<OutcomeRecord>> {
        let items = self
            .query_chat(&self.tables.game_results, AttributeValue::N(chat_id.to_string()))
            .await?;
        let mut records = Vec::with_capacity(items.len());
        for item in &items {
            match string_attr(item, "record")
                .and_then(|raw| serde_json::from_str::<OutcomeRecord>(raw).map_err(Into::into))
            {
                Ok(record) => records.push(record),
                Err(error) => warn!(chat_id, error = %format!("{error:#}"), "skipping unreadable game result"),
            }
        }
        Ok(records)
    }

    async fn save_outcome(&self, record: &OutcomeRecord) -> anyhow::Result<()> {
        self.client
            .put_item()
            .table_name(&self.tables.game_results)
            .set_item(Some(outcome_item(record)?))
            .send()
            .await
            .context("failed to put item into game_results table")?;
        Ok(())
    }

    async fn load_all_matrices_for_chat(
        &self,
        chat_id: ChatId,
    ) -> anyhow::Result<BTreeMap<String, Vec<Vec<f64>>>> {
        let items = self
            .query_chat(&self.tables.balance_matrices, AttributeValue::S(chat_id.to_string()))
            .await?;
        let mut matrices = BTreeMap::new();
        for item in &items {
            let name = string_attr(item, "name")?;
            matrices.insert(name.to_string(), matrix_rows(item)?);
        }
        Ok(matrices)
    }

    async fn update_item_name(
        &self,
        chat_id: ChatId,
        item_id: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        self.client
            .update_item()
            .table_name(&self.tables.items)
            .key("chat_id", AttributeValue::N(chat_id.to_string()))
            .key("item_id", AttributeValue::S(item_id.to_string()))
            .update_expression("SET #name = :name, updated_at = :updated_at")
            .expression_attribute_names("#name", "name")
            .expression_attribute_values(":name", AttributeValue::S(name.to_string()))
            .expression_attribute_values(":updated_at", AttributeValue::S(Utc::now().to_rfc3339()))
            .send()
            .await
            .context("failed to update item name")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balance_common::ValueRange;

    #[test]
    fn matrix_items_round_trip_rows() {
        let rows = vec![vec![0.75, 1.25], vec![1.0, 1.1]];
        let matrix = MatrixSpace::from_rows("player_attack", &rows, ValueRange::ADJUSTMENT).unwrap();
        let item = matrix_item("TEMPLATE", &matrix).unwrap();
        assert_eq!(string_attr(&item, "chat_id").unwrap(), "TEMPLATE");
        assert_eq!(item.get("rows"), Some(&AttributeValue::N("2".to_string())));
        assert_eq!(matrix_rows(&item).unwrap(), rows);
    }

    #[test]
    fn outcome_items_are_keyed_by_numeric_chat() {
        let item = outcome_item(&OutcomeRecord::new(31)).unwrap();
        assert_eq!(item.get("chat_id"), Some(&AttributeValue::N("31".to_string())));
        let stored: OutcomeRecord = serde_json::from_str(string_attr(&item, "record").unwrap()).unwrap();
        assert_eq!(stored.chat_id, 31);
    }

    #[test]
    fn missing_data_attribute_is_an_error() {
        let item = Item::new();
        assert!(matrix_rows(&item).is_err());
    }
}
