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

mod config;
mod consumer;
mod dispatcher;
mod dynamo;
mod naming;

use std::sync::Arc;

use anyhow::Context;
use balance_engine::{
    BalanceGenerator, BalanceStore, EnvConfig, FsCheckpointStore, InMemoryBalanceStore,
    PolicyManager, RewardModel,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    config::ServiceConfig,
    dispatcher::EventDispatcher,
    dynamo::DynamoBalanceStore,
    naming::{HttpInferenceClient, ItemNamer, NamingPrompts},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "balance_service=debug,balance_engine=debug".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store: Arc<dyn BalanceStore> = if ServiceConfig::dynamo_enabled() {
        info!("using DynamoDB balance store");
        Arc::new(DynamoBalanceStore::from_env(config.tables.clone()).await)
    } else {
        warn!("DYNAMODB_ENDPOINT and AWS_REGION unset; using in-memory balance store");
        Arc::new(InMemoryBalanceStore::new())
    };

    let checkpoints = Arc::new(FsCheckpointStore::new(&config.model_dir));
    let policies = Arc::new(
        PolicyManager::new(config.policy.clone(), checkpoints, shutdown_rx.clone())
            .with_ingest_timesteps(config.ingest_timesteps)
            .with_environment(RewardModel::new(config.reward_weights), EnvConfig::default())
            .with_default_matrices(config.default_matrices.clone()),
    );
    let generator = Arc::new(
        BalanceGenerator::new(store.clone(), policies.clone())
            .with_mode(config.adjustment_mode)
            .with_train_timesteps(config.generation_timesteps),
    );

    let prompts = config
        .inference
        .prompts_path
        .as_deref()
        .and_then(NamingPrompts::from_yaml_file)
        .unwrap_or_default();
    let namer = Arc::new(ItemNamer::new(
        Arc::new(HttpInferenceClient::new(&config.inference)),
        store.clone(),
        prompts,
        &config.inference.image_path,
    ));

    let dispatcher = Arc::new(EventDispatcher::new(
        config.kafka.topics.clone(),
        store,
        generator,
        policies,
        namer,
    ));

    let mut consumer = tokio::spawn(consumer::run_consumer(
        config.kafka.clone(),
        dispatcher,
        shutdown_rx,
    ));

    // A consumer that exits on its own takes the process down with it.
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
        }
        finished = &mut consumer => {
            return consumer_exit(finished);
        }
    }

    info!("balance-service shutting down");
    let _ = shutdown_tx.send(true);

    match consumer.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(error = %format!("{error:#}"), "balance consumer stopped with error"),
        Err(error) => warn!(error = %error, "balance consumer task failed"),
    }
    Ok(())
}

/// Turns an unrequested consumer exit into an error.
fn consumer_exit(
    finished: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match finished {
        Ok(Ok(())) => Err(anyhow::anyhow!("balance consumer exited unexpectedly")),
        Ok(Err(error)) => Err(error.context("balance consumer stopped")),
        Err(error) => Err(anyhow::Error::new(error).context("balance consumer task failed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consumer_exit_is_always_an_error() {
        let clean = tokio::spawn(async { Ok::<(), anyhow::Error>(()) }).await;
        assert!(consumer_exit(clean).is_err());

        let failed = tokio::spawn(async { Err::<(), _>(anyhow::anyhow!("broker gone")) }).await;
        let error = consumer_exit(failed).unwrap_err();
        assert!(format!("{error:#}").contains("broker gone"));

        let panicked = tokio::spawn(async {
            if true {
                panic!("dispatch blew up");
            }
            Ok::<(), anyhow::Error>(())
        })
        .await;
        let error = consumer_exit(panicked).unwrap_err();
        assert!(format!("{error:#}").contains("balance consumer task failed"));
    }

    #[tokio::test]
    async fn a_dead_consumer_ends_the_wait_before_any_signal() {
        let mut consumer = tokio::spawn(async { Err::<(), _>(anyhow::anyhow!("stream closed")) });
        let outcome = tokio::select! {
            _ = std::future::pending::<()>() => None,
            finished = &mut consumer => Some(consumer_exit(finished)),
        };
        assert!(matches!(outcome, Some(Err(_))));
    }
}
