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

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use rdkafka::{
    Message,
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    config::KafkaConfig,
    dispatcher::{Dispatched, EventDispatcher},
};

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs the single sequential consumption loop until `shutdown` flips to true.
///
/// Every received message is committed once it has been handled, failed or not.
pub async fn run_consumer(
    kafka: KafkaConfig,
    dispatcher: Arc<EventDispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &kafka.bootstrap_servers)
        .set("group.id", &kafka.consumer_group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("topic.metadata.refresh.interval.ms", "1000")
        .create()
        .context("failed to create balance-service consumer")?;

    let topics = kafka.topics.all();
    consumer
        .subscribe(&topics)
        .context("failed to subscribe balance-service topics")?;
    info!(topics = ?topics, "balance-service subscribed");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let received = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            received = tokio::time::timeout(RECV_TIMEOUT, consumer.recv()) => received,
        };

        let message = match received {
            Err(_elapsed) => continue,
            Ok(Ok(message)) => message,
            Ok(Err(error)) => {
                warn!(?error, "balance-service kafka receive error");
                tokio::time::sleep(Duration::from_millis(300)).await;
                continue;
            }
        };

        let topic = message.topic().to_string();
        match message.payload() {
            None | Some([]) => debug!(topic = %topic, "skipping empty message"),
            Some(payload) => match dispatcher.dispatch(&topic, payload).await {
                Ok(Dispatched::Isolated { channel, error }) => {
                    debug!(topic = %topic, channel = ?channel, error = %error, "event isolated");
                }
                Ok(dispatched) => debug!(topic = %topic, result = ?dispatched, "event handled"),
                Err(handle_error) => {
                    error!(topic = %topic, error = %handle_error, "event handling failed");
                }
            },
        }

        if let Err(error) = consumer.commit_message(&message, CommitMode::Async) {
            warn!(topic = %topic, error = %error, "failed to commit kafka offset");
        }
    }

    info!("balance-service consumer stopped");
    Ok(())
}
