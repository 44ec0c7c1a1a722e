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

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::policy::PolicyCheckpoint;

/// Durable home for trained policies, keyed by matrix name.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, name: &str) -> anyhow::Result<Option<PolicyCheckpoint>>;
    async fn save(&self, name: &str, checkpoint: &PolicyCheckpoint) -> anyhow::Result<()>;
}

/// Stores checkpoints as `{root}/trained_models/{name}.json`.
///
/// Names outside `[A-Za-z0-9_-]` are sanitized and suffixed with a short hash
/// of the raw name, so `a.b` and `a_b` land in different files.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    dir: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: model_dir.into().join("trained_models"),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if file == name {
            return self.dir.join(format!("{file}.json"));
        }
        let digest = Sha256::digest(name.as_bytes());
        let suffix: String = digest[..4].iter().map(|byte| format!("{byte:02x}")).collect();
        self.dir.join(format!("{file}-{suffix}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn load(&self, name: &str) -> anyhow::Result<Option<PolicyCheckpoint>> {
        let path = self.path_for(name);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read checkpoint {}", path.display()));
            }
        };
        let checkpoint = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to decode checkpoint {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, name: &str, checkpoint: &PolicyCheckpoint) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let path = self.path_for(name);
        let temp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec(checkpoint).context("failed to encode checkpoint")?;
        tokio::fs::write(&temp, payload)
            .await
            .with_context(|| format!("failed to write {}", temp.display()))?;
        tokio::fs::rename(&temp, &path)
            .await
            .with_context(|| format!("failed to move checkpoint into {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, String>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.checkpoints
            .lock()
            .map(|checkpoints| checkpoints.contains_key(name))
            .unwrap_or(false)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, name: &str) -> anyhow::Result<Option<PolicyCheckpoint>> {
        let raw = self
            .checkpoints
            .lock()
            .map_err(|_| anyhow!("checkpoint map poisoned"))?
            .get(name)
            .cloned();
        raw.map(|raw| serde_json::from_str(&raw).context("failed to decode checkpoint"))
            .transpose()
    }

    async fn save(&self, name: &str, checkpoint: &PolicyCheckpoint) -> anyhow::Result<()> {
        let raw = serde_json::to_string(checkpoint).context("failed to encode checkpoint")?;
        self.checkpoints
            .lock()
            .map_err(|_| anyhow!("checkpoint map poisoned"))?
            .insert(name.to_string(), raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Policy, PolicyConfig};

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "balance-engine-{tag}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    #[tokio::test]
    async fn fs_store_round_trips_and_reports_missing() {
        let dir = scratch_dir("fs");
        let store = FsCheckpointStore::new(&dir);
        assert!(store.load("player_attack").await.unwrap().is_none());

        let checkpoint = Policy::new("player_attack", PolicyConfig::tiny()).checkpoint();
        store.save("player_attack", &checkpoint).await.unwrap();
        let loaded = store.load("player_attack").await.unwrap().unwrap();
        assert_eq!(loaded.name, "player_attack");
        assert_eq!(loaded.timesteps, checkpoint.timesteps);
        assert!(dir.join("trained_models/player_attack.json").exists());
        assert!(!dir.join("trained_models/player_attack.json.tmp").exists());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn fs_store_keeps_names_inside_the_model_dir() {
        let store = FsCheckpointStore::new("/models");
        assert_eq!(
            store.path_for("../etc/passwd"),
            PathBuf::from("/models/trained_models/___etc_passwd-7fef78f5.json")
        );
    }

    #[tokio::test]
    async fn fs_store_keeps_sanitized_names_apart() {
        let store = FsCheckpointStore::new("/models");
        assert_eq!(
            store.path_for("a.b"),
            PathBuf::from("/models/trained_models/a_b-2e7336dc.json")
        );
        assert_eq!(store.path_for("a_b"), PathBuf::from("/models/trained_models/a_b.json"));

        let dir = scratch_dir("fs-collide");
        let store = FsCheckpointStore::new(&dir);
        let dotted = Policy::new("a.b", PolicyConfig::tiny()).checkpoint();
        let underscored = Policy::new("a_b", PolicyConfig::tiny()).checkpoint();
        store.save("a.b", &dotted).await.unwrap();
        store.save("a_b", &underscored).await.unwrap();
        assert_eq!(store.load("a.b").await.unwrap().unwrap().name, "a.b");
        assert_eq!(store.load("a_b").await.unwrap().unwrap().name, "a_b");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryCheckpointStore::new();
        let checkpoint = Policy::new("monster_attack", PolicyConfig::tiny()).checkpoint();
        store.save("monster_attack", &checkpoint).await.unwrap();
        assert!(store.contains("monster_attack"));
        let loaded = store.load("monster_attack").await.unwrap().unwrap();
        assert_eq!(loaded.config, checkpoint.config);
    }
}
