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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use balance_common::{ItemNamingRequest, expand_env_vars};
use balance_engine::{BalanceError, BalanceStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::InferenceConfig;

/// Hosted text and image models used to name items and draw their icons.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<String>;
    async fn synthesize_image(&self, prompt: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NamingPrompts {
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for NamingPrompts {
    fn default() -> Self {
        Self {
            system_prompt: "Generate short (1-3 words) name for item from fantasy dungeon crawler rpg \
                by given description. Respond with one line of text containing item name, without \
                formatting, quotation marks, dots, or additional text"
                .to_string(),
            temperature: 0.8,
            max_tokens: 10,
        }
    }
}

impl NamingPrompts {
    /// Loads prompt overrides, expanding `${VAR}` references first.
    pub fn from_yaml_file(path: &str) -> Option<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(path = %path, error = %error, "failed to read item naming prompts file");
                return None;
            }
        };
        Self::from_yaml_str(&raw).or_else(|| {
            warn!(path = %path, "failed to parse item naming prompts yaml");
            None
        })
    }

    fn from_yaml_str(raw: &str) -> Option<Self> {
        serde_yaml::from_str::<NamingPrompts>(&expand_env_vars(raw)).ok()
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: String,
}

/// Chat-completions endpoint for text, Hugging Face inference endpoint for images.
pub struct HttpInferenceClient {
    client: reqwest::Client,
    text_url: String,
    text_model: String,
    image_url: String,
    api_key: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            text_url: config.text_url.clone(),
            text_model: config.text_model.clone(),
            image_url: format!(
                "{}/{}",
                config.image_url.trim_end_matches('/'),
                config.image_model
            ),
            api_key: config.api_key.clone(),
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<String> {
        let body = ChatCompletionRequest {
            model: &self.text_model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature,
            max_tokens,
        };
        let response = self
            .authorized(self.client.post(&self.text_url))
            .json(&body)
            .send()
            .await
            .context("failed to reach text inference endpoint")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "".to_string());
            anyhow::bail!("text inference returned {}: {}", status, body);
        }
        let completion = response
            .json::<ChatCompletionResponse>()
            .await
            .context("invalid chat completion payload")?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .context("chat completion had no choices")
    }

    async fn synthesize_image(&self, prompt: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .authorized(self.client.post(&self.image_url))
            .json(&serde_json::json!({ "inputs": prompt }))
            .send()
            .await
            .context("failed to reach image inference endpoint")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "".to_string());
            anyhow::bail!("image inference returned {}: {}", status, body);
        }
        let bytes = response.bytes().await.context("failed to read image bytes")?;
        Ok(bytes.to_vec())
    }
}

/// First non-empty line with surrounding quotes, dots and markup removed.
pub fn clean_item_name(raw: &str) -> Option<String> {
    raw.lines()
        .map(|line| {
            line.trim_matches(|c: char| {
                c.is_whitespace() || matches!(c, '"' | '\'' | '.' | '*' | '`' | '#')
            })
        })
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn file_stem(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub struct ItemNamer {
    client: Arc<dyn InferenceClient>,
    store: Arc<dyn BalanceStore>,
    prompts: NamingPrompts,
    image_dir: PathBuf,
}

impl ItemNamer {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        store: Arc<dyn BalanceStore>,
        prompts: NamingPrompts,
        image_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            store,
            prompts,
            image_dir: image_dir.into(),
        }
    }

    /// Names the item, draws its icon and stores the name. A failed icon does
    /// not block the name update.
    pub async fn handle(&self, request: &ItemNamingRequest) -> Result<String, BalanceError> {
        debug!(chat_id = request.chat_id, item_id = %request.id, "naming item");
        let raw = self
            .client
            .complete(
                &self.prompts.system_prompt,
                &request.prompt,
                self.prompts.temperature,
                self.prompts.max_tokens,
            )
            .await
            .map_err(|error| BalanceError::model("item-naming", format!("{error:#}")))?;
        let name = clean_item_name(&raw)
            .ok_or_else(|| BalanceError::model("item-naming", "completion contained no name"))?;

        match self.render_icon(request, &name).await {
            Ok(path) => debug!(chat_id = request.chat_id, item_id = %request.id, path = %path.display(), "item icon saved"),
            Err(error) => warn!(
                chat_id = request.chat_id,
                item_id = %request.id,
                error = %format!("{error:#}"),
                "failed to render item icon"
            ),
        }

        self.store
            .update_item_name(request.chat_id, &request.id, &name)
            .await
            .map_err(BalanceError::persistence)?;
        info!(chat_id = request.chat_id, item_id = %request.id, name = %name, "item named");
        Ok(name)
    }

    async fn render_icon(&self, request: &ItemNamingRequest, name: &str) -> anyhow::Result<PathBuf> {
        let image = self
            .client
            .synthesize_image(&format!("{name}: {}", request.prompt))
            .await?;
        tokio::fs::create_dir_all(&self.image_dir)
            .await
            .with_context(|| format!("failed to create {}", self.image_dir.display()))?;
        let path = self
            .image_dir
            .join(format!("{}_{}.png", request.chat_id, file_stem(&request.id)));
        tokio::fs::write(&path, image)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}
