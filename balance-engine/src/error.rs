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

use balance_common::ValidationError;

/// Failure taxonomy shared by the engine and the worker.
#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("policy `{name}` failed: {message}")]
    Model { name: String, message: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("training for `{0}` was cancelled")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, BalanceError>;

impl BalanceError {
    pub fn persistence(error: anyhow::Error) -> Self {
        BalanceError::Persistence(format!("{error:#}"))
    }

    pub fn model(name: &str, message: impl std::fmt::Display) -> Self {
        BalanceError::Model {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for BalanceError {
    fn from(error: serde_json::Error) -> Self {
        BalanceError::Decode(error.to_string())
    }
}
