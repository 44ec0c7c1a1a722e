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

use std::collections::BTreeMap;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// Per-step adjustment applied to a cell for a full-strength action component.
pub const DEFAULT_CHANGE_AMOUNT: f64 = 0.01;
pub const DEFAULT_MAX_CHANGES_PER_EPISODE: u64 = 100;
pub const STABILITY_PENALTY_PER_CHANGE: f64 = 0.001;

/// Upper bound on `rows * cols` for any matrix the engine will build or train on.
pub const MAX_MATRIX_CELLS: usize = 1024;

/// Chat key under which template matrices are persisted.
pub const TEMPLATE_CHAT_KEY: &str = "TEMPLATE";

/// Matrix identities whose reward is driven by combat telemetry.
pub const COMBAT_MATRIX_NAMES: [&str; 2] = ["player_attack", "monster_attack"];

pub type ChatId = i64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("matrix dimensions must be positive, got {rows}x{cols}")]
    EmptyShape { rows: usize, cols: usize },
    #[error("matrix {rows}x{cols} exceeds the limit of {max} cells")]
    TooManyCells { rows: usize, cols: usize, max: usize },
    #[error("row {row} has {found} columns, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("value {value} at ({row}, {col}) is outside [{min}, {max}]")]
    OutOfRange {
        row: usize,
        col: usize,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("non-finite value at ({row}, {col})")]
    NotFinite { row: usize, col: usize },
    #[error("invalid value range [{min}, {max}]")]
    InvalidRange { min: f64, max: f64 },
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("episode already finished after {steps} steps; reset first")]
    EpisodeFinished { steps: u64 },
}

/// Closed interval every cell of a [`MatrixSpace`] must stay within.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "(f64, f64)", into = "(f64, f64)")]
pub struct ValueRange {
    min: f64,
    max: f64,
}

impl ValueRange {
    /// Multiplier range used by adjustment matrices.
    pub const ADJUSTMENT: ValueRange = ValueRange { min: 0.7, max: 1.3 };
    /// Range of the older count-style matrices.
    pub const LEGACY_COUNT: ValueRange = ValueRange {
        min: 0.0,
        max: 100.0,
    };

    pub fn new(min: f64, max: f64) -> Result<Self, ValidationError> {
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(ValidationError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// Picks the preset that holds every value: [`Self::ADJUSTMENT`] when it
    /// fits, otherwise [`Self::LEGACY_COUNT`].
    pub fn infer(rows: &[Vec<f64>]) -> Self {
        if rows.iter().flatten().all(|v| Self::ADJUSTMENT.contains(*v)) {
            Self::ADJUSTMENT
        } else {
            Self::LEGACY_COUNT
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    /// Maps a value of this range onto `[-1, 1]`.
    pub fn normalize(&self, value: f64) -> f64 {
        (value - self.min) / self.width() * 2.0 - 1.0
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::ADJUSTMENT
    }
}

impl TryFrom<(f64, f64)> for ValueRange {
    type Error = ValidationError;

    fn try_from((min, max): (f64, f64)) -> Result<Self, Self::Error> {
        Self::new(min, max)
    }
}

impl From<ValueRange> for (f64, f64) {
    fn from(range: ValueRange) -> Self {
        (range.min, range.max)
    }
}

/// A bounded, fixed-shape grid of balance coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MatrixWire", into = "MatrixWire")]
pub struct MatrixSpace {
    name: String,
    rows: usize,
    cols: usize,
    values: Vec<f64>,
    range: ValueRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MatrixWire {
    name: String,
    rows: usize,
    cols: usize,
    values: Vec<Vec<f64>>,
    #[serde(default)]
    value_range: ValueRange,
}

impl TryFrom<MatrixWire> for MatrixSpace {
    type Error = ValidationError;

    fn try_from(wire: MatrixWire) -> Result<Self, Self::Error> {
        let matrix = MatrixSpace::from_rows(wire.name, &wire.values, wire.value_range)?;
        if matrix.shape() != (wire.rows, wire.cols) {
            return Err(ValidationError::ShapeMismatch {
                expected: (wire.rows, wire.cols),
                found: matrix.shape(),
            });
        }
        Ok(matrix)
    }
}

impl From<MatrixSpace> for MatrixWire {
    fn from(matrix: MatrixSpace) -> Self {
        MatrixWire {
            values: matrix.to_rows(),
            name: matrix.name,
            rows: matrix.rows,
            cols: matrix.cols,
            value_range: matrix.range,
        }
    }
}

impl MatrixSpace {
    pub fn new(
        name: impl Into<String>,
        rows: usize,
        cols: usize,
        fill: f64,
        range: ValueRange,
    ) -> Result<Self, ValidationError> {
        check_shape(rows, cols)?;
        if !fill.is_finite() {
            return Err(ValidationError::NotFinite { row: 0, col: 0 });
        }
        if !range.contains(fill) {
            return Err(ValidationError::OutOfRange {
                row: 0,
                col: 0,
                value: fill,
                min: range.min,
                max: range.max,
            });
        }
        Ok(Self {
            name: name.into(),
            rows,
            cols,
            values: vec![fill; rows * cols],
            range,
        })
    }

    /// Builds a matrix from nested rows, rejecting any value outside `range`.
    pub fn from_rows(
        name: impl Into<String>,
        rows: &[Vec<f64>],
        range: ValueRange,
    ) -> Result<Self, ValidationError> {
        let matrix = Self::collect_rows(name.into(), rows, range)?;
        matrix.validate()?;
        Ok(matrix)
    }

    /// Builds a matrix from nested rows, clamping out-of-range values into `range`.
    ///
    /// Used for persisted templates, which predate the current bounds. Non-finite
    /// values are still rejected.
    pub fn from_rows_clamped(
        name: impl Into<String>,
        rows: &[Vec<f64>],
        range: ValueRange,
    ) -> Result<Self, ValidationError> {
        let mut matrix = Self::collect_rows(name.into(), rows, range)?;
        for (index, value) in matrix.values.iter_mut().enumerate() {
            if !value.is_finite() {
                return Err(ValidationError::NotFinite {
                    row: index / matrix.cols,
                    col: index % matrix.cols,
                });
            }
            *value = range.clamp(*value);
        }
        Ok(matrix)
    }

    pub fn random<R: Rng + ?Sized>(
        name: impl Into<String>,
        rows: usize,
        cols: usize,
        range: ValueRange,
        rng: &mut R,
    ) -> Result<Self, ValidationError> {
        check_shape(rows, cols)?;
        let values = (0..rows * cols)
            .map(|_| rng.random_range(range.min..=range.max))
            .collect();
        Ok(Self {
            name: name.into(),
            rows,
            cols,
            values,
            range,
        })
    }

    fn collect_rows(
        name: String,
        rows: &[Vec<f64>],
        range: ValueRange,
    ) -> Result<Self, ValidationError> {
        let row_count = rows.len();
        let col_count = rows.first().map(Vec::len).unwrap_or(0);
        check_shape(row_count, col_count)?;

        let mut values = Vec::with_capacity(row_count * col_count);
        for (index, row) in rows.iter().enumerate() {
            if row.len() != col_count {
                return Err(ValidationError::RaggedRow {
                    row: index,
                    expected: col_count,
                    found: row.len(),
                });
            }
            values.extend_from_slice(row);
        }

        Ok(Self {
            name,
            rows: row_count,
            cols: col_count,
            values,
            range,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn range(&self) -> ValueRange {
        self.range
    }

    /// Row-major cell values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows && col < self.cols {
            Some(self.values[row * self.cols + col])
        } else {
            None
        }
    }

    /// Writes one cell. Returns whether the stored value changed.
    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<bool, ValidationError> {
        if row >= self.rows || col >= self.cols {
            return Err(ValidationError::ShapeMismatch {
                expected: self.shape(),
                found: (row + 1, col + 1),
            });
        }
        if !value.is_finite() {
            return Err(ValidationError::NotFinite { row, col });
        }
        if !self.range.contains(value) {
            return Err(ValidationError::OutOfRange {
                row,
                col,
                value,
                min: self.range.min,
                max: self.range.max,
            });
        }
        let slot = &mut self.values[row * self.cols + col];
        let changed = *slot != value;
        *slot = value;
        Ok(changed)
    }

    /// Overwrites every cell with the values of `other`, which must share this shape.
    pub fn copy_from(&mut self, other: &MatrixSpace) -> Result<(), ValidationError> {
        if other.shape() != self.shape() {
            return Err(ValidationError::ShapeMismatch {
                expected: self.shape(),
                found: other.shape(),
            });
        }
        other.validate_against(self.range)?;
        self.values.copy_from_slice(&other.values);
        Ok(())
    }

    /// Checks the range invariant for every cell.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_against(self.range)
    }

    fn validate_against(&self, range: ValueRange) -> Result<(), ValidationError> {
        for (index, value) in self.values.iter().copied().enumerate() {
            let (row, col) = (index / self.cols, index % self.cols);
            if !value.is_finite() {
                return Err(ValidationError::NotFinite { row, col });
            }
            if !range.contains(value) {
                return Err(ValidationError::OutOfRange {
                    row,
                    col,
                    value,
                    min: range.min,
                    max: range.max,
                });
            }
        }
        Ok(())
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.values
            .chunks(self.cols)
            .map(<[f64]>::to_vec)
            .collect()
    }

    pub fn mean(&self) -> f64 {
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn row_mean(&self, row: usize) -> f64 {
        let start = row * self.cols;
        self.values[start..start + self.cols].iter().sum::<f64>() / self.cols as f64
    }

    pub fn col_mean(&self, col: usize) -> f64 {
        (0..self.rows)
            .map(|row| self.values[row * self.cols + col])
            .sum::<f64>()
            / self.rows as f64
    }

    /// Largest absolute per-cell difference against a matrix of the same shape.
    pub fn max_abs_diff(&self, other: &MatrixSpace) -> Option<f64> {
        if self.shape() != other.shape() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(&other.values)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max),
        )
    }
}

/// Rejects empty shapes and anything larger than [`MAX_MATRIX_CELLS`].
pub fn check_shape(rows: usize, cols: usize) -> Result<(), ValidationError> {
    if rows == 0 || cols == 0 {
        return Err(ValidationError::EmptyShape { rows, cols });
    }
    match rows.checked_mul(cols) {
        Some(cells) if cells <= MAX_MATRIX_CELLS => Ok(()),
        _ => Err(ValidationError::TooManyCells {
            rows,
            cols,
            max: MAX_MATRIX_CELLS,
        }),
    }
}

/// Per-cell mutation counter shaped like the matrix it tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeTracker {
    rows: usize,
    cols: usize,
    counts: Vec<u64>,
}

impl ChangeTracker {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            counts: vec![0; rows * cols],
        }
    }

    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|count| *count = 0);
    }

    pub fn record(&mut self, row: usize, col: usize) {
        if row < self.rows && col < self.cols {
            self.counts[row * self.cols + col] += 1;
        }
    }

    pub fn get(&self, row: usize, col: usize) -> u64 {
        if row < self.rows && col < self.cols {
            self.counts[row * self.cols + col]
        } else {
            0
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn to_rows(&self) -> Vec<Vec<u64>> {
        self.counts
            .chunks(self.cols.max(1))
            .map(<[u64]>::to_vec)
            .collect()
    }
}

/// Which reward policy applies to a matrix identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixCategory {
    Combat,
    Attribute,
}

impl MatrixCategory {
    pub fn of(name: &str) -> Self {
        if name.ends_with("_attr") || name.ends_with("_adjustment") {
            return MatrixCategory::Attribute;
        }
        if COMBAT_MATRIX_NAMES.contains(&name) {
            MatrixCategory::Combat
        } else {
            MatrixCategory::Attribute
        }
    }
}

/// Attribute weights of a player or monster, in the game's canonical order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct WeightVector(Vec<f64>);

#[derive(Deserialize)]
#[serde(untagged)]
enum WeightWire {
    Vector(Vec<f64>),
    Scalar(f64),
    Named(NamedWeight),
}

/// Attribute-object form of a weight emitted by the game server.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NamedWeight {
    hp: f64,
    max_hp: f64,
    mana: f64,
    max_mana: f64,
    armor: f64,
    max_armor: f64,
    chance_to_dodge: f64,
    gold_bonus: f64,
    xp_bonus: f64,
    attack: f64,
    critical_hit_chance: f64,
    chance_to_knockout: f64,
    arcane_magic: f64,
    divine_magic: f64,
}

impl From<NamedWeight> for WeightVector {
    fn from(weight: NamedWeight) -> Self {
        WeightVector(vec![
            weight.hp,
            weight.max_hp,
            weight.mana,
            weight.max_mana,
            weight.armor,
            weight.max_armor,
            weight.chance_to_dodge,
            weight.gold_bonus,
            weight.xp_bonus,
            weight.attack,
            weight.critical_hit_chance,
            weight.chance_to_knockout,
            weight.arcane_magic,
            weight.divine_magic,
        ])
    }
}

impl<'de> Deserialize<'de> for WeightVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match WeightWire::deserialize(deserializer)? {
            WeightWire::Vector(values) => WeightVector(values),
            WeightWire::Scalar(value) => WeightVector(vec![value]),
            WeightWire::Named(named) => named.into(),
        })
    }
}

impl From<Vec<f64>> for WeightVector {
    fn from(values: Vec<f64>) -> Self {
        WeightVector(values)
    }
}

impl WeightVector {
    pub fn new(values: Vec<f64>) -> Self {
        WeightVector(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Component `index`, or 0 past the end.
    pub fn component(&self, index: usize) -> f64 {
        self.0.get(index).copied().unwrap_or(0.0)
    }

    pub fn norm(&self) -> f64 {
        self.0.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    pub fn scaled(&self, factor: f64) -> Self {
        WeightVector(self.0.iter().map(|v| v * factor).collect())
    }

    /// Cosine similarity, zero-padding the shorter vector. Defined as 0 when
    /// either vector has zero norm.
    pub fn cosine_similarity(&self, other: &WeightVector) -> f64 {
        let (a, b) = (self.norm(), other.norm());
        if a == 0.0 || b == 0.0 || !a.is_finite() || !b.is_finite() {
            return 0.0;
        }
        let dimensions = self.len().max(other.len());
        let dot: f64 = (0..dimensions)
            .map(|i| self.component(i) * other.component(i))
            .sum();
        (dot / (a * b)).clamp(-1.0, 1.0)
    }
}

/// Distribution of weight norms observed over a game, `norm -> occurrences`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, u64>", into = "BTreeMap<String, u64>")]
pub struct WeightScale {
    entries: Vec<(f64, u64)>,
}

impl WeightScale {
    pub fn new(mut entries: Vec<(f64, u64)>) -> Self {
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { entries }
    }

    pub fn entries(&self) -> &[(f64, u64)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distance between the smallest and largest observed norm.
    pub fn spread(&self) -> f64 {
        match (self.entries.first(), self.entries.last()) {
            (Some(first), Some(last)) => last.0 - first.0,
            _ => 0.0,
        }
    }

    /// Sum of squared occurrence counts.
    pub fn concentration(&self) -> f64 {
        self.entries
            .iter()
            .map(|(_, count)| (*count as f64).powi(2))
            .sum()
    }
}

impl TryFrom<BTreeMap<String, u64>> for WeightScale {
    type Error = String;

    fn try_from(map: BTreeMap<String, u64>) -> Result<Self, Self::Error> {
        let entries = map
            .into_iter()
            .map(|(key, count)| {
                key.trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|norm| norm.is_finite())
                    .map(|norm| (norm, count))
                    .ok_or_else(|| format!("invalid weight-scale norm key {key:?}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WeightScale::new(entries))
    }
}

impl From<WeightScale> for BTreeMap<String, u64> {
    fn from(scale: WeightScale) -> Self {
        scale
            .entries
            .into_iter()
            .map(|(norm, count)| (norm.to_string(), count))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefeatedMonster {
    #[serde(alias = "weightVector")]
    pub weight: WeightVector,
    #[serde(default, alias = "battleSteps", alias = "battleStepsTaken")]
    pub battle_steps: u32,
    /// Index into the player's weight trajectory at the moment of the kill.
    #[serde(default, alias = "stepKilled")]
    pub step_killed: Option<i64>,
}

/// One recorded game outcome, as produced by the game server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    #[serde(alias = "chatId")]
    pub chat_id: ChatId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub death: bool,
    #[serde(default)]
    pub killer: Option<DefeatedMonster>,
    #[serde(
        default,
        alias = "playerWeightDynamic",
        alias = "player_weight_dynamic",
        alias = "playerWeightTrajectory",
        deserialize_with = "null_as_default"
    )]
    pub player_weight_trajectory: Vec<WeightVector>,
    #[serde(
        default,
        alias = "defeatedMonsters",
        deserialize_with = "null_as_default"
    )]
    pub defeated_monsters: Vec<DefeatedMonster>,
    #[serde(
        default,
        alias = "playerLevelProgression",
        deserialize_with = "null_as_default"
    )]
    pub player_level_progression: Vec<i64>,
    #[serde(
        default,
        alias = "dungeonLevelProgression",
        deserialize_with = "null_as_default"
    )]
    pub dungeon_level_progression: Vec<i64>,
    #[serde(default, alias = "weightScale")]
    pub weight_scale: Option<WeightScale>,
    /// Matrices the game was played with, keyed by matrix name.
    #[serde(default, alias = "balanceMatrices")]
    pub balance_matrices: Option<BTreeMap<String, Vec<Vec<f64>>>>,
}

impl OutcomeRecord {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            death: false,
            killer: None,
            player_weight_trajectory: Vec::new(),
            defeated_monsters: Vec::new(),
            player_level_progression: Vec::new(),
            dungeon_level_progression: Vec::new(),
            weight_scale: None,
            balance_matrices: None,
        }
    }

    pub fn final_player_weight(&self) -> Option<&WeightVector> {
        self.player_weight_trajectory.last()
    }

    /// Player weight at trajectory step `step`, falling back to the final entry.
    pub fn player_weight_at(&self, step: Option<i64>) -> Option<&WeightVector> {
        step.and_then(|step| usize::try_from(step).ok())
            .and_then(|index| self.player_weight_trajectory.get(index))
            .or_else(|| self.final_player_weight())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One entry of a balance-request event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixRequest {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemNamingRequest {
    #[serde(alias = "chatId")]
    pub chat_id: ChatId,
    pub id: String,
    pub prompt: String,
}

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
