// SPDX-License-Identifier: Apache-2.0

use crate::ModelError;
use serde::{Deserialize, Serialize};

pub const NAME_MAX_LEN: usize = 256;

/// Distinguishes inference runs from label-generation runs. Training rows
/// skip validity-driven relabeling on npz export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Hint {
    Prediction,
    Training,
}

impl Hint {
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        match raw {
            "prediction" => Ok(Self::Prediction),
            "training" => Ok(Self::Training),
            _ => Err(ModelError::InvalidFormat(format!(
                "hint must be 'prediction' or 'training', got {raw:?}"
            ))),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prediction => "prediction",
            Self::Training => "training",
        }
    }
}

/// A registered model project. Owns zero or more predictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub source: String,
    pub archived: bool,
    pub tags: Vec<String>,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectDraft {
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ProjectDraft {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::Empty("project name"));
        }
        if self.name.len() > NAME_MAX_LEN {
            return Err(ModelError::InvalidFormat(format!(
                "project name exceeds max length {NAME_MAX_LEN}"
            )));
        }
        Ok(())
    }
}

/// One model run over an imagery source. Declares the inference schema
/// every owned tile row must conform to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Prediction {
    pub id: i64,
    pub project_id: i64,
    pub created: i64,
    pub hint: Hint,
    pub version: String,
    pub tile_zoom: u8,
    /// Ordered inference names; fixes the `predictions` key set of every
    /// tile row belonging to this prediction.
    pub inf_list: Vec<String>,
    pub inf_type: String,
    pub inf_binary: bool,
    pub inf_supertile: bool,
    pub imagery_id: Option<i64>,
}

impl Prediction {
    #[must_use]
    pub fn declares_inference(&self, name: &str) -> bool {
        self.inf_list.iter().any(|n| n == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictionDraft {
    pub hint: Hint,
    pub version: String,
    pub tile_zoom: u8,
    pub inf_list: Vec<String>,
    #[serde(default)]
    pub inf_type: String,
    #[serde(default)]
    pub inf_binary: bool,
    #[serde(default)]
    pub inf_supertile: bool,
    #[serde(default)]
    pub imagery_id: Option<i64>,
}

impl PredictionDraft {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.version.trim().is_empty() {
            return Err(ModelError::Empty("prediction version"));
        }
        if self.tile_zoom > predtile_core::tilemath::MAX_ZOOM {
            return Err(ModelError::InvalidFormat(format!(
                "tile_zoom {} exceeds max zoom {}",
                self.tile_zoom,
                predtile_core::tilemath::MAX_ZOOM
            )));
        }
        if self.inf_list.is_empty() {
            return Err(ModelError::Empty("inf_list"));
        }
        for name in &self.inf_list {
            if name.trim().is_empty() || name.trim() != name {
                return Err(ModelError::InvalidFormat(format!(
                    "inference name {name:?} must be non-empty with no surrounding whitespace"
                )));
            }
            if name.contains(',') {
                return Err(ModelError::InvalidFormat(format!(
                    "inference name {name:?} must not contain commas"
                )));
            }
        }
        let mut sorted = self.inf_list.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.inf_list.len() {
            return Err(ModelError::InvalidFormat(
                "inf_list contains duplicate inference names".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(inf_list: &[&str]) -> PredictionDraft {
        PredictionDraft {
            hint: Hint::Prediction,
            version: "1.0.0".to_string(),
            tile_zoom: 16,
            inf_list: inf_list.iter().map(|s| s.to_string()).collect(),
            inf_type: "classification".to_string(),
            inf_binary: false,
            inf_supertile: false,
            imagery_id: None,
        }
    }

    #[test]
    fn accepts_well_formed_draft() {
        assert!(draft(&["building", "road"]).validate().is_ok());
    }

    #[test]
    fn rejects_empty_and_duplicate_inference_lists() {
        assert!(draft(&[]).validate().is_err());
        assert!(draft(&["building", "building"]).validate().is_err());
        assert!(draft(&["a,b"]).validate().is_err());
        assert!(draft(&[" building"]).validate().is_err());
    }

    #[test]
    fn hint_parse_round_trips() {
        assert_eq!(Hint::parse("training").unwrap(), Hint::Training);
        assert_eq!(Hint::parse(Hint::Prediction.as_str()).unwrap(), Hint::Prediction);
        assert!(Hint::parse("other").is_err());
    }
}
