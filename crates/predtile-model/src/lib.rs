// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod geometry;
mod imagery;
mod prediction;
mod tile;

pub const CRATE_NAME: &str = "predtile-model";

pub use geometry::{polygon_from_geojson, polygon_to_geojson, validate_polygon};
pub use imagery::{parse_chip_list_csv, Chip, ImageryDraft, ImageryFormat, ImagerySpec};
pub use prediction::{Hint, Prediction, PredictionDraft, Project, ProjectDraft};
pub use tile::{PredictionTile, TileInput, ValidityPatch};

use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ModelError {
    Empty(&'static str),
    InvalidFormat(String),
    Geometry(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty(name) => write!(f, "{name} must not be empty"),
            Self::InvalidFormat(msg) => f.write_str(msg),
            Self::Geometry(msg) => write!(f, "invalid geometry: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}
