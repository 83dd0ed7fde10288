// SPDX-License-Identifier: Apache-2.0

use crate::geometry::validate_polygon;
use crate::ModelError;
use geo_types::{Coord, LineString, Polygon};
use serde::{Deserialize, Serialize};

/// How an imagery source enumerates its scenes.
///
/// `Wms` sources are addressed by slippy-map tiles; `List` sources publish
/// a CSV manifest of named chips with explicit bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ImageryFormat {
    Wms,
    List,
}

impl ImageryFormat {
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        match raw {
            "wms" => Ok(Self::Wms),
            "list" => Ok(Self::List),
            _ => Err(ModelError::InvalidFormat(format!(
                "imagery format must be 'wms' or 'list', got {raw:?}"
            ))),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wms => "wms",
            Self::List => "list",
        }
    }
}

/// A registered imagery source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImagerySpec {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub fmt: ImageryFormat,
    pub url: String,
}

/// Registration payload for an imagery source. `chips` carries the inline
/// CSV manifest for list-format sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageryDraft {
    pub name: String,
    pub fmt: ImageryFormat,
    pub url: String,
    #[serde(default)]
    pub chips: Option<String>,
}

impl ImageryDraft {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::Empty("imagery name"));
        }
        if self.url.trim().is_empty() {
            return Err(ModelError::Empty("imagery url"));
        }
        match (self.fmt, &self.chips) {
            (ImageryFormat::List, Some(raw)) => {
                parse_chip_list_csv(raw.as_bytes())?;
            }
            (ImageryFormat::List, None) => {
                return Err(ModelError::Empty("chip manifest for list imagery"));
            }
            (ImageryFormat::Wms, Some(_)) => {
                return Err(ModelError::InvalidFormat(
                    "wms imagery does not take a chip manifest".to_string(),
                ));
            }
            (ImageryFormat::Wms, None) => {}
        }
        Ok(())
    }
}

/// One scene from a list-format imagery manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Chip {
    pub name: String,
    pub url: String,
    pub bounds: Polygon<f64>,
}

#[derive(Debug, Deserialize)]
struct ChipRecord {
    name: String,
    url: String,
    bounds: String,
}

/// Parses a chip manifest: headed CSV with `name,url,bounds` columns where
/// `bounds` is a `minx,miny,maxx,maxy` lon/lat string.
pub fn parse_chip_list_csv(raw: &[u8]) -> Result<Vec<Chip>, ModelError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(raw);
    let mut chips = Vec::new();
    for record in reader.deserialize::<ChipRecord>() {
        let record =
            record.map_err(|e| ModelError::InvalidFormat(format!("bad chip row: {e}")))?;
        if record.name.is_empty() {
            return Err(ModelError::Empty("chip name"));
        }
        let bounds = bounds_polygon(&record.bounds)?;
        chips.push(Chip {
            name: record.name,
            url: record.url,
            bounds,
        });
    }
    if chips.is_empty() {
        return Err(ModelError::Empty("chip manifest"));
    }
    Ok(chips)
}

fn bounds_polygon(raw: &str) -> Result<Polygon<f64>, ModelError> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| ModelError::InvalidFormat(format!("bad chip bounds {raw:?}")))?;
    let [min_lon, min_lat, max_lon, max_lat] = parts[..] else {
        return Err(ModelError::InvalidFormat(format!(
            "chip bounds {raw:?} must be minx,miny,maxx,maxy"
        )));
    };
    if min_lon >= max_lon || min_lat >= max_lat {
        return Err(ModelError::Geometry(format!(
            "chip bounds {raw:?} are inverted or empty"
        )));
    }
    let ring = vec![
        Coord { x: min_lon, y: min_lat },
        Coord { x: max_lon, y: min_lat },
        Coord { x: max_lon, y: max_lat },
        Coord { x: min_lon, y: max_lat },
        Coord { x: min_lon, y: min_lat },
    ];
    let polygon = Polygon::new(LineString::new(ring), vec![]);
    validate_polygon(&polygon)?;
    Ok(polygon)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "\
name,url,bounds
scene-001,https://img.example/scene-001.tif,\"-61.31,15.26,-61.29,15.28\"
scene-002,https://img.example/scene-002.tif,\"-61.29,15.26,-61.27,15.28\"
";

    #[test]
    fn parses_chip_manifest() {
        let chips = parse_chip_list_csv(MANIFEST.as_bytes()).unwrap();
        assert_eq!(chips.len(), 2);
        assert_eq!(chips[0].name, "scene-001");
        let (min, max) = {
            use geo::BoundingRect;
            let rect = chips[0].bounds.bounding_rect().unwrap();
            (rect.min(), rect.max())
        };
        assert_eq!((min.x, min.y), (-61.31, 15.26));
        assert_eq!((max.x, max.y), (-61.29, 15.28));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let bad = "name,url,bounds\nscene,https://x,\"-61.27,15.26,-61.29,15.28\"\n";
        assert!(parse_chip_list_csv(bad.as_bytes()).is_err());
    }

    #[test]
    fn rejects_empty_manifest() {
        assert!(parse_chip_list_csv(b"name,url,bounds\n").is_err());
    }

    #[test]
    fn draft_requires_a_manifest_only_for_list_sources() {
        let wms = ImageryDraft {
            name: "naip".to_string(),
            fmt: ImageryFormat::Wms,
            url: "https://tiles.example/{z}/{x}/{y}".to_string(),
            chips: None,
        };
        assert!(wms.validate().is_ok());
        let list_without_chips = ImageryDraft {
            name: "drone".to_string(),
            fmt: ImageryFormat::List,
            url: "https://img.example/manifest.csv".to_string(),
            chips: None,
        };
        assert!(list_without_chips.validate().is_err());
        let list = ImageryDraft {
            chips: Some(MANIFEST.to_string()),
            ..list_without_chips
        };
        assert!(list.validate().is_ok());
    }

    #[test]
    fn format_parse_round_trips() {
        assert_eq!(ImageryFormat::parse("wms").unwrap(), ImageryFormat::Wms);
        assert_eq!(
            ImageryFormat::parse(ImageryFormat::List.as_str()).unwrap(),
            ImageryFormat::List
        );
        assert!(ImageryFormat::parse("tms").is_err());
    }
}
