use crate::geo::Coordinates;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_RATING: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttractionId {
    Numeric(i64),
    Text(String),
}

impl fmt::Display for AttractionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttractionId::Numeric(id) => write!(f, "{}", id),
            AttractionId::Text(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attraction {
    pub id: AttractionId,
    pub name: String,
    pub coordinates: Coordinates,
    pub category: String,
    /// Meters from the position the list was discovered for.
    pub distance: f64,
    /// 0.0..=5.0
    pub rating: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interest_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interest_reason: Option<String>,
}

/// A point of interest as reported by a live source, before distances are known.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: AttractionId,
    pub name: String,
    pub coordinates: Coordinates,
    pub category: String,
    pub rating: f64,
}

impl Candidate {
    pub fn into_attraction(self, distance: f64) -> Attraction {
        Attraction {
            id: self.id,
            name: self.name,
            coordinates: self.coordinates,
            category: self.category,
            distance,
            rating: clamp_rating(self.rating),
            interest_score: None,
            interest_reason: None,
        }
    }
}

pub fn clamp_rating(rating: f64) -> f64 {
    if rating.is_nan() {
        0.0
    } else {
        rating.clamp(0.0, MAX_RATING)
    }
}
