use super::ScoreResult;
use crate::attractions::types::Attraction;
use std::collections::HashMap;

pub const NEUTRAL_SCORE: f64 = 5.0;

/// Overlays scores onto `attractions`, joined on exact name. Every input
/// attraction comes out exactly once and in the same order; unmatched ones
/// get the neutral score and an empty reason.
///
/// Duplicate names share whichever score appears first for that name.
pub fn merge_scores(attractions: Vec<Attraction>, scores: &[ScoreResult]) -> Vec<Attraction> {
    let mut by_name: HashMap<&str, &ScoreResult> = HashMap::with_capacity(scores.len());
    for score in scores {
        by_name.entry(score.name.as_str()).or_insert(score);
    }

    attractions
        .into_iter()
        .map(|mut attraction| {
            match by_name.get(attraction.name.as_str()) {
                Some(score) => {
                    attraction.interest_score = Some(score.score);
                    attraction.interest_reason = Some(score.reason.clone());
                }
                None => {
                    attraction.interest_score = Some(NEUTRAL_SCORE);
                    attraction.interest_reason = Some(String::new());
                }
            }
            attraction
        })
        .collect()
}
