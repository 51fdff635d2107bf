pub mod classifier;
pub mod merge;

use crate::attractions::types::Attraction;
use crate::cache::ExpiringCache;
use crate::geo::Coordinates;
use classifier::Classifier;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

const INTERESTS_KEY: &str = "interests";

/// A classifier verdict for one attraction name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub name: String,
    pub score: f64,
    #[serde(default)]
    pub reason: String,
}

/// Cached classifier output for one bucket and interest set. `classified`
/// lists every name sent to the classifier, including ones it did not score,
/// so later lists only pay for names that are new.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreSet {
    pub classified: Vec<String>,
    pub scores: Vec<ScoreResult>,
}

impl ScoreSet {
    fn missing(&self, attractions: &[Attraction]) -> Vec<String> {
        let mut known: HashSet<&str> = self.classified.iter().map(String::as_str).collect();
        attractions
            .iter()
            .map(|a| a.name.as_str())
            .filter(|name| known.insert(*name))
            .map(str::to_string)
            .collect()
    }
}

pub struct RelevanceService {
    cache: ExpiringCache,
    classifier: Arc<dyn Classifier>,
    ttl_ms: i64,
    key_precision: u32,
}

impl RelevanceService {
    pub fn new(
        cache: ExpiringCache,
        classifier: Arc<dyn Classifier>,
        ttl_ms: i64,
        key_precision: u32,
    ) -> Self {
        Self {
            cache,
            classifier,
            ttl_ms,
            key_precision,
        }
    }

    pub async fn interests(&self) -> Vec<String> {
        self.cache.get(INTERESTS_KEY).await.unwrap_or_default()
    }

    pub async fn set_interests(&self, interests: &[String]) -> Vec<String> {
        let interests = normalize_interests(interests);
        if !self.cache.set(INTERESTS_KEY, &interests).await {
            tracing::warn!("Could not persist interests");
        }
        interests
    }

    pub fn cache_key(&self, at: &Coordinates, interests: &[String]) -> String {
        format!(
            "scores:{}:{}",
            at.bucket_key(self.key_precision),
            interests.join(",")
        )
    }

    /// Overlays interest scores on `attractions`. Skipped, with the list
    /// returned untouched, when there is nothing to score against, no
    /// credentials, or the classifier fails.
    pub async fn score_attractions(
        &self,
        at: &Coordinates,
        attractions: Vec<Attraction>,
        interests: &[String],
    ) -> Vec<Attraction> {
        let interests = normalize_interests(interests);
        if interests.is_empty() || attractions.is_empty() {
            return attractions;
        }
        if !self.classifier.is_configured() {
            tracing::debug!("Classifier not configured, skipping relevance scoring");
            return attractions;
        }

        let key = self.cache_key(at, &interests);
        let mut cached = self
            .cache
            .get_cached::<ScoreSet>(&key)
            .await
            .unwrap_or_default();

        let missing = cached.missing(&attractions);
        if missing.is_empty() {
            tracing::debug!("Relevance cache hit for {}", key);
            return merge::merge_scores(attractions, &cached.scores);
        }

        match self.classifier.classify(&missing, &interests).await {
            Ok(scores) => {
                cached.classified.extend(missing);
                cached.scores.extend(scores);
                if !self.cache.set_cached(&key, &cached, self.ttl_ms).await {
                    tracing::warn!("Could not cache relevance scores for {}", key);
                }
                merge::merge_scores(attractions, &cached.scores)
            }
            Err(e) => {
                tracing::warn!("Relevance scoring failed, keeping base list: {}", e);
                attractions
            }
        }
    }
}

/// Trimmed, lowercased, de-duplicated and sorted so equivalent interest sets
/// share a cache key.
pub fn normalize_interests(interests: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = interests
        .iter()
        .map(|i| i.trim().to_lowercase())
        .filter(|i| !i.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}
