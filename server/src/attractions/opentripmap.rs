use super::types::{AttractionId, Candidate, MAX_RATING};
use super::{AttractionSource, SourceError};
use crate::config::Config;
use crate::geo::Coordinates;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

/// OpenTripMap reports popularity on a 0..=7 scale.
const SOURCE_MAX_RATE: f64 = 7.0;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: f32 = 2.0;
const BACKOFF_JITTER: f32 = 0.5;

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceSummary {
    pub xid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub kinds: String,
    pub point: PlacePoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlacePoint {
    pub lat: f64,
    pub lon: f64,
}

pub struct OpenTripMapClient {
    client: Client,
    config: Config,
}

impl OpenTripMapClient {
    pub fn new(config: Config) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent("AttractionDiscovery/1.0")
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, config })
    }

    /// GET returning JSON. 429s are retried with growing, jittered backoff;
    /// any other non-200 fails straight away.
    async fn get_json(&self, url: &str, params: &[(&str, &str)]) -> Result<Value, SourceError> {
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 0..=MAX_RETRIES {
            let response = self.client.get(url).query(params).send().await?;

            let status = response.status();
            if status == reqwest::StatusCode::OK {
                return Ok(response.json().await?);
            }
            if status != reqwest::StatusCode::TOO_MANY_REQUESTS {
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::ApiError(format!("HTTP {}: {}", status, body)));
            }
            if attempt == MAX_RETRIES {
                break;
            }

            tracing::warn!(
                "OpenTripMap rate limit (attempt {}/{}), backing off {}ms",
                attempt + 1,
                MAX_RETRIES,
                backoff.as_millis()
            );
            sleep(backoff).await;
            backoff = next_backoff(backoff, fastrand::f32());
        }

        Err(SourceError::RateLimited(backoff.as_secs()))
    }
}

/// `jitter` in 0.0..1.0 widens the growth factor by up to `BACKOFF_JITTER`.
fn next_backoff(current: Duration, jitter: f32) -> Duration {
    current.mul_f32(BACKOFF_FACTOR + jitter.clamp(0.0, 1.0) * BACKOFF_JITTER)
}

#[async_trait]
impl AttractionSource for OpenTripMapClient {
    async fn fetch(&self, at: &Coordinates) -> Result<Vec<Candidate>, SourceError> {
        if at.validate().is_err() {
            return Err(SourceError::InvalidCoordinates);
        }

        let response = self
            .get_json(
                &self.config.opentripmap_base_url,
                &[
                    ("lat", &at.latitude.to_string()),
                    ("lon", &at.longitude.to_string()),
                    ("radius", &self.config.search_radius_m.to_string()),
                    ("limit", &self.config.max_attractions.to_string()),
                    ("rate", "1"),
                    ("format", "json"),
                    ("apikey", &self.config.opentripmap_api_key),
                ],
            )
            .await?;

        let places: Vec<PlaceSummary> = serde_json::from_value(response)?;
        Ok(places_to_candidates(places))
    }
}

/// Unnamed places are dropped; the merge joins on names.
pub fn places_to_candidates(places: Vec<PlaceSummary>) -> Vec<Candidate> {
    places
        .into_iter()
        .filter(|p| !p.name.trim().is_empty())
        .map(|p| Candidate {
            id: AttractionId::Text(p.xid),
            name: p.name.trim().to_string(),
            coordinates: Coordinates::new(p.point.lat, p.point.lon),
            category: primary_kind(&p.kinds),
            rating: p.rate.unwrap_or(0.0) / SOURCE_MAX_RATE * MAX_RATING,
        })
        .collect()
}

fn primary_kind(kinds: &str) -> String {
    kinds
        .split(',')
        .map(str::trim)
        .find(|k| !k.is_empty())
        .unwrap_or("other")
        .to_string()
}
