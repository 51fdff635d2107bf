use crate::config::Config;
use crate::geo::Coordinates;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityInfo {
    pub name: String,
    pub country: Option<String>,
    pub state: Option<String>,
}

/// Best-effort reverse geocoding. Failures come back as `None`.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn lookup(&self, at: &Coordinates) -> Option<CityInfo>;
}

#[derive(Error, Debug)]
enum GeocodeError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("JSON parsing failed: {0}")]
    JsonParsing(#[from] serde_json::Error),
    #[error("API error: {0}")]
    ApiError(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocodeResponse {
    pub name: String,
    pub local_names: Option<HashMap<String, String>>,
    pub lat: f64,
    pub lon: f64,
    pub country: String,
    pub state: Option<String>,
}

impl From<GeocodeResponse> for CityInfo {
    fn from(r: GeocodeResponse) -> Self {
        Self {
            name: r.name,
            country: Some(r.country).filter(|c| !c.is_empty()),
            state: r.state,
        }
    }
}

pub struct OpenWeatherGeocoder {
    client: Client,
    config: Config,
}

impl OpenWeatherGeocoder {
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent("AttractionDiscovery/1.0")
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client, config })
    }

    async fn geocode_reverse(
        &self,
        at: &Coordinates,
        api_key: &str,
    ) -> Result<Vec<GeocodeResponse>, GeocodeError> {
        let url = format!(
            "{}{}",
            self.config.openweather_base_url, self.config.openweather_geocode_reverse_path
        );

        let response = self
            .client
            .get(&url)
            .query(&[
                ("lat", &at.latitude.to_string()),
                ("lon", &at.longitude.to_string()),
                ("limit", &"1".to_string()),
                ("appid", &api_key.to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(GeocodeError::ApiError(format!("HTTP {}: {}", status, error_text)));
        }

        let body: serde_json::Value = response.json().await?;
        Ok(serde_json::from_value(body)?)
    }
}

#[async_trait]
impl ReverseGeocoder for OpenWeatherGeocoder {
    async fn lookup(&self, at: &Coordinates) -> Option<CityInfo> {
        let api_key = self.config.openweather_api_key.as_deref()?;

        match self.geocode_reverse(at, api_key).await {
            Ok(results) => results.into_iter().next().map(CityInfo::from),
            Err(e) => {
                tracing::warn!("Reverse geocoding {} failed: {}", at, e);
                None
            }
        }
    }
}
