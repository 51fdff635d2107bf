use crate::geo::{DEFAULT_MOVEMENT_THRESHOLD_M, MAX_KEY_PRECISION};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub opentripmap_api_key: String,
    pub opentripmap_base_url: String,
    pub search_radius_m: u32,
    pub max_attractions: u32,
    pub openweather_api_key: Option<String>,
    pub openweather_base_url: String,
    pub openweather_geocode_reverse_path: String,
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: String,
    pub or_model: String,
    pub movement_threshold_m: f64,
    pub tracking_min_distance_m: f64,
    pub tracking_min_interval_ms: u64,
    pub attractions_ttl_mins: u64,
    pub scores_ttl_mins: u64,
    pub cache_key_precision: u32,
    pub cache_backend: CacheBackendKind,
    pub database_url: String,
    pub cache_sweep_secs: u64,
    pub bind_addr: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Sqlite,
    Memory,
}

impl FromStr for CacheBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(CacheBackendKind::Sqlite),
            "memory" => Ok(CacheBackendKind::Memory),
            other => Err(anyhow::anyhow!("unknown CACHE_BACKEND: {}", other)),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            opentripmap_api_key: env::var("OPENTRIPMAP_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENTRIPMAP_API_KEY not set"))?,
            opentripmap_base_url: env::var("OPENTRIPMAP_BASE_URL")
                .unwrap_or_else(|_| "https://api.opentripmap.com/0.1/en/places/radius".to_string()),
            search_radius_m: parse_or("SEARCH_RADIUS_M", 5000)?,
            max_attractions: parse_or("MAX_ATTRACTIONS", 50)?,
            openweather_api_key: optional("OPENWEATHER_API_KEY"),
            openweather_base_url: env::var("OPENWEATHER_BASE_URL")
                .unwrap_or_else(|_| "https://api.openweathermap.org".to_string()),
            openweather_geocode_reverse_path: env::var("OPENWEATHER_GEOCODE_REVERSE_PATH")
                .unwrap_or_else(|_| "/geo/1.0/reverse".to_string()),
            openrouter_api_key: optional("OPENROUTER_API_KEY"),
            openrouter_base_url: env::var("OPENROUTER_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1/chat/completions".to_string()),
            or_model: env::var("OR_MODEL")
                .unwrap_or_else(|_| "deepseek/deepseek-chat-v3-0324:free".to_string()),
            movement_threshold_m: parse_or("MOVEMENT_THRESHOLD_M", DEFAULT_MOVEMENT_THRESHOLD_M)?,
            tracking_min_distance_m: parse_or("TRACKING_MIN_DISTANCE_M", 100.0)?,
            tracking_min_interval_ms: parse_or("TRACKING_MIN_INTERVAL_MS", 60_000)?,
            attractions_ttl_mins: parse_or("ATTRACTIONS_TTL_MINS", 30)?,
            scores_ttl_mins: parse_or("SCORES_TTL_MINS", 60)?,
            cache_key_precision: key_precision(parse_or("CACHE_KEY_PRECISION", 3)?)?,
            cache_backend: parse_or("CACHE_BACKEND", CacheBackendKind::Sqlite)?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./attraction_cache.db?mode=rwc".to_string()),
            cache_sweep_secs: parse_or("CACHE_SWEEP_SECS", 0)?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        })
    }

    pub fn attractions_ttl_ms(&self) -> i64 {
        (self.attractions_ttl_mins * 60 * 1000) as i64
    }

    pub fn scores_ttl_ms(&self) -> i64 {
        (self.scores_ttl_mins * 60 * 1000) as i64
    }
}

fn key_precision(precision: u32) -> anyhow::Result<u32> {
    if precision > MAX_KEY_PRECISION {
        return Err(anyhow::anyhow!(
            "CACHE_KEY_PRECISION must be at most {}, got {}",
            MAX_KEY_PRECISION,
            precision
        ));
    }
    Ok(precision)
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", name, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Baseline used by unit tests; no network credentials.
    pub fn for_tests() -> Self {
        Config {
            opentripmap_api_key: "test".to_string(),
            opentripmap_base_url: "http://127.0.0.1:9/places/radius".to_string(),
            search_radius_m: 5000,
            max_attractions: 50,
            openweather_api_key: None,
            openweather_base_url: "http://127.0.0.1:9".to_string(),
            openweather_geocode_reverse_path: "/geo/1.0/reverse".to_string(),
            openrouter_api_key: None,
            openrouter_base_url: "http://127.0.0.1:9/chat".to_string(),
            or_model: "test-model".to_string(),
            movement_threshold_m: 500.0,
            tracking_min_distance_m: 0.0,
            tracking_min_interval_ms: 0,
            attractions_ttl_mins: 30,
            scores_ttl_mins: 60,
            cache_key_precision: 3,
            cache_backend: CacheBackendKind::Memory,
            database_url: "sqlite::memory:".to_string(),
            cache_sweep_secs: 0,
            bind_addr: "127.0.0.1:0".to_string(),
        }
    }
}
