use crate::attractions::opentripmap::OpenTripMapClient;
use crate::attractions::types::Attraction;
use crate::attractions::{AttractionAggregator, AttractionSource, SourceError};
use crate::cache::backend::{KvBackend, MemoryBackend, SqliteBackend};
use crate::cache::{ExpiringCache, SystemClock};
use crate::config::{CacheBackendKind, Config};
use crate::geo::Coordinates;
use crate::location::geocode::{OpenWeatherGeocoder, ReverseGeocoder};
use crate::location::provider::{PushLocationProvider, SubscriptionOptions};
use crate::location::{LocationTracker, TrackerSettings};
use crate::relevance::classifier::{Classifier, OpenRouterClassifier};
use crate::relevance::RelevanceService;
use std::sync::Arc;

/// Everything a request handler needs, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub cache: ExpiringCache,
    pub provider: Arc<PushLocationProvider>,
    pub tracker: Arc<LocationTracker>,
    pub aggregator: Arc<AttractionAggregator>,
    pub relevance: Arc<RelevanceService>,
}

pub struct Collaborators {
    pub backend: Arc<dyn KvBackend>,
    pub source: Arc<dyn AttractionSource>,
    pub geocoder: Arc<dyn ReverseGeocoder>,
    pub classifier: Arc<dyn Classifier>,
}

impl AppContext {
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let backend: Arc<dyn KvBackend> = match config.cache_backend {
            CacheBackendKind::Sqlite => {
                let pool = sqlx::SqlitePool::connect(&config.database_url).await?;
                let sqlite = SqliteBackend::new(pool);
                sqlite.init_tables().await?;
                sqlite.health_check().await?;
                tracing::info!("Using SQLite cache at {}", config.database_url);
                Arc::new(sqlite)
            }
            CacheBackendKind::Memory => {
                tracing::info!("Using in-memory cache");
                Arc::new(MemoryBackend::new())
            }
        };

        let collaborators = Collaborators {
            backend,
            source: Arc::new(OpenTripMapClient::new(config.clone())?),
            geocoder: Arc::new(OpenWeatherGeocoder::new(config.clone())?),
            classifier: Arc::new(OpenRouterClassifier::new(config.clone())?),
        };

        if config.openrouter_api_key.is_none() {
            tracing::warn!("OPENROUTER_API_KEY not set, relevance scoring disabled");
        }
        if config.openweather_api_key.is_none() {
            tracing::warn!("OPENWEATHER_API_KEY not set, city lookup disabled");
        }

        Ok(Self::assemble(config, collaborators))
    }

    pub fn assemble(config: Config, collaborators: Collaborators) -> Self {
        let cache = ExpiringCache::with_clock(collaborators.backend, Arc::new(SystemClock));
        let provider = Arc::new(PushLocationProvider::new(Arc::new(SystemClock)));

        let tracker = LocationTracker::new(
            provider.clone(),
            collaborators.geocoder,
            TrackerSettings {
                movement_threshold_m: config.movement_threshold_m,
                subscription: SubscriptionOptions {
                    min_distance_m: config.tracking_min_distance_m,
                    min_interval_ms: config.tracking_min_interval_ms,
                },
            },
        );

        let aggregator = AttractionAggregator::new(
            cache.clone(),
            collaborators.source,
            config.attractions_ttl_ms(),
            config.cache_key_precision,
        );

        let relevance = RelevanceService::new(
            cache.clone(),
            collaborators.classifier,
            config.scores_ttl_ms(),
            config.cache_key_precision,
        );

        Self {
            config: Arc::new(config),
            cache,
            provider,
            tracker: Arc::new(tracker),
            aggregator: Arc::new(aggregator),
            relevance: Arc::new(relevance),
        }
    }

    /// Attractions around `at` with the relevance overlay applied. Falls back
    /// to stored interests when none are given.
    pub async fn discover(
        &self,
        at: &Coordinates,
        interests: Option<&[String]>,
    ) -> Result<Vec<Attraction>, SourceError> {
        let attractions = self.aggregator.load_attractions(at).await?;

        let interests = match interests {
            Some(list) => list.to_vec(),
            None => self.relevance.interests().await,
        };

        Ok(self
            .relevance
            .score_attractions(at, attractions, &interests)
            .await)
    }
}
