pub mod opentripmap;
pub mod types;

use crate::cache::ExpiringCache;
use crate::geo::{distance_meters, Coordinates};
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use types::{Attraction, Candidate};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("JSON parsing failed: {0}")]
    JsonParsing(#[from] serde_json::Error),
    #[error("Rate limited, retry after: {0}s")]
    RateLimited(u64),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Invalid coordinates")]
    InvalidCoordinates,
}

/// Live provider of candidate points of interest around a position.
#[async_trait]
pub trait AttractionSource: Send + Sync {
    async fn fetch(&self, at: &Coordinates) -> Result<Vec<Candidate>, SourceError>;
}

pub struct AttractionAggregator {
    cache: ExpiringCache,
    source: Arc<dyn AttractionSource>,
    ttl_ms: i64,
    key_precision: u32,
    in_flight: Cache<String, Arc<Vec<Attraction>>>,
}

impl AttractionAggregator {
    pub fn new(
        cache: ExpiringCache,
        source: Arc<dyn AttractionSource>,
        ttl_ms: i64,
        key_precision: u32,
    ) -> Self {
        let in_flight = Cache::builder()
            .max_capacity(1000)
            .time_to_live(Duration::from_secs(60))
            .build();

        Self {
            cache,
            source,
            ttl_ms,
            key_precision,
            in_flight,
        }
    }

    pub fn cache_key(&self, at: &Coordinates) -> String {
        format!("attractions:{}", at.bucket_key(self.key_precision))
    }

    /// Cache-first lookup of the attractions around `at`, sorted nearest first.
    pub async fn load_attractions(&self, at: &Coordinates) -> Result<Vec<Attraction>, SourceError> {
        if at.validate().is_err() {
            return Err(SourceError::InvalidCoordinates);
        }

        let key = self.cache_key(at);
        if let Some(cached) = self.cache.get_cached::<Vec<Attraction>>(&key).await {
            tracing::debug!("Attraction cache hit for {} ({} items)", key, cached.len());
            return Ok(cached);
        }

        // Concurrent misses on one bucket share a single fetch. The entry is
        // dropped right after so this never acts as a second cache tier.
        let result = self
            .in_flight
            .try_get_with(key.clone(), self.fetch_and_store(*at, &key))
            .await;
        self.in_flight.invalidate(&key).await;

        match result {
            Ok(list) => Ok(list.as_ref().clone()),
            Err(shared) => Err(unshare_error(shared)),
        }
    }

    async fn fetch_and_store(
        &self,
        at: Coordinates,
        key: &str,
    ) -> Result<Arc<Vec<Attraction>>, SourceError> {
        tracing::info!("Fetching attractions for {} from live source", at);
        let candidates = self.source.fetch(&at).await?;

        let mut attractions: Vec<Attraction> = candidates
            .into_iter()
            .map(|c| {
                let distance = distance_meters(&at, &c.coordinates);
                c.into_attraction(distance)
            })
            .collect();
        attractions.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        if !self.cache.set_cached(key, &attractions, self.ttl_ms).await {
            tracing::warn!("Could not cache attractions for {}", key);
        }

        Ok(Arc::new(attractions))
    }
}

/// Every caller that joined a failed fetch gets the same variant back, so a
/// shared rate limit still reads as a rate limit.
fn unshare_error(shared: Arc<SourceError>) -> SourceError {
    match Arc::try_unwrap(shared) {
        Ok(e) => e,
        Err(shared) => match &*shared {
            SourceError::RateLimited(secs) => SourceError::RateLimited(*secs),
            SourceError::InvalidCoordinates => SourceError::InvalidCoordinates,
            SourceError::ApiError(msg) => SourceError::ApiError(msg.clone()),
            other => SourceError::ApiError(other.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::types::AttractionId;
    use super::*;
    use crate::cache::backend::{KvBackend, MemoryBackend, StorageError};
    use crate::cache::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const TTL_MS: i64 = 30 * 60 * 1000;

    struct FakeSource {
        calls: AtomicUsize,
        fail: AtomicBool,
        rate_limited: AtomicBool,
        delay: Duration,
    }

    impl FakeSource {
        fn new() -> Self {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                rate_limited: AtomicBool::new(false),
                delay,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AttractionSource for FakeSource {
        async fn fetch(&self, at: &Coordinates) -> Result<Vec<Candidate>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::ApiError("HTTP 503: unavailable".to_string()));
            }
            if self.rate_limited.load(Ordering::SeqCst) {
                return Err(SourceError::RateLimited(8));
            }
            Ok(vec![
                Candidate {
                    id: AttractionId::Text("far".to_string()),
                    name: "Far Tower".to_string(),
                    coordinates: Coordinates::new(at.latitude + 0.02, at.longitude),
                    category: "towers".to_string(),
                    rating: 4.0,
                },
                Candidate {
                    id: AttractionId::Numeric(7),
                    name: "Near Museum".to_string(),
                    coordinates: Coordinates::new(at.latitude + 0.001, at.longitude),
                    category: "museums".to_string(),
                    rating: 12.0,
                },
            ])
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl KvBackend for BrokenBackend {
        async fn read(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Err(StorageError::Io("read-only filesystem".to_string()))
        }
        async fn write(&self, _key: &str, _value: &[u8]) -> Result<(), StorageError> {
            Err(StorageError::Io("read-only filesystem".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Io("read-only filesystem".to_string()))
        }
        async fn keys(&self) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }
    }

    fn aggregator(source: Arc<FakeSource>) -> (AttractionAggregator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = ExpiringCache::with_clock(Arc::new(MemoryBackend::new()), clock.clone());
        (AttractionAggregator::new(cache, source, TTL_MS, 3), clock)
    }

    #[tokio::test]
    async fn test_miss_fetches_and_computes_distance() {
        let source = Arc::new(FakeSource::new());
        let (aggregator, _) = aggregator(source.clone());
        let here = Coordinates::new(52.52, 13.405);

        let list = aggregator.load_attractions(&here).await.unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "Near Museum");
        assert!((list[0].distance - 111.0).abs() < 5.0);
        assert!(list[0].distance < list[1].distance);
        assert_eq!(list[0].rating, 5.0);
        assert!(list.iter().all(|a| a.interest_score.is_none()));
    }

    #[tokio::test]
    async fn test_hit_within_ttl_skips_source() {
        let source = Arc::new(FakeSource::new());
        let (aggregator, clock) = aggregator(source.clone());
        let here = Coordinates::new(52.52, 13.405);

        let first = aggregator.load_attractions(&here).await.unwrap();
        clock.advance(TTL_MS - 1);
        let jittered = Coordinates::new(52.52004, 13.40496);
        let second = aggregator.load_attractions(&jittered).await.unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let source = Arc::new(FakeSource::new());
        let (aggregator, clock) = aggregator(source.clone());
        let here = Coordinates::new(52.52, 13.405);

        aggregator.load_attractions(&here).await.unwrap();
        clock.advance(TTL_MS + 1);
        aggregator.load_attractions(&here).await.unwrap();

        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_source_failure_is_reported_and_not_cached() {
        let source = Arc::new(FakeSource::new());
        source.fail.store(true, Ordering::SeqCst);
        let (aggregator, _) = aggregator(source.clone());
        let here = Coordinates::new(52.52, 13.405);

        let err = aggregator.load_attractions(&here).await.unwrap_err();
        assert!(matches!(err, SourceError::ApiError(_)));

        source.fail.store(false, Ordering::SeqCst);
        assert_eq!(aggregator.load_attractions(&here).await.unwrap().len(), 2);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_coordinates_never_reach_source() {
        let source = Arc::new(FakeSource::new());
        let (aggregator, _) = aggregator(source.clone());

        let err = aggregator
            .load_attractions(&Coordinates::new(0.0, 200.0))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidCoordinates));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let source = Arc::new(FakeSource::with_delay(Duration::from_millis(50)));
        let (aggregator, _) = aggregator(source.clone());
        let here = Coordinates::new(48.8584, 2.2945);

        let (a, b) = tokio::join!(
            aggregator.load_attractions(&here),
            aggregator.load_attractions(&here)
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_failure_keeps_variant_for_every_caller() {
        let source = Arc::new(FakeSource::with_delay(Duration::from_millis(50)));
        source.rate_limited.store(true, Ordering::SeqCst);
        let (aggregator, _) = aggregator(source.clone());
        let here = Coordinates::new(48.8584, 2.2945);

        let (a, b) = tokio::join!(
            aggregator.load_attractions(&here),
            aggregator.load_attractions(&here)
        );

        assert_eq!(source.calls(), 1);
        assert!(matches!(a, Err(SourceError::RateLimited(8))), "{:?}", a);
        assert!(matches!(b, Err(SourceError::RateLimited(8))), "{:?}", b);
    }

    #[test]
    fn test_unshare_error_maps_by_variant() {
        let shared = Arc::new(SourceError::InvalidCoordinates);
        let _other = shared.clone();
        assert!(matches!(unshare_error(shared), SourceError::InvalidCoordinates));

        let shared = Arc::new(SourceError::ApiError("HTTP 500: boom".to_string()));
        let _other = shared.clone();
        match unshare_error(shared) {
            SourceError::ApiError(msg) => assert_eq!(msg, "HTTP 500: boom"),
            e => panic!("unexpected {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_broken_cache_falls_through_to_source() {
        let source = Arc::new(FakeSource::new());
        let cache = ExpiringCache::new(Arc::new(BrokenBackend));
        let aggregator = AttractionAggregator::new(cache, source.clone(), TTL_MS, 3);
        let here = Coordinates::new(52.52, 13.405);

        assert_eq!(aggregator.load_attractions(&here).await.unwrap().len(), 2);
        assert_eq!(aggregator.load_attractions(&here).await.unwrap().len(), 2);
        assert_eq!(source.calls(), 2);
    }
}
