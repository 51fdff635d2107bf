use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    attractions::{types::Attraction, SourceError},
    context::AppContext,
    geo::Coordinates,
    location::{provider::LocationError, LocationSnapshot},
    relevance::merge::NEUTRAL_SCORE,
};

// Request/Response types
#[derive(Debug, Deserialize)]
pub struct AttractionsQuery {
    pub lat: f64,
    pub lon: f64,
    pub interests: Option<String>,
    #[serde(default)]
    pub rank: bool,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverQuery {
    pub interests: Option<String>,
    #[serde(default)]
    pub rank: bool,
}

#[derive(Debug, Deserialize)]
pub struct PermissionRequest {
    pub granted: bool,
}

#[derive(Debug, Deserialize)]
pub struct FixRequest {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartTrackingRequest {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InterestsBody {
    pub interests: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct FixResponse {
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
pub struct AttractionsResponse {
    pub location: Coordinates,
    pub attractions: Vec<Attraction>,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Error surfaced to the client with a status it can act on (e.g. retry).
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<LocationError> for ApiError {
    fn from(e: LocationError) -> Self {
        let status = match e {
            LocationError::PermissionDenied => StatusCode::FORBIDDEN,
            LocationError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<SourceError> for ApiError {
    fn from(e: SourceError) -> Self {
        let status = match e {
            SourceError::InvalidCoordinates => StatusCode::BAD_REQUEST,
            SourceError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_GATEWAY,
        };
        tracing::error!("Attraction lookup failed: {}", e);
        Self {
            status,
            message: e.to_string(),
        }
    }
}

pub fn create_router(state: AppContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/location", get(get_location))
        .route("/location/permission", post(set_permission))
        .route("/location/fix", post(report_fix))
        .route("/location/refresh", post(refresh_location))
        .route("/tracking/start", post(start_tracking))
        .route("/tracking/stop", post(stop_tracking))
        .route("/attractions", get(get_attractions))
        .route("/discover", get(discover))
        .route("/interests", get(get_interests).put(put_interests))
        .route("/cache", delete(clear_cache))
        .with_state(state)
}

// Route handlers
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn get_location(State(state): State<AppContext>) -> Json<LocationSnapshot> {
    Json(state.tracker.snapshot().await)
}

pub async fn set_permission(
    State(state): State<AppContext>,
    Json(body): Json<PermissionRequest>,
) -> Json<LocationSnapshot> {
    state.provider.set_permission(body.granted).await;
    if !body.granted {
        state.tracker.stop_tracking().await;
    }
    Json(state.tracker.snapshot().await)
}

pub async fn report_fix(
    State(state): State<AppContext>,
    Json(body): Json<FixRequest>,
) -> Result<Json<FixResponse>, ApiError> {
    let fix = Coordinates::new(body.lat, body.lon);
    fix.validate().map_err(bad_request)?;

    let delivered = state.provider.push_fix(fix).await?;
    Ok(Json(FixResponse { delivered }))
}

pub async fn refresh_location(
    State(state): State<AppContext>,
) -> Result<Json<LocationSnapshot>, ApiError> {
    state.tracker.refresh_location().await?;
    Ok(Json(state.tracker.snapshot().await))
}

pub async fn start_tracking(
    State(state): State<AppContext>,
    body: Option<Json<StartTrackingRequest>>,
) -> Result<Json<LocationSnapshot>, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let previous = match (request.lat, request.lon) {
        (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
        _ => None,
    };
    if let Some(prev) = previous {
        prev.validate().map_err(bad_request)?;
    }

    state.tracker.start_tracking(previous).await?;
    Ok(Json(state.tracker.snapshot().await))
}

pub async fn stop_tracking(State(state): State<AppContext>) -> Json<LocationSnapshot> {
    state.tracker.stop_tracking().await;
    Json(state.tracker.snapshot().await)
}

pub async fn get_attractions(
    State(state): State<AppContext>,
    Query(params): Query<AttractionsQuery>,
) -> Result<Json<AttractionsResponse>, ApiError> {
    let location = Coordinates::new(params.lat, params.lon);
    location.validate().map_err(bad_request)?;

    let interests = params.interests.as_deref().map(parse_interests);
    let attractions = state.discover(&location, interests.as_deref()).await?;

    Ok(Json(AttractionsResponse {
        location,
        attractions: maybe_rank(attractions, params.rank),
        generated_at: chrono::Utc::now(),
    }))
}

/// Attractions around the tracker's current position, resolving one first
/// if nothing is known yet.
pub async fn discover(
    State(state): State<AppContext>,
    Query(params): Query<DiscoverQuery>,
) -> Result<Json<AttractionsResponse>, ApiError> {
    let location = match state.tracker.current().await {
        Some(location) => location,
        None => state.tracker.load_location().await?,
    };

    let interests = params.interests.as_deref().map(parse_interests);
    let attractions = state.discover(&location, interests.as_deref()).await?;

    Ok(Json(AttractionsResponse {
        location,
        attractions: maybe_rank(attractions, params.rank),
        generated_at: chrono::Utc::now(),
    }))
}

pub async fn get_interests(State(state): State<AppContext>) -> Json<InterestsBody> {
    Json(InterestsBody {
        interests: state.relevance.interests().await,
    })
}

pub async fn put_interests(
    State(state): State<AppContext>,
    Json(body): Json<InterestsBody>,
) -> Json<InterestsBody> {
    Json(InterestsBody {
        interests: state.relevance.set_interests(&body.interests).await,
    })
}

pub async fn clear_cache(State(state): State<AppContext>) -> StatusCode {
    if state.cache.clear().await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn bad_request(message: String) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message,
    }
}

pub fn parse_interests(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Display ordering only: highest interest first, ties keep discovery order.
pub fn maybe_rank(mut attractions: Vec<Attraction>, rank: bool) -> Vec<Attraction> {
    if rank {
        attractions.sort_by(|a, b| {
            let a = a.interest_score.unwrap_or(NEUTRAL_SCORE);
            let b = b.interest_score.unwrap_or(NEUTRAL_SCORE);
            b.total_cmp(&a)
        });
    }
    attractions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;

    #[test]
    fn test_parse_interests() {
        assert_eq!(parse_interests("art, food,,  "), vec!["art", "food"]);
        assert!(parse_interests("").is_empty());
    }

    #[tokio::test]
    async fn test_get_attractions_ranked() {
        let state = context(false);
        let Json(response) = get_attractions(
            State(state),
            Query(AttractionsQuery {
                lat: 52.52,
                lon: 13.40,
                interests: Some("books".to_string()),
                rank: true,
            }),
        )
        .await
        .unwrap();

        let names: Vec<_> = response.attractions.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Old Library", "Skate Park"]);
    }

    #[tokio::test]
    async fn test_get_attractions_rejects_bad_coordinates() {
        let err = get_attractions(
            State(context(false)),
            Query(AttractionsQuery {
                lat: 95.0,
                lon: 13.40,
                interests: None,
                rank: false,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_discover_requires_permission() {
        let err = discover(
            State(context(false)),
            Query(DiscoverQuery {
                interests: None,
                rank: false,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_reported_fix_drives_discovery() {
        let state = context(false);
        set_permission(State(state.clone()), Json(PermissionRequest { granted: true })).await;
        report_fix(
            State(state.clone()),
            Json(FixRequest {
                lat: 52.52,
                lon: 13.40,
            }),
        )
        .await
        .unwrap();

        let Json(response) = discover(
            State(state.clone()),
            Query(DiscoverQuery {
                interests: None,
                rank: false,
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.location, Coordinates::new(52.52, 13.40));
        assert_eq!(response.attractions.len(), 2);
        assert_eq!(state.tracker.snapshot().await.city.unwrap().name, "Testville");
    }

    #[tokio::test]
    async fn test_report_fix_rejects_bad_coordinates() {
        let state = context(false);
        set_permission(State(state.clone()), Json(PermissionRequest { granted: true })).await;

        let err = report_fix(
            State(state.clone()),
            Json(FixRequest {
                lat: 52.52,
                lon: 181.0,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(state.tracker.snapshot().await.coordinates, None);
    }

    #[tokio::test]
    async fn test_tracking_start_stop_roundtrip() {
        let state = context(false);
        let denied = start_tracking(State(state.clone()), None).await.unwrap_err();
        assert_eq!(denied.status, StatusCode::FORBIDDEN);

        set_permission(State(state.clone()), Json(PermissionRequest { granted: true })).await;
        let Json(snapshot) = start_tracking(
            State(state.clone()),
            Some(Json(StartTrackingRequest {
                lat: Some(52.0),
                lon: Some(13.0),
            })),
        )
        .await
        .unwrap();
        assert!(snapshot.tracking);

        let Json(snapshot) = stop_tracking(State(state.clone())).await;
        assert!(!snapshot.tracking);
        let Json(snapshot) = stop_tracking(State(state)).await;
        assert!(!snapshot.tracking);
    }

    #[test]
    fn test_rank_is_stable_for_unscored() {
        let attraction = |name: &str, score: Option<f64>| Attraction {
            id: crate::attractions::types::AttractionId::Text(name.to_string()),
            name: name.to_string(),
            coordinates: Coordinates::new(0.0, 0.0),
            category: "other".to_string(),
            distance: 0.0,
            rating: 0.0,
            interest_score: score,
            interest_reason: None,
        };
        let ranked = maybe_rank(
            vec![
                attraction("a", None),
                attraction("b", Some(9.0)),
                attraction("c", None),
                attraction("d", Some(1.0)),
            ],
            true,
        );
        let names: Vec<_> = ranked.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c", "d"]);
    }
}
