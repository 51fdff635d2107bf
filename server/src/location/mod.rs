//! Location tracking.
//!
//! `LocationTracker` holds the last accepted fix and moves through three
//! states: `Idle` (nothing yet), `Resolved` (has a fix) and `Tracking`
//! (has a fix and an active subscription). Updates from a subscription are
//! applied in arrival order, and only when they clear the movement
//! threshold relative to the last *accepted* fix.

pub mod geocode;
pub mod provider;

use crate::geo::{is_significant_movement, Coordinates};
use chrono::{DateTime, Utc};
use geocode::{CityInfo, ReverseGeocoder};
use provider::{
    LocationError, LocationProvider, Permission, PositionSubscription, SubscriptionHandle,
    SubscriptionOptions,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerState {
    Idle,
    Resolved,
    Tracking,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationSnapshot {
    pub state: TrackerState,
    pub coordinates: Option<Coordinates>,
    pub city: Option<CityInfo>,
    pub error: Option<LocationError>,
    pub tracking: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    pub movement_threshold_m: f64,
    pub subscription: SubscriptionOptions,
}

#[derive(Default)]
struct TrackerInner {
    coordinates: Option<Coordinates>,
    city: Option<CityInfo>,
    error: Option<LocationError>,
    updated_at: Option<DateTime<Utc>>,
    /// Bumped on every start/stop; updates tagged with an older value are dropped.
    generation: u64,
    subscription: Option<SubscriptionHandle>,
    task: Option<JoinHandle<()>>,
}

impl TrackerInner {
    fn state(&self) -> TrackerState {
        match (self.coordinates, self.subscription.is_some()) {
            (None, _) => TrackerState::Idle,
            (Some(_), false) => TrackerState::Resolved,
            (Some(_), true) => TrackerState::Tracking,
        }
    }

    fn snapshot(&self) -> LocationSnapshot {
        LocationSnapshot {
            state: self.state(),
            coordinates: self.coordinates,
            city: self.city.clone(),
            error: self.error.clone(),
            tracking: self.subscription.is_some(),
            updated_at: self.updated_at,
        }
    }

    fn accept(&mut self, fix: Coordinates) {
        self.coordinates = Some(fix);
        self.city = None;
        self.error = None;
        self.updated_at = Some(Utc::now());
    }
}

struct Shared {
    inner: Mutex<TrackerInner>,
    geocoder: Arc<dyn ReverseGeocoder>,
    snapshots: watch::Sender<LocationSnapshot>,
    movement_threshold_m: f64,
}

impl Shared {
    fn publish(&self, inner: &TrackerInner) {
        self.snapshots.send_replace(inner.snapshot());
    }

    /// Attaches city metadata if `fix` is still the current position.
    async fn attach_city(&self, fix: Coordinates) {
        let city = self.geocoder.lookup(&fix).await;
        if city.is_none() {
            tracing::debug!("No city metadata for {}", fix);
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.coordinates == Some(fix) {
            inner.city = city;
            self.publish(&inner);
        }
    }

    async fn apply_update(&self, generation: u64, fix: Coordinates) -> bool {
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation || inner.subscription.is_none() {
                tracing::debug!("Discarding position update from a stopped subscription");
                return false;
            }

            if !is_significant_movement(inner.coordinates.as_ref(), &fix, self.movement_threshold_m)
            {
                tracing::debug!("Ignoring insignificant movement to {}", fix);
                return false;
            }

            tracing::info!("Accepted position update {}", fix);
            inner.accept(fix);
            self.publish(&inner);
        }

        self.attach_city(fix).await;
        true
    }
}

pub struct LocationTracker {
    provider: Arc<dyn LocationProvider>,
    shared: Arc<Shared>,
    subscription_options: SubscriptionOptions,
}

impl LocationTracker {
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        geocoder: Arc<dyn ReverseGeocoder>,
        settings: TrackerSettings,
    ) -> Self {
        let inner = TrackerInner::default();
        let (snapshots, _) = watch::channel(inner.snapshot());

        Self {
            provider,
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                geocoder,
                snapshots,
                movement_threshold_m: settings.movement_threshold_m,
            }),
            subscription_options: settings.subscription,
        }
    }

    pub async fn snapshot(&self) -> LocationSnapshot {
        self.shared.inner.lock().await.snapshot()
    }

    pub async fn state(&self) -> TrackerState {
        self.shared.inner.lock().await.state()
    }

    pub async fn current(&self) -> Option<Coordinates> {
        self.shared.inner.lock().await.coordinates
    }

    pub fn watch(&self) -> watch::Receiver<LocationSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// One-shot fix from the provider. On failure the error is recorded and
    /// the previous coordinates stay valid.
    pub async fn load_location(&self) -> Result<Coordinates, LocationError> {
        let result = match self.provider.request_permission().await {
            Permission::Denied => Err(LocationError::PermissionDenied),
            Permission::Granted => self.provider.current_position().await,
        };

        let fix = match result {
            Ok(fix) => fix,
            Err(e) => {
                tracing::warn!("Location lookup failed: {}", e);
                self.record_error(e.clone()).await;
                return Err(e);
            }
        };

        {
            let mut inner = self.shared.inner.lock().await;
            inner.accept(fix);
            self.shared.publish(&inner);
        }
        tracing::info!("Resolved location {}", fix);

        self.shared.attach_city(fix).await;
        Ok(fix)
    }

    /// Manual re-trigger; always queries the provider.
    pub async fn refresh_location(&self) -> Result<Coordinates, LocationError> {
        self.load_location().await
    }

    /// Subscribes to position updates. `previous` seeds the comparison
    /// baseline when nothing has been accepted yet; after that each accepted
    /// update becomes the baseline. Restarting replaces the old subscription.
    pub async fn start_tracking(&self, previous: Option<Coordinates>) -> Result<(), LocationError> {
        self.stop_tracking().await;

        if self.provider.request_permission().await == Permission::Denied {
            self.record_error(LocationError::PermissionDenied).await;
            return Err(LocationError::PermissionDenied);
        }

        let PositionSubscription {
            mut updates,
            handle,
        } = match self.provider.subscribe(self.subscription_options).await {
            Ok(sub) => sub,
            Err(e) => {
                tracing::warn!("Could not subscribe to position updates: {}", e);
                self.record_error(e.clone()).await;
                return Err(e);
            }
        };

        let mut inner = self.shared.inner.lock().await;
        inner.generation += 1;
        let generation = inner.generation;
        if inner.coordinates.is_none() {
            inner.coordinates = previous;
        }
        inner.subscription = Some(handle);

        let shared = self.shared.clone();
        inner.task = Some(tokio::spawn(async move {
            while let Some(fix) = updates.recv().await {
                shared.apply_update(generation, fix).await;
            }
            tracing::debug!("Position update stream {} ended", generation);
        }));

        self.shared.publish(&inner);
        tracing::info!("Started location tracking (generation {})", generation);
        Ok(())
    }

    /// Releases the active subscription. Safe to call at any time; once this
    /// returns no pending update can change the tracked position.
    pub async fn stop_tracking(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.generation += 1;

        let had_subscription = inner.subscription.is_some();
        if let Some(handle) = inner.subscription.take() {
            handle.cancel();
        }
        if let Some(task) = inner.task.take() {
            task.abort();
        }

        if had_subscription {
            tracing::info!("Stopped location tracking");
            self.shared.publish(&inner);
        }
    }

    async fn record_error(&self, error: LocationError) {
        let mut inner = self.shared.inner.lock().await;
        inner.error = Some(error);
        self.shared.publish(&inner);
    }
}

impl Drop for LocationTracker {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            if let Some(handle) = inner.subscription.take() {
                handle.cancel();
            }
            if let Some(task) = inner.task.take() {
                task.abort();
            }
        }
    }
}
