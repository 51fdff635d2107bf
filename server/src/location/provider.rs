use crate::cache::Clock;
use crate::geo::{distance_meters, Coordinates};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

const SUBSCRIPTION_BUFFER: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,
    #[error("Location provider unavailable: {0}")]
    ProviderUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriptionOptions {
    pub min_distance_m: f64,
    pub min_interval_ms: u64,
}

/// Cancels a position subscription. Cancelling twice is fine.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionHandle {
    cancelled: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Ordered stream of fixes plus the handle that stops it.
pub struct PositionSubscription {
    pub updates: mpsc::Receiver<Coordinates>,
    pub handle: SubscriptionHandle,
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn request_permission(&self) -> Permission;
    async fn current_position(&self) -> Result<Coordinates, LocationError>;
    async fn subscribe(
        &self,
        options: SubscriptionOptions,
    ) -> Result<PositionSubscription, LocationError>;
}

struct Subscriber {
    sender: mpsc::Sender<Coordinates>,
    handle: SubscriptionHandle,
    options: SubscriptionOptions,
    last_forwarded: Option<(Coordinates, i64)>,
}

impl Subscriber {
    fn wants(&self, fix: &Coordinates, now_ms: i64) -> bool {
        match self.last_forwarded {
            None => true,
            Some((prev, at)) => {
                distance_meters(&prev, fix) >= self.options.min_distance_m
                    && now_ms - at >= self.options.min_interval_ms as i64
            }
        }
    }
}

#[derive(Default)]
struct PushState {
    permission_granted: bool,
    latest: Option<Coordinates>,
    subscribers: Vec<Subscriber>,
}

/// Provider fed by fixes the client reports. Keeps the latest fix for
/// one-shot queries and forwards throttled fixes to subscribers.
pub struct PushLocationProvider {
    state: Mutex<PushState>,
    clock: Arc<dyn Clock>,
}

impl PushLocationProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(PushState::default()),
            clock,
        }
    }

    pub async fn set_permission(&self, granted: bool) {
        let mut state = self.state.lock().await;
        state.permission_granted = granted;
        if !granted {
            for sub in state.subscribers.drain(..) {
                sub.handle.cancel();
            }
        }
    }

    /// Records a fix and fans it out. Returns how many subscribers received it.
    pub async fn push_fix(&self, fix: Coordinates) -> Result<usize, LocationError> {
        if let Err(e) = fix.validate() {
            return Err(LocationError::ProviderUnavailable(e));
        }

        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        if !state.permission_granted {
            return Err(LocationError::PermissionDenied);
        }
        state.latest = Some(fix);

        state
            .subscribers
            .retain(|s| !s.handle.is_cancelled() && !s.sender.is_closed());

        let mut delivered = 0;
        for sub in state.subscribers.iter_mut() {
            if !sub.wants(&fix, now) {
                continue;
            }
            match sub.sender.try_send(fix) {
                Ok(()) => {
                    sub.last_forwarded = Some((fix, now));
                    delivered += 1;
                }
                Err(e) => tracing::warn!("Dropping position update for slow subscriber: {}", e),
            }
        }
        Ok(delivered)
    }

    pub async fn active_subscriptions(&self) -> usize {
        self.state
            .lock()
            .await
            .subscribers
            .iter()
            .filter(|s| !s.handle.is_cancelled() && !s.sender.is_closed())
            .count()
    }
}

#[async_trait]
impl LocationProvider for PushLocationProvider {
    async fn request_permission(&self) -> Permission {
        if self.state.lock().await.permission_granted {
            Permission::Granted
        } else {
            Permission::Denied
        }
    }

    async fn current_position(&self) -> Result<Coordinates, LocationError> {
        let state = self.state.lock().await;
        if !state.permission_granted {
            return Err(LocationError::PermissionDenied);
        }
        state
            .latest
            .ok_or_else(|| LocationError::ProviderUnavailable("no fix reported yet".to_string()))
    }

    async fn subscribe(
        &self,
        options: SubscriptionOptions,
    ) -> Result<PositionSubscription, LocationError> {
        let mut state = self.state.lock().await;
        if !state.permission_granted {
            return Err(LocationError::PermissionDenied);
        }

        let (sender, updates) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let handle = SubscriptionHandle::new();
        state.subscribers.push(Subscriber {
            sender,
            handle: handle.clone(),
            options,
            last_forwarded: None,
        });

        Ok(PositionSubscription { updates, handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;

    fn provider() -> (PushLocationProvider, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (PushLocationProvider::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_denied_until_granted() {
        let (provider, _) = provider();
        assert_eq!(provider.request_permission().await, Permission::Denied);
        assert_eq!(
            provider.push_fix(Coordinates::new(1.0, 1.0)).await,
            Err(LocationError::PermissionDenied)
        );

        provider.set_permission(true).await;
        assert_eq!(provider.request_permission().await, Permission::Granted);
        assert!(matches!(
            provider.current_position().await,
            Err(LocationError::ProviderUnavailable(_))
        ));

        provider.push_fix(Coordinates::new(1.0, 1.0)).await.unwrap();
        assert_eq!(provider.current_position().await, Ok(Coordinates::new(1.0, 1.0)));
    }

    #[tokio::test]
    async fn test_subscription_throttles_by_distance_and_interval() {
        let (provider, clock) = provider();
        provider.set_permission(true).await;
        let mut sub = provider
            .subscribe(SubscriptionOptions {
                min_distance_m: 100.0,
                min_interval_ms: 1000,
            })
            .await
            .unwrap();

        let origin = Coordinates::new(52.0, 13.0);
        let close = Coordinates::new(52.0001, 13.0);
        let far = Coordinates::new(52.01, 13.0);

        assert_eq!(provider.push_fix(origin).await.unwrap(), 1);
        clock.advance(5000);
        assert_eq!(provider.push_fix(close).await.unwrap(), 0);
        assert_eq!(provider.push_fix(far).await.unwrap(), 1);
        clock.advance(10);
        assert_eq!(provider.push_fix(Coordinates::new(52.5, 13.0)).await.unwrap(), 0);

        assert_eq!(sub.updates.recv().await, Some(origin));
        assert_eq!(sub.updates.recv().await, Some(far));
        assert!(sub.updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_subscription_is_pruned() {
        let (provider, _) = provider();
        provider.set_permission(true).await;
        let sub = provider
            .subscribe(SubscriptionOptions {
                min_distance_m: 0.0,
                min_interval_ms: 0,
            })
            .await
            .unwrap();
        assert_eq!(provider.active_subscriptions().await, 1);

        sub.handle.cancel();
        sub.handle.cancel();
        assert_eq!(provider.active_subscriptions().await, 0);
        assert_eq!(provider.push_fix(Coordinates::new(0.0, 0.0)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_revoking_permission_cancels_subscriptions() {
        let (provider, _) = provider();
        provider.set_permission(true).await;
        let sub = provider
            .subscribe(SubscriptionOptions {
                min_distance_m: 0.0,
                min_interval_ms: 0,
            })
            .await
            .unwrap();

        provider.set_permission(false).await;
        assert!(sub.handle.is_cancelled());
        assert_eq!(provider.active_subscriptions().await, 0);
    }
}
