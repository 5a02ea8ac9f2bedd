//! Primary/fallback connection routing for the networked store.
//!
//! Every networked store call goes through [`ConnectionBroker::with_connection`].
//! A connectivity failure on the primary endpoint switches the broker to the
//! fallback (once, no matter how many calls fail concurrently) and the failed
//! call is retried there. While on the fallback, successful calls trigger a
//! rate-limited background probe of the primary; a successful probe switches
//! back. Each transition is published on the broker's event bus.

mod postgres;

pub use postgres::PgConnector;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use depot_events::{EventBus, InMemoryEventBus, Subscription};

use crate::store::StoreError;

/// Which configured endpoint a call is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Primary,
    Fallback,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Primary => "primary",
            Endpoint::Fallback => "fallback",
        }
    }
}

/// Published whenever the broker switches endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    StateChanged { on_failover: bool },
}

/// Source of connection handles for each endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Cheap, cloneable handle (a pool, typically).
    type Handle: Clone + Send + Sync + 'static;

    /// Handle for `endpoint`, or `None` when that endpoint is not configured.
    fn handle(&self, endpoint: Endpoint) -> Option<Self::Handle>;

    /// Open a trial connection to the primary endpoint.
    async fn probe_primary(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    /// Minimum spacing between primary probes while on the fallback.
    pub probe_interval: Duration,
    /// When set, never probe and never switch back automatically.
    pub sticky_fallback: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(20),
            sticky_fallback: false,
        }
    }
}

impl BrokerConfig {
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_sticky_fallback(mut self, sticky: bool) -> Self {
        self.sticky_fallback = sticky;
        self
    }
}

#[derive(Debug)]
struct ConnectionState {
    active: Endpoint,
    next_probe_at: Instant,
    probe_in_flight: bool,
}

struct BrokerInner<C: Connector> {
    connector: C,
    state: Mutex<ConnectionState>,
    probe_interval: Duration,
    sticky: AtomicBool,
    closed: AtomicBool,
    shutdown: Notify,
    events: InMemoryEventBus<BrokerEvent>,
}

/// Routes store calls to the primary endpoint, failing over to the fallback.
///
/// Cloning is cheap; clones share state.
pub struct ConnectionBroker<C: Connector> {
    inner: Arc<BrokerInner<C>>,
}

impl<C: Connector> Clone for ConnectionBroker<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionBroker<C> {
    pub fn new(connector: C, config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                connector,
                state: Mutex::new(ConnectionState {
                    active: Endpoint::Primary,
                    next_probe_at: Instant::now(),
                    probe_in_flight: false,
                }),
                probe_interval: config.probe_interval,
                sticky: AtomicBool::new(config.sticky_fallback),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
                events: InMemoryEventBus::new(),
            }),
        }
    }

    /// Run `work` against the active endpoint.
    ///
    /// A connectivity failure on the primary switches to the fallback and
    /// retries `work` there once. Any failure on the fallback, and any
    /// non-connectivity failure, propagates unchanged.
    pub async fn with_connection<T, F, Fut>(&self, work: F) -> Result<T, StoreError>
    where
        F: Fn(C::Handle) -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let endpoint = self.active_endpoint();
        let handle = self.handle(endpoint)?;

        match work(handle).await {
            Ok(value) => {
                self.after_success(endpoint);
                Ok(value)
            }
            Err(err) if endpoint == Endpoint::Primary && err.is_connectivity() && self.has_fallback() => {
                warn!(error = %err, "primary endpoint unreachable");
                self.fail_over();

                let fallback = self.handle(Endpoint::Fallback)?;
                let value = work(fallback).await?;
                self.after_success(Endpoint::Fallback);
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    pub fn active_endpoint(&self) -> Endpoint {
        self.inner.lock_state().active
    }

    /// Connectivity flag for consumers.
    pub fn is_on_failover(&self) -> bool {
        self.active_endpoint() == Endpoint::Fallback
    }

    pub fn set_sticky_fallback(&self, sticky: bool) {
        self.inner.sticky.store(sticky, Ordering::SeqCst);
    }

    pub fn is_sticky_fallback(&self) -> bool {
        self.inner.sticky.load(Ordering::SeqCst)
    }

    /// Subscribe to state-change notifications.
    pub fn subscribe(&self) -> Subscription<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Stop background probing. In-flight probes are cancelled.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
    }

    fn has_fallback(&self) -> bool {
        self.inner.connector.handle(Endpoint::Fallback).is_some()
    }

    fn handle(&self, endpoint: Endpoint) -> Result<C::Handle, StoreError> {
        self.inner
            .connector
            .handle(endpoint)
            .ok_or_else(|| StoreError::Config(format!("no {} endpoint configured", endpoint.as_str())))
    }

    fn fail_over(&self) {
        let switched = {
            let mut state = self.inner.lock_state();
            if state.active == Endpoint::Primary {
                state.active = Endpoint::Fallback;
                state.next_probe_at = Instant::now() + self.inner.probe_interval;
                true
            } else {
                false
            }
        };

        if switched {
            warn!("switched to fallback endpoint");
            self.inner.publish(BrokerEvent::StateChanged { on_failover: true });
        }
    }

    fn after_success(&self, endpoint: Endpoint) {
        if endpoint == Endpoint::Fallback {
            self.maybe_probe();
        }
    }

    /// Launch a background probe of the primary if one is due.
    fn maybe_probe(&self) {
        if self.is_sticky_fallback() || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        {
            let mut state = self.inner.lock_state();
            if state.active != Endpoint::Fallback
                || state.probe_in_flight
                || Instant::now() < state.next_probe_at
            {
                return;
            }
            state.probe_in_flight = true;
        }

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move { inner.probe_primary().await });
    }
}

impl<C: Connector> BrokerInner<C> {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: BrokerEvent) {
        if let Err(err) = self.events.publish(event) {
            warn!(error = ?err, "failed to publish broker state change");
        }
    }

    async fn probe_primary(self: Arc<Self>) {
        debug!("probing primary endpoint");
        let result = tokio::select! {
            _ = self.shutdown.notified() => {
                self.lock_state().probe_in_flight = false;
                return;
            }
            result = self.connector.probe_primary() => result,
        };

        let recovered = {
            let mut state = self.lock_state();
            state.probe_in_flight = false;
            match result {
                Ok(())
                    if state.active == Endpoint::Fallback
                        && !self.closed.load(Ordering::SeqCst)
                        && !self.sticky.load(Ordering::SeqCst) =>
                {
                    state.active = Endpoint::Primary;
                    true
                }
                Ok(()) => false,
                Err(err) => {
                    debug!(error = %err, "primary endpoint still unreachable");
                    state.next_probe_at = Instant::now() + self.probe_interval;
                    false
                }
            }
        };

        if recovered {
            info!("primary endpoint recovered; switched back");
            self.publish(BrokerEvent::StateChanged { on_failover: false });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Endpoints are their own handles; the primary can be taken down.
    struct FakeConnector {
        primary_up: AtomicBool,
        with_fallback: bool,
        probes: AtomicUsize,
    }

    impl FakeConnector {
        fn new(primary_up: bool) -> Self {
            Self {
                primary_up: AtomicBool::new(primary_up),
                with_fallback: true,
                probes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Handle = Endpoint;

        fn handle(&self, endpoint: Endpoint) -> Option<Endpoint> {
            match endpoint {
                Endpoint::Fallback if !self.with_fallback => None,
                other => Some(other),
            }
        }

        async fn probe_primary(&self) -> Result<(), StoreError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.primary_up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Connectivity("refused".into()))
            }
        }
    }

    fn broker(connector: FakeConnector, probe_interval: Duration) -> ConnectionBroker<FakeConnector> {
        ConnectionBroker::new(
            connector,
            BrokerConfig::default().with_probe_interval(probe_interval),
        )
    }

    /// Simulated query: fails with a connectivity error on a downed primary.
    async fn query(broker: &ConnectionBroker<FakeConnector>, endpoint: Endpoint) -> Result<Endpoint, StoreError> {
        tokio::task::yield_now().await;
        if endpoint == Endpoint::Primary && !broker.inner.connector.primary_up.load(Ordering::SeqCst) {
            return Err(StoreError::Connectivity("connection refused".into()));
        }
        Ok(endpoint)
    }

    async fn wait_for_primary_check(broker: &ConnectionBroker<FakeConnector>) {
        for _ in 0..100 {
            if !broker.inner.lock_state().probe_in_flight {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn healthy_primary_is_used() {
        let b = broker(FakeConnector::new(true), Duration::from_secs(20));
        let used = b.with_connection(|ep| query(&b, ep)).await.unwrap();
        assert_eq!(used, Endpoint::Primary);
        assert!(!b.is_on_failover());
    }

    #[tokio::test]
    async fn connectivity_failure_retries_on_fallback() {
        let b = broker(FakeConnector::new(false), Duration::from_secs(20));
        let sub = b.subscribe();

        let used = b.with_connection(|ep| query(&b, ep)).await.unwrap();
        assert_eq!(used, Endpoint::Fallback);
        assert!(b.is_on_failover());
        assert_eq!(sub.drain(), vec![BrokerEvent::StateChanged { on_failover: true }]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failures_fail_over_once() {
        let b = broker(FakeConnector::new(false), Duration::from_secs(20));
        let sub = b.subscribe();
        let start = Arc::new(tokio::sync::Barrier::new(3));

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let b = b.clone();
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    b.with_connection(|ep| query(&b, ep)).await
                })
            })
            .collect();

        for call in calls {
            assert_eq!(call.await.unwrap().unwrap(), Endpoint::Fallback);
        }
        assert!(b.is_on_failover());
        assert_eq!(sub.drain(), vec![BrokerEvent::StateChanged { on_failover: true }]);
    }

    #[tokio::test]
    async fn non_connectivity_error_does_not_fail_over() {
        let b = broker(FakeConnector::new(true), Duration::from_secs(20));
        let err = b
            .with_connection(|_ep| async { Err::<(), _>(StoreError::Database("syntax error".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        assert!(!b.is_on_failover());
    }

    #[tokio::test]
    async fn failure_on_fallback_propagates() {
        let b = broker(FakeConnector::new(false), Duration::from_secs(20));
        b.with_connection(|ep| query(&b, ep)).await.unwrap();

        let err = b
            .with_connection(|_ep| async { Err::<(), _>(StoreError::Connectivity("down too".into())) })
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
        assert!(b.is_on_failover());
    }

    #[tokio::test]
    async fn missing_fallback_propagates_primary_error() {
        let mut connector = FakeConnector::new(false);
        connector.with_fallback = false;
        let b = broker(connector, Duration::from_secs(20));

        let err = b.with_connection(|ep| query(&b, ep)).await.unwrap_err();
        assert!(err.is_connectivity());
        assert!(!b.is_on_failover());
    }

    #[tokio::test]
    async fn primary_recovery_switches_back() {
        let b = broker(FakeConnector::new(false), Duration::ZERO);
        let sub = b.subscribe();
        b.with_connection(|ep| query(&b, ep)).await.unwrap();
        assert!(b.is_on_failover());

        b.inner.connector.primary_up.store(true, Ordering::SeqCst);
        b.with_connection(|ep| query(&b, ep)).await.unwrap();
        wait_for_primary_check(&b).await;

        assert!(!b.is_on_failover());
        assert_eq!(
            sub.drain(),
            vec![
                BrokerEvent::StateChanged { on_failover: true },
                BrokerEvent::StateChanged { on_failover: false },
            ]
        );
    }

    #[tokio::test]
    async fn primary_checks_are_rate_limited() {
        let b = broker(FakeConnector::new(false), Duration::from_secs(3600));
        b.with_connection(|ep| query(&b, ep)).await.unwrap();
        for _ in 0..5 {
            b.with_connection(|ep| query(&b, ep)).await.unwrap();
        }
        wait_for_primary_check(&b).await;
        assert_eq!(b.inner.connector.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sticky_fallback_never_retries_primary() {
        let b = broker(FakeConnector::new(false), Duration::ZERO);
        b.set_sticky_fallback(true);
        b.with_connection(|ep| query(&b, ep)).await.unwrap();

        b.inner.connector.primary_up.store(true, Ordering::SeqCst);
        b.with_connection(|ep| query(&b, ep)).await.unwrap();
        wait_for_primary_check(&b).await;

        assert!(b.is_on_failover());
        assert_eq!(b.inner.connector.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_probing() {
        let b = broker(FakeConnector::new(false), Duration::ZERO);
        b.with_connection(|ep| query(&b, ep)).await.unwrap();
        b.shutdown();

        b.inner.connector.primary_up.store(true, Ordering::SeqCst);
        b.with_connection(|ep| query(&b, ep)).await.unwrap();
        assert!(b.is_on_failover());
        assert_eq!(b.inner.connector.probes.load(Ordering::SeqCst), 0);
    }
}
