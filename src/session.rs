//! The single logical session with the gateway.
//!
//! `SessionManager` owns the link, runs the event pump and health monitor,
//! and reconnects with exponential backoff when the link drops. Every
//! successful connection gets a new generation number; events and failures
//! from an older generation are ignored.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
//!       ^             |                           |
//!       +-------------+---------------------------+  (failure / disconnect)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ibkr_wire::GatewayRequest;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ProxyError, Result};
use crate::gateway::{GatewayConnector, GatewayEndpoint, GatewayEvents, GatewayLink};
use crate::router::{EventRouter, Reply, RouteOutcome, Untagged};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// `delay(n) = min(base * 2^(n-1), ceiling)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            ceiling: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: GatewayEndpoint,
    /// Bound on opening the socket, and separately on waiting for readiness.
    pub connect_timeout: Duration,
    /// How long a request waits for the session before `NotConnected`.
    pub ensure_timeout: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// Point-in-time view for `/health`.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub endpoint: GatewayEndpoint,
    pub reconnect_attempts: u32,
    pub last_activity: Option<DateTime<Utc>>,
    pub server_version: Option<i32>,
}

struct LinkSlot {
    generation: u64,
    link: Option<Arc<dyn GatewayLink>>,
}

#[derive(Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_link_tasks(&mut self) {
        for handle in [self.pump.take(), self.health.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

pub struct SessionManager {
    config: SessionConfig,
    connector: Arc<dyn GatewayConnector>,
    router: EventRouter,
    state: watch::Sender<ConnectionState>,
    slot: Mutex<LinkSlot>,
    /// Serializes connection attempts.
    connect_gate: tokio::sync::Mutex<()>,
    attempts_completed: AtomicU64,
    last_failure: Mutex<Option<ProxyError>>,
    reconnect_attempts: AtomicU32,
    last_activity: Mutex<Option<DateTime<Utc>>>,
    tasks: Mutex<Tasks>,
    weak_self: Weak<SessionManager>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionManager {
    pub fn new(config: SessionConfig, connector: Arc<dyn GatewayConnector>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            connector,
            router: EventRouter::new(),
            state: watch::channel(ConnectionState::Disconnected).0,
            slot: Mutex::new(LinkSlot {
                generation: 0,
                link: None,
            }),
            connect_gate: tokio::sync::Mutex::new(()),
            attempts_completed: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            last_activity: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let server_version = lock(&self.slot).link.as_ref().map(|l| l.server_version());
        SessionSnapshot {
            state: self.state(),
            endpoint: self.config.endpoint.clone(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            last_activity: *lock(&self.last_activity),
            server_version,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!(from = %prev, to = %next, "session state changed");
        }
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Some(Utc::now());
    }

    fn current_generation(&self) -> u64 {
        lock(&self.slot).generation
    }

    // ========================================================================
    // Connect / Disconnect
    // ========================================================================

    /// Open the link. Concurrent callers share one attempt.
    ///
    /// The attempt runs on its own task: a caller that stops waiting
    /// (timeout, dropped request) leaves it to finish and settle the state.
    pub async fn connect(&self) -> Result<()> {
        let Some(session) = self.weak_self.upgrade() else {
            return Err(ProxyError::NotConnected);
        };
        let seen = self.attempts_completed.load(Ordering::SeqCst);
        tokio::spawn(async move { session.connect_gated(seen).await })
            .await
            .unwrap_or_else(|e| Err(ProxyError::Connection(format!("connect task failed: {e}"))))
    }

    async fn connect_gated(&self, seen: u64) -> Result<()> {
        let _gate = self.connect_gate.lock().await;

        if self.is_connected() {
            return Ok(());
        }
        if self.attempts_completed.load(Ordering::SeqCst) != seen {
            // Someone else just tried while we queued; share their outcome.
            let failure = lock(&self.last_failure).clone();
            return Err(failure.unwrap_or(ProxyError::NotConnected));
        }

        let result = self.establish().await;
        *lock(&self.last_failure) = result.as_ref().err().cloned();
        self.attempts_completed.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn establish(&self) -> Result<()> {
        if self.state() != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting);
        }
        let result = self.open_link().await;
        if let Err(e) = &result {
            tracing::warn!(endpoint = %self.config.endpoint, error = %e, "connection attempt failed");
            if self.state() == ConnectionState::Connecting {
                self.set_state(ConnectionState::Disconnected);
            }
        }
        result
    }

    async fn open_link(&self) -> Result<()> {
        let endpoint = &self.config.endpoint;
        let timeout = self.config.connect_timeout;
        tracing::info!(%endpoint, "connecting to IB gateway");

        self.router.reset_ready();
        let (link, events) = match tokio::time::timeout(timeout, self.connector.connect(endpoint)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ProxyError::Connection(format!(
                    "connect to {endpoint} timed out after {timeout:?}"
                )))
            }
        };

        let generation = {
            let mut slot = lock(&self.slot);
            slot.generation += 1;
            slot.link = Some(Arc::clone(&link));
            slot.generation
        };
        {
            let mut tasks = lock(&self.tasks);
            tasks.abort_link_tasks();
            tasks.pump = Some(self.spawn_pump(generation, events));
        }

        if !self.router.wait_ready(timeout).await {
            tracing::warn!(?timeout, "gateway did not signal readiness, continuing");
        }

        {
            let slot = lock(&self.slot);
            if slot.generation != generation {
                return Err(ProxyError::ConnectionLost);
            }
            self.reconnect_attempts.store(0, Ordering::Relaxed);
            self.set_state(ConnectionState::Connected);
        }
        self.touch();
        lock(&self.tasks).health = Some(self.spawn_health_monitor(generation));

        tracing::info!(
            %endpoint,
            generation,
            server_version = link.server_version(),
            "connected to IB gateway"
        );
        Ok(())
    }

    /// Tear down the link and fail everything outstanding. Idempotent.
    pub async fn disconnect(&self) {
        if let Some(handle) = lock(&self.tasks).reconnect.take() {
            handle.abort();
        }
        let _gate = self.connect_gate.lock().await;

        let link = {
            let mut slot = lock(&self.slot);
            slot.generation += 1;
            self.set_state(ConnectionState::Disconnected);
            slot.link.take()
        };
        lock(&self.tasks).abort_link_tasks();

        if let Some(link) = link {
            link.disconnect().await;
            tracing::info!(endpoint = %self.config.endpoint, "disconnected from IB gateway");
        }
        let failed = self.router.fail_all(ProxyError::ConnectionLost);
        if failed > 0 {
            tracing::info!(failed, "failed outstanding requests on disconnect");
        }
    }

    /// Make sure the session is usable, waiting at most `ensure_timeout`.
    pub async fn ensure_connected(&self) -> Result<()> {
        let wait = self.config.ensure_timeout;
        let attempt = async {
            match self.state() {
                ConnectionState::Connected => Ok(()),
                ConnectionState::Disconnected => self.connect().await,
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    let mut rx = self.state.subscribe();
                    let settled = rx
                        .wait_for(|s| {
                            matches!(s, ConnectionState::Connected | ConnectionState::Disconnected)
                        })
                        .await
                        .map(|s| *s);
                    match settled {
                        Ok(ConnectionState::Connected) => Ok(()),
                        _ => Err(ProxyError::NotConnected),
                    }
                }
            }
        };

        match tokio::time::timeout(wait, attempt).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "session unavailable");
                Err(ProxyError::NotConnected)
            }
            Err(_) => {
                tracing::debug!(?wait, state = %self.state(), "timed out waiting for session");
                Err(ProxyError::NotConnected)
            }
        }
    }

    /// Send on the current link.
    pub async fn send(&self, request: GatewayRequest) -> Result<()> {
        let link = lock(&self.slot).link.clone().ok_or(ProxyError::NotConnected)?;
        link.send(request).await?;
        self.touch();
        Ok(())
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    /// The link of `generation` died. Stale generations are ignored.
    fn on_link_lost(&self, generation: u64, reason: &str) {
        let (link, was_connected) = {
            let mut slot = lock(&self.slot);
            if slot.generation != generation {
                tracing::debug!(generation, reason, "ignoring failure of stale link");
                return;
            }
            slot.generation += 1;
            let was_connected = self.state() == ConnectionState::Connected;
            if was_connected {
                self.set_state(ConnectionState::Reconnecting);
            }
            (slot.link.take(), was_connected)
        };

        let failed = self.router.fail_all(ProxyError::ConnectionLost);
        tracing::warn!(generation, reason, failed, "gateway link lost");

        if let Some(link) = link {
            tokio::spawn(async move { link.disconnect().await });
        }
        if was_connected {
            self.spawn_reconnect();
        }
    }

    /// Clear the reconnect handle unless the link was lost again. Returns
    /// false when the loop has to keep going.
    ///
    /// Runs under the tasks lock so it cannot interleave with
    /// `spawn_reconnect` deciding that a loop is still alive.
    fn release_reconnect(&self) -> bool {
        let mut tasks = lock(&self.tasks);
        if self.state() == ConnectionState::Reconnecting {
            return false;
        }
        tasks.reconnect = None;
        true
    }

    fn spawn_reconnect(&self) {
        let mut tasks = lock(&self.tasks);
        if tasks.reconnect.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = self.weak_self.clone();
        tasks.reconnect = Some(tokio::spawn(reconnect_loop(weak)));
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    fn spawn_pump(&self, generation: u64, mut events: GatewayEvents) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                if session.current_generation() != generation {
                    return;
                }
                session.touch();
                if session.router.route(event) == RouteOutcome::LinkClosed {
                    session.on_link_lost(generation, "connection closed by gateway");
                    return;
                }
            }
            if let Some(session) = weak.upgrade() {
                session.on_link_lost(generation, "event stream ended");
            }
        })
    }

    fn spawn_health_monitor(&self, generation: u64) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        let interval = self.config.health_interval;
        let timeout = self.config.health_timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(session) = weak.upgrade() else {
                    return;
                };
                if session.current_generation() != generation {
                    return;
                }
                match session.round_trip_time(timeout).await {
                    Ok(server_time) => tracing::trace!(server_time, "health check ok"),
                    Err(e) => {
                        tracing::warn!(error = %e, "health check failed");
                        session.on_link_lost(generation, "health check failed");
                        return;
                    }
                }
            }
        })
    }

    /// Round-trip a current-time request.
    async fn round_trip_time(&self, timeout: Duration) -> Result<i64> {
        let pending = self.router.register_untagged(Untagged::CurrentTime);
        self.send(GatewayRequest::CurrentTime).await?;
        match pending.wait_one(timeout).await? {
            Reply::Time(t) => Ok(t),
            other => Err(ProxyError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }
}

async fn reconnect_loop(weak: Weak<SessionManager>) {
    loop {
        let Some(session) = weak.upgrade() else {
            return;
        };
        if session.release_reconnect() {
            return;
        }
        let policy = session.config.backoff;
        let attempt = session.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if policy.exhausted(attempt) {
            tracing::error!(attempt, "giving up on reconnect");
            session.set_state(ConnectionState::Disconnected);
            return;
        }
        let delay = policy.delay(attempt);
        tracing::info!(attempt, ?delay, "scheduling reconnect");
        drop(session);

        tokio::time::sleep(delay).await;

        let Some(session) = weak.upgrade() else {
            return;
        };
        if session.state() != ConnectionState::Reconnecting {
            continue;
        }
        // Success loops back to the release check: the new link may
        // already be gone.
        match session.connect().await {
            Ok(()) => tracing::info!(attempt, "reconnected to IB gateway"),
            Err(e) => tracing::debug!(attempt, error = %e, "reconnect attempt failed"),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let mut tasks = lock(&self.tasks);
        tasks.abort_link_tasks();
        if let Some(handle) = tasks.reconnect.take() {
            handle.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::correlation::Shape;
    use ibkr_wire::GatewayEvent;
    use std::time::Instant;

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(7), Duration::from_secs(60));
        assert_eq!(policy.delay(500), Duration::from_secs(60));
        assert!(!policy.exhausted(1_000));

        let bounded = BackoffPolicy {
            max_attempts: Some(3),
            ..policy
        };
        assert!(!bounded.exhausted(3));
        assert!(bounded.exhausted(4));
    }

    #[tokio::test]
    async fn connect_reaches_connected() {
        let connector = FakeConnector::new();
        let session = SessionManager::new(test_config(), connector.clone());
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session.connect().await.unwrap();
        assert!(session.is_connected());
        let snap = session.snapshot();
        assert_eq!(snap.server_version, Some(176));
        assert_eq!(snap.reconnect_attempts, 0);
        assert!(snap.last_activity.is_some());
        assert_eq!(session.router().managed_accounts(), vec!["DU111", "DU222"]);
    }

    #[tokio::test]
    async fn failed_connect_leaves_session_disconnected() {
        let connector = FakeConnector::new();
        connector.fail_next(2);
        let session = SessionManager::new(test_config(), connector.clone());

        assert!(matches!(session.connect().await, Err(ProxyError::Connection(_))));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(matches!(session.ensure_connected().await, Err(ProxyError::NotConnected)));

        // Script exhausted: the next attempt succeeds.
        session.ensure_connected().await.unwrap();
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn concurrent_ensure_connected_shares_one_attempt() {
        let connector = FakeConnector::new();
        *connector.delay.lock().unwrap() = Some(Duration::from_millis(50));
        let session = SessionManager::new(test_config(), connector.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move { session.ensure_connected().await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn timed_out_ensure_connected_leaves_attempt_running() {
        let connector = FakeConnector::new();
        *connector.delay.lock().unwrap() = Some(Duration::from_millis(300));
        let mut config = test_config();
        config.ensure_timeout = Duration::from_millis(100);
        let session = SessionManager::new(config, connector.clone());

        assert!(matches!(session.ensure_connected().await, Err(ProxyError::NotConnected)));
        assert_eq!(session.state(), ConnectionState::Connecting);

        // The abandoned attempt finishes on its own.
        wait_for_state(&session, ConnectionState::Connected).await;
        *connector.delay.lock().unwrap() = None;
        session.ensure_connected().await.unwrap();
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn aborted_caller_still_settles_failed_attempt() {
        let connector = FakeConnector::new();
        *connector.delay.lock().unwrap() = Some(Duration::from_millis(200));
        connector.fail_next(1);
        let session = SessionManager::new(test_config(), connector.clone());

        let caller = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.ensure_connected().await })
        };
        wait_for_state(&session, ConnectionState::Connecting).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        wait_for_state(&session, ConnectionState::Disconnected).await;
        *connector.delay.lock().unwrap() = None;
        session.ensure_connected().await.unwrap();
        assert!(session.is_connected());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn link_loss_fails_in_flight_requests_immediately() {
        let connector = FakeConnector::new();
        let session = SessionManager::new(test_config(), connector.clone());
        session.connect().await.unwrap();

        let pending: Vec<_> = (0..5)
            .map(|_| session.router().register_tagged(Shape::Stream))
            .collect();
        let started = Instant::now();
        connector.last_link().drop_connection();

        for p in pending {
            let err = p.wait(Duration::from_secs(10)).await.unwrap_err();
            assert!(matches!(err, ProxyError::ConnectionLost));
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn reconnects_after_link_loss() {
        let connector = FakeConnector::new();
        let session = SessionManager::new(test_config(), connector.clone());
        session.connect().await.unwrap();
        let first = connector.last_link();

        connector.fail_next(1);
        first.drop_connection();
        wait_for_state(&session, ConnectionState::Reconnecting).await;
        wait_for_state(&session, ConnectionState::Connected).await;

        assert_eq!(connector.connect_count(), 3);
        assert_eq!(session.snapshot().reconnect_attempts, 0);
        assert!(first.closed.load(std::sync::atomic::Ordering::SeqCst));

        // Events from the old link no longer reach the router.
        let pending = session.router().register_tagged(Shape::Stream);
        first.emit(GatewayEvent::ContractDetailsEnd { req_id: pending.id() });
        first.drop_connection();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.router().is_ready());
        assert!(session.is_connected());
        assert!(matches!(
            pending.wait(Duration::from_millis(20)).await,
            Err(ProxyError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn link_dropping_right_after_reconnect_reconnects_again() {
        let connector = FakeConnector::new();
        let session = SessionManager::new(test_config(), connector.clone());
        session.connect().await.unwrap();

        connector.last_link().drop_connection();
        wait_for_state(&session, ConnectionState::Reconnecting).await;
        wait_for_state(&session, ConnectionState::Connected).await;

        connector.last_link().drop_connection();
        wait_for_state(&session, ConnectionState::Reconnecting).await;
        wait_for_state(&session, ConnectionState::Connected).await;
        assert_eq!(connector.connect_count(), 3);
    }

    #[tokio::test]
    async fn reconnect_handle_is_kept_while_link_is_lost_again() {
        let connector = FakeConnector::new();
        let session = SessionManager::new(test_config(), connector.clone());
        session.connect().await.unwrap();
        lock(&session.tasks).reconnect = Some(tokio::spawn(std::future::pending()));

        // A loss that lands after a successful reconnect keeps the loop alive.
        session.set_state(ConnectionState::Reconnecting);
        assert!(!session.release_reconnect());
        assert!(lock(&session.tasks).reconnect.is_some());
        session.spawn_reconnect();

        session.set_state(ConnectionState::Connected);
        assert!(session.release_reconnect());
        assert!(lock(&session.tasks).reconnect.is_none());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let connector = FakeConnector::new();
        let mut config = test_config();
        config.backoff.max_attempts = Some(2);
        let session = SessionManager::new(config, connector.clone());
        session.connect().await.unwrap();

        connector.fail_next(5);
        connector.last_link().drop_connection();
        wait_for_state(&session, ConnectionState::Reconnecting).await;
        wait_for_state(&session, ConnectionState::Disconnected).await;
        assert_eq!(connector.connect_count(), 3);
    }

    #[tokio::test]
    async fn health_check_failure_triggers_reconnect() {
        let connector = FakeConnector::new();
        let mut config = test_config();
        config.health_interval = Duration::from_millis(20);
        config.health_timeout = Duration::from_millis(20);
        let session = SessionManager::new(config, connector.clone());
        session.connect().await.unwrap();

        // The fake never answers reqCurrentTime.
        wait_for_state(&session, ConnectionState::Reconnecting).await;
        assert!(connector.connect_count() >= 1);
        assert!(connector.links.lock().unwrap()[0]
            .sent()
            .contains(&GatewayRequest::CurrentTime));
    }

    #[tokio::test]
    async fn healthy_gateway_keeps_session_connected() {
        let connector = FakeConnector::new();
        connector.respond_with(|req| match req {
            GatewayRequest::CurrentTime => vec![GatewayEvent::CurrentTime { time: 1_700_000_000 }],
            _ => vec![],
        });
        let mut config = test_config();
        config.health_interval = Duration::from_millis(10);
        let session = SessionManager::new(config, connector.clone());
        session.connect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(session.is_connected());
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_fails_outstanding() {
        let connector = FakeConnector::new();
        let session = SessionManager::new(test_config(), connector.clone());
        session.connect().await.unwrap();
        let pending = session.router().register_tagged(Shape::Scalar);

        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(connector.last_link().closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(matches!(
            pending.wait(Duration::from_secs(1)).await,
            Err(ProxyError::ConnectionLost)
        ));
        assert!(matches!(
            session.send(GatewayRequest::CurrentTime).await,
            Err(ProxyError::NotConnected)
        ));
    }
}
