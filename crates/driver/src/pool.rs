//! Session pool (C6): a bounded pool of server-side session handles with a
//! FIFO waiter queue, prepopulation, keepalive scheduling, and
//! broken-session eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use ydb_shared::{YdbError, YdbResult};

use crate::session::{Session, SessionEvent, SessionEventSender, SessionState};

/// Bridges the pool to "the driver's per-endpoint factory" (spec.md section
/// 4.6, step 2): picks an endpoint and mints a session bound to it. The
/// concrete implementation lives in `driver.rs`, where it can see discovery
/// and the per-endpoint `SessionFactory` cache; the pool only needs this
/// narrow capability, which keeps it testable with a fake.
#[async_trait]
pub trait SessionCreator: Send + Sync {
    async fn create_session(&self, events: SessionEventSender) -> YdbResult<Arc<Session>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub free: usize,
    pub acquired: usize,
    pub broken: usize,
    pub being_deleted: usize,
    pub waiters: usize,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Arc<Session>>,
}

struct PoolState {
    sessions: HashMap<String, Arc<Session>>,
    waiters: VecDeque<Waiter>,
    new_sessions_requested: usize,
    sessions_being_deleted: usize,
}

pub struct SessionPool {
    creator: Arc<dyn SessionCreator>,
    state: Mutex<PoolState>,
    min_limit: usize,
    max_limit: usize,
    idle_timeout: Duration,
    events_tx: SessionEventSender,
    next_waiter_id: AtomicU64,
    destroyed: AtomicBool,
    event_task: StdMutex<Option<JoinHandle<()>>>,
    keepalive_task: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    pub fn new(
        creator: Arc<dyn SessionCreator>,
        min_limit: usize,
        max_limit: usize,
        keepalive_period: Duration,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(Self {
            creator,
            state: Mutex::new(PoolState {
                sessions: HashMap::new(),
                waiters: VecDeque::new(),
                new_sessions_requested: 0,
                sessions_being_deleted: 0,
            }),
            min_limit,
            max_limit,
            idle_timeout,
            events_tx,
            next_waiter_id: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            event_task: StdMutex::new(None),
            keepalive_task: StdMutex::new(None),
        });

        pool.clone().spawn_event_consumer(events_rx);
        pool.clone().spawn_keepalive(keepalive_period);
        pool.clone().prepopulate();

        pool
    }

    fn spawn_event_consumer(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<SessionEvent>) {
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    SessionEvent::Released(id) => pool.on_released(&id).await,
                    SessionEvent::Broken(id) => pool.on_broken(id).await,
                }
            }
        });
        *self
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    async fn on_released(&self, session_id: &str) {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get(session_id).cloned() else {
            return;
        };
        if session.state() != SessionState::Free {
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            if session.acquire().is_ok() {
                if waiter.tx.send(session.clone()).is_ok() {
                    return;
                }
                // Waiter already gave up (timed out/dropped); put the
                // session back and try the next one in line.
                session.release();
            }
        }
    }

    async fn on_broken(&self, session_id: String) {
        let session = {
            let mut state = self.state.lock().await;
            let Some(session) = state.sessions.get(&session_id).cloned() else {
                return;
            };
            state.sessions_being_deleted += 1;
            session
        };
        tracing::warn!(session_id = %session_id, "evicting broken session");
        if let Err(e) = session.delete().await {
            tracing::warn!(session_id = %session_id, error = %e, "error deleting broken session");
        }
        let mut state = self.state.lock().await;
        state.sessions.remove(&session_id);
        state.sessions_being_deleted = state.sessions_being_deleted.saturating_sub(1);
    }

    fn spawn_keepalive(self: Arc<Self>, period: Duration) {
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                pool.keepalive_sweep().await;
            }
        });
        *self
            .keepalive_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    async fn keepalive_sweep(&self) {
        let sessions: Vec<Arc<Session>> = {
            let state = self.state.lock().await;
            state.sessions.values().cloned().collect()
        };
        join_all(sessions.iter().map(|s| async move {
            if let Err(e) = s.keep_alive().await {
                tracing::warn!(session_id = %s.id(), error = %e, "keepalive failed");
            }
        }))
        .await;

        self.shrink_idle_sessions().await;
    }

    /// Sessions idle longer than `idle_timeout` may be dropped during the
    /// keepalive sweep once the pool is above `min_limit` (SPEC_FULL.md
    /// section B, additive to spec.md's keepalive-only floor).
    ///
    /// Candidates are removed from `state.sessions` atomically at selection
    /// time, under the same lock acquisition, before any `.await` point —
    /// otherwise a session still visible to `acquire()`'s `Free`-only scan
    /// could be handed to a caller between selection and the (suspending)
    /// delete RPC, and then deleted server-side out from under them. This
    /// mirrors `on_broken`, which removes a session from acquirability
    /// synchronously before it is ever awaited on.
    async fn shrink_idle_sessions(&self) {
        if self.idle_timeout.is_zero() {
            return;
        }
        let to_drop: Vec<Arc<Session>> = {
            let mut state = self.state.lock().await;
            if state.sessions.len() <= self.min_limit {
                return;
            }
            let budget = state.sessions.len() - self.min_limit;
            let candidate_ids: Vec<String> = state
                .sessions
                .values()
                .filter(|s| s.state() == SessionState::Free && s.idle_for() > self.idle_timeout)
                .take(budget)
                .map(|s| s.id().to_string())
                .collect();
            let mut dropped = Vec::with_capacity(candidate_ids.len());
            for id in candidate_ids {
                if let Some(session) = state.sessions.remove(&id) {
                    state.sessions_being_deleted += 1;
                    dropped.push(session);
                }
            }
            dropped
        };
        for session in to_drop {
            tracing::debug!(session_id = %session.id(), "shrinking idle session");
            if let Err(e) = session.delete().await {
                tracing::warn!(session_id = %session.id(), error = %e, "error deleting idle session");
            }
            let mut state = self.state.lock().await;
            state.sessions_being_deleted = state.sessions_being_deleted.saturating_sub(1);
        }
    }

    fn prepopulate(self: Arc<Self>) {
        for _ in 0..self.min_limit {
            let pool = self.clone();
            tokio::spawn(async move {
                if let Err(e) = pool.create_and_insert_free().await {
                    tracing::warn!(error = %e, "prepopulation session creation failed");
                }
            });
        }
    }

    async fn create_and_insert_free(&self) -> YdbResult<()> {
        let session = self.creator.create_session(self.events_tx.clone()).await?;
        let mut state = self.state.lock().await;
        state.sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    /// Scan -> reserve -> create, atomic against other acquirers via
    /// `state`'s single mutex (spec.md section 5).
    pub async fn acquire(&self, timeout: Duration) -> YdbResult<Arc<Session>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(YdbError::Destroyed("SessionPool"));
        }

        let reservation = {
            let mut state = self.state.lock().await;

            if let Some(session) = state
                .sessions
                .values()
                .find(|s| s.state() == SessionState::Free)
                .cloned()
            {
                session.acquire()?;
                return Ok(session);
            }

            let in_flight = state.sessions.len() + state.new_sessions_requested
                - state.sessions_being_deleted;
            if in_flight < self.max_limit {
                state.new_sessions_requested += 1;
                Some(())
            } else {
                None
            }
        };

        if reservation.is_some() {
            let result = self.creator.create_session(self.events_tx.clone()).await;
            let mut state = self.state.lock().await;
            state.new_sessions_requested -= 1;
            return match result {
                Ok(session) => {
                    session.acquire()?;
                    state.sessions.insert(session.id().to_string(), session.clone());
                    Ok(session)
                }
                Err(e) => Err(e),
            };
        }

        self.wait_for_release(timeout).await
    }

    async fn wait_for_release(&self, timeout: Duration) -> YdbResult<Arc<Session>> {
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.waiters.push_back(Waiter { id: waiter_id, tx });
        }

        let result = if timeout.is_zero() {
            rx.await.map_err(|_| waiter_cancelled_err())
        } else {
            match tokio::time::timeout(timeout, rx).await {
                Ok(inner) => inner.map_err(|_| waiter_cancelled_err()),
                Err(_) => {
                    let mut state = self.state.lock().await;
                    state.waiters.retain(|w| w.id != waiter_id);
                    Err(YdbError::NoSessionAvailable(timeout.as_millis() as u64))
                }
            }
        };
        result
    }

    /// Acquires a session, runs `f`, releases on success, deletes on
    /// failure (to avoid leaking a potentially-broken session back into
    /// rotation), and rethrows. Finer classification of the failure is left
    /// to the caller composing `with_retries` around this call (spec.md
    /// section 4.6 / open question in section 9: no retry at this layer).
    pub async fn with_session<F, Fut, T>(&self, timeout: Duration, f: F) -> YdbResult<T>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: std::future::Future<Output = YdbResult<T>>,
    {
        let session = self.acquire(timeout).await?;
        match f(session.clone()).await {
            Ok(value) => {
                session.release();
                Ok(value)
            }
            Err(e) => {
                if let Err(delete_err) = session.delete().await {
                    tracing::warn!(
                        session_id = %session.id(),
                        error = %delete_err,
                        "error deleting session after callback failure"
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let mut stats = PoolStats {
            waiters: state.waiters.len(),
            being_deleted: state.sessions_being_deleted,
            ..Default::default()
        };
        for session in state.sessions.values() {
            match session.state() {
                SessionState::Free => stats.free += 1,
                SessionState::Acquired => stats.acquired += 1,
                SessionState::Broken => stats.broken += 1,
                SessionState::Deleted => {}
            }
        }
        stats
    }

    /// Cancels the keepalive timer and awaits deletion of every current
    /// session. After this, `acquire`/`with_session` fail immediately.
    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .keepalive_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        if let Some(handle) = self
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        let sessions: Vec<Arc<Session>> = {
            let state = self.state.lock().await;
            state.sessions.values().cloned().collect()
        };
        join_all(sessions.iter().map(|s| s.delete())).await;
        let mut state = self.state.lock().await;
        state.sessions.clear();
    }
}

fn waiter_cancelled_err() -> YdbError {
    YdbError::Destroyed("session pool waiter")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::auth::StaticTokenAuth;
    use crate::discovery::EndpointTableHandle;
    use crate::transport::Transport;
    use ydb_shared::Endpoint;

    /// A fake session creator that mints sessions without any network I/O,
    /// for exercising pool bookkeeping in isolation.
    struct FakeCreator {
        created: AtomicUsize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl SessionCreator for FakeCreator {
        async fn create_session(&self, events: SessionEventSender) -> YdbResult<Arc<Session>> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_after {
                if n >= limit {
                    return Err(YdbError::status(
                        ydb_shared::StatusCode::Unavailable,
                        "fake creation failure",
                    ));
                }
            }
            let endpoint = Endpoint::new("fake-host", 1, "/Root/db");
            let auth: Arc<dyn crate::auth::AuthProvider> =
                Arc::new(StaticTokenAuth::new("t", "/Root/db"));
            let channel = tonic::transport::Channel::from_static("http://127.0.0.1:1")
                .connect_lazy();
            let client = crate::pb::table_service_client::TableServiceClient::new(channel);
            let transport = Transport::new(
                endpoint.clone(),
                client,
                auth,
                Duration::from_secs(1),
                EndpointTableHandle::for_tests(),
            );
            Ok(Arc::new(Session::new(
                format!("session-{n}"),
                endpoint,
                transport,
                events,
                ydb_shared::RetryParameters::default(),
            )))
        }
    }

    fn fake_pool(min: usize, max: usize) -> Arc<SessionPool> {
        SessionPool::new(
            Arc::new(FakeCreator {
                created: AtomicUsize::new(0),
                fail_after: None,
            }),
            min,
            max,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn acquire_creates_up_to_max_limit_then_waits() {
        let pool = fake_pool(0, 1);
        let s1 = pool.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(s1.state(), SessionState::Acquired);

        let err = pool
            .acquire(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, YdbError::NoSessionAvailable(50)));
    }

    #[tokio::test]
    async fn released_session_is_reused_by_next_acquire() {
        let pool = fake_pool(0, 1);
        let s1 = pool.acquire(Duration::ZERO).await.unwrap();
        let id = s1.id().to_string();
        s1.release();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let s2 = pool.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(s2.id(), id);
    }

    #[tokio::test]
    async fn with_session_deletes_on_callback_failure() {
        let pool = fake_pool(0, 2);
        let result: YdbResult<()> = pool
            .with_session(Duration::ZERO, |_session| async {
                Err(YdbError::InvalidArgument("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = pool.stats().await;
        assert_eq!(stats.free, 0);
        assert_eq!(stats.acquired, 0);
    }

    #[tokio::test]
    async fn with_session_releases_on_success() {
        let pool = fake_pool(0, 2);
        let result = pool
            .with_session(Duration::ZERO, |_session| async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(result, 7);
        let stats = pool.stats().await;
        assert_eq!(stats.free, 1);
    }

    /// spec.md section 8 scenario 3 / invariant 4: a session that emits
    /// `SESSION_BROKEN` (here, simulated directly on the event channel the
    /// way `Session::run` would fire it on a classified keepAlive failure,
    /// rather than standing up a fake RPC failure) is evicted from the pool
    /// and a later `acquire()` gets a fresh replacement.
    #[tokio::test]
    async fn broken_session_is_evicted_and_replaced() {
        let pool = fake_pool(0, 1);
        let session = pool.acquire(Duration::ZERO).await.unwrap();
        let id = session.id().to_string();
        session.release();
        assert_eq!(pool.stats().await.free, 1);

        pool.events_tx.send(SessionEvent::Broken(id.clone())).unwrap();

        // Give the event-consumer task a chance to process the eviction.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = pool.stats().await;
        assert_eq!(stats.broken, 0);
        assert_eq!(stats.free, 0);
        assert_eq!(stats.being_deleted, 0);

        let replacement = pool.acquire(Duration::ZERO).await.unwrap();
        assert_ne!(replacement.id(), id);
    }

    #[tokio::test]
    async fn destroy_fails_subsequent_acquires() {
        let pool = fake_pool(0, 1);
        pool.destroy().await;
        let err = pool.acquire(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, YdbError::Destroyed(_)));
    }
}
