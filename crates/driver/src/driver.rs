//! Top-level `Driver`/`TableClient`/`SchemeClient` wiring (C1-C7 assembly).
//!
//! Owns discovery and the per-endpoint session factories; `TableClient` and
//! `SchemeClient` each own their own `SessionPool` and borrow the driver's
//! session-creation capability (spec.md section 9: "Driver owns discovery,
//! transports, and clients; SessionPool borrows the Driver for session-
//! creator lookup"). No back-pointer from pool to driver is needed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use ydb_shared::{Endpoint, RetryParameters, YdbResult};

use crate::auth::AuthProvider;
use crate::config::DriverSettings;
use crate::discovery::{Discovery, DiscoveryEvent};
use crate::pool::{PoolStats, SessionCreator, SessionPool};
use crate::session::factory::SessionFactory;
use crate::session::{Session, SessionEventSender};
use crate::transport::wire_scheme;

type EndpointKey = (String, u16);

/// Bridges `SessionPool` to discovery and the per-endpoint `SessionFactory`
/// cache. One instance is shared by `TableClient`'s pool and
/// `SchemeClient`'s pool, since both mint sessions against the same
/// endpoint set over the same transports.
struct DriverSessionCreator {
    scheme: &'static str,
    discovery: Arc<Discovery>,
    auth: Arc<dyn AuthProvider>,
    operation_timeout: Duration,
    operation_retry: RetryParameters,
    factories: StdMutex<HashMap<EndpointKey, Arc<SessionFactory>>>,
}

impl DriverSessionCreator {
    fn new(
        scheme: &'static str,
        discovery: Arc<Discovery>,
        auth: Arc<dyn AuthProvider>,
        operation_timeout: Duration,
        operation_retry: RetryParameters,
    ) -> Self {
        Self {
            scheme,
            discovery,
            auth,
            operation_timeout,
            operation_retry,
            factories: StdMutex::new(HashMap::new()),
        }
    }

    fn factory_for(&self, endpoint: &Endpoint) -> YdbResult<Arc<SessionFactory>> {
        let key = (endpoint.host.clone(), endpoint.port);
        let mut factories = self.factories.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(factory) = factories.get(&key) {
            return Ok(factory.clone());
        }
        let factory = Arc::new(SessionFactory::new(
            self.scheme,
            endpoint.clone(),
            self.auth.clone(),
            self.discovery.table(),
            self.operation_timeout,
            self.operation_retry,
        )?);
        factories.insert(key, factory.clone());
        Ok(factory)
    }

    /// Drops the cached factory for an endpoint discovery no longer lists,
    /// so a later session creation against a resurrected address at the
    /// same `(host, port)` rebuilds the channel rather than reusing a stale
    /// one (spec.md section 4.3: `removed` events exist precisely so
    /// "consumers can invalidate caches (e.g., per-endpoint session
    /// factories)").
    fn invalidate(&self, endpoint: &Endpoint) {
        let key = (endpoint.host.clone(), endpoint.port);
        self.factories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }
}

#[async_trait]
impl SessionCreator for DriverSessionCreator {
    async fn create_session(&self, events: SessionEventSender) -> YdbResult<Arc<Session>> {
        let endpoint = self.discovery.get_endpoint().await?;
        let factory = self.factory_for(&endpoint)?;
        factory.create(events).await
    }
}

/// `TableClient.withSession(callback, timeout?)` (spec.md section 6): the
/// table-data surface, backed by its own bounded session pool.
pub struct TableClient {
    pool: Arc<SessionPool>,
    default_retry: RetryParameters,
}

impl TableClient {
    fn new(pool: Arc<SessionPool>, default_retry: RetryParameters) -> Self {
        Self { pool, default_retry }
    }

    /// Acquires a session, runs `f`, releases on success, deletes the
    /// session on failure. See `SessionPool::with_session` for the
    /// release-vs-delete rule (spec.md section 4.6 / open question in
    /// section 9: no retry is layered in here).
    pub async fn with_session<F, Fut, T>(&self, timeout: Duration, f: F) -> YdbResult<T>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = YdbResult<T>>,
    {
        self.pool.with_session(timeout, f).await
    }

    /// The retry policy this client's sessions were built with; exposed so
    /// a caller composing `with_retries(|| ...)` around `with_session` can
    /// default to the driver's own policy instead of inventing one.
    pub fn default_retry(&self) -> RetryParameters {
        self.default_retry
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub async fn destroy(&self) {
        self.pool.destroy().await;
    }
}

/// `SchemeClient` (spec.md section 6). Schema-service operations beyond
/// session lifecycle are explicitly out of scope (spec.md section 1); this
/// client exists to demonstrate the pattern — "they reuse the same
/// session/retry plumbing" — without inventing a scheme-service RPC surface
/// the proto in this crate doesn't define. `create_table`/`drop_table`/
/// `describe_table` already live on `Session` and are reachable the same
/// way through `with_session`.
pub struct SchemeClient {
    pool: Arc<SessionPool>,
}

impl SchemeClient {
    fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }

    pub async fn with_session<F, Fut, T>(&self, timeout: Duration, f: F) -> YdbResult<T>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = YdbResult<T>>,
    {
        self.pool.with_session(timeout, f).await
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub async fn destroy(&self) {
        self.pool.destroy().await;
    }
}

/// Top-level driver: `Driver(entryPoint, database, authService, settings?)`
/// (spec.md section 6). Exclusively owns discovery and the clients; each
/// client exclusively owns its `SessionPool`.
pub struct Driver {
    discovery: Arc<Discovery>,
    table_client: TableClient,
    scheme_client: SchemeClient,
    invalidation_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Driver {
    pub fn builder(
        entry_point: impl Into<String>,
        database: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
    ) -> DriverBuilder {
        DriverBuilder::new(entry_point, database, auth)
    }

    /// Convenience for the common case: connect with default
    /// `DriverSettings`. Equivalent to `Driver::builder(...).connect()`.
    pub async fn connect(
        entry_point: impl Into<String>,
        database: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
    ) -> YdbResult<Arc<Driver>> {
        Self::builder(entry_point, database, auth).connect().await
    }

    /// Resolves `true` once the first successful discovery refresh
    /// completes, `false` if `timeout` elapses first.
    pub async fn ready(&self, timeout: Duration) -> bool {
        self.discovery.ready(timeout).await
    }

    /// Least-loaded non-pessimized endpoint, for callers that want to
    /// inspect routing directly rather than go through a client.
    pub async fn get_endpoint(&self) -> YdbResult<Endpoint> {
        self.discovery.get_endpoint().await
    }

    pub fn table_client(&self) -> &TableClient {
        &self.table_client
    }

    pub fn scheme_client(&self) -> &SchemeClient {
        &self.scheme_client
    }

    /// Tears down both clients' pools and discovery's background refresh.
    /// Idempotent; after this, every operation on the driver's clients
    /// fails (spec.md section 5).
    pub async fn destroy(&self) {
        if let Some(handle) = self
            .invalidation_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.table_client.destroy().await;
        self.scheme_client.destroy().await;
        self.discovery.destroy();
        tracing::info!("driver destroyed");
    }
}

/// Builder for `Driver` construction (settings, timeouts, pool bounds):
/// additive convenience over a bare constructor, grounded in the teacher's
/// `AppState::new` style of explicit, logged construction steps
/// (SPEC_FULL.md section B).
pub struct DriverBuilder {
    entry_point: String,
    database: String,
    auth: Arc<dyn AuthProvider>,
    settings: DriverSettings,
}

impl DriverBuilder {
    pub fn new(
        entry_point: impl Into<String>,
        database: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            entry_point: entry_point.into(),
            database: database.into(),
            auth,
            settings: DriverSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: DriverSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Builds discovery, the shared session creator, and both clients'
    /// pools, then starts discovery's periodic refresh and the pools'
    /// prepopulation/keepalive background tasks.
    pub async fn connect(self) -> YdbResult<Arc<Driver>> {
        let scheme = wire_scheme(&self.entry_point);
        tracing::info!(
            entry_point = %self.entry_point,
            database = %self.database,
            "connecting driver"
        );

        let discovery = Discovery::new(
            &self.entry_point,
            self.database.clone(),
            self.settings.discovery_period,
            self.settings.pessimization_delay,
        )?;
        discovery.start();

        let creator = Arc::new(DriverSessionCreator::new(
            scheme,
            discovery.clone(),
            self.auth.clone(),
            self.settings.operation_timeout,
            self.settings.default_retry,
        ));

        let invalidation_task = {
            let creator = creator.clone();
            let mut events = discovery.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(DiscoveryEvent::Removed(endpoint)) => creator.invalidate(&endpoint),
                        Ok(DiscoveryEvent::Added(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let table_pool = SessionPool::new(
            creator.clone(),
            self.settings.min_pool_size,
            self.settings.max_pool_size,
            self.settings.session_keepalive_period,
            self.settings.session_idle_timeout,
        );
        let table_client = TableClient::new(table_pool, self.settings.default_retry);

        // SchemeClient gets its own pool — spec.md section 3 makes each
        // client the exclusive owner of one `SessionPool` — but is sized
        // much smaller by default, since schema operations are rare next
        // to data-query traffic.
        let scheme_pool = SessionPool::new(
            creator,
            0,
            self.settings.max_pool_size.min(2).max(1),
            self.settings.session_keepalive_period,
            self.settings.session_idle_timeout,
        );
        let scheme_client = SchemeClient::new(scheme_pool);

        Ok(Arc::new(Driver {
            discovery,
            table_client,
            scheme_client,
            invalidation_task: StdMutex::new(Some(invalidation_task)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuth;

    fn test_creator() -> DriverSessionCreator {
        let discovery = Discovery::new(
            "grpc://localhost:2135",
            "/Root/db",
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .unwrap();
        let auth: Arc<dyn AuthProvider> = Arc::new(StaticTokenAuth::new("t", "/Root/db"));
        DriverSessionCreator::new(
            "http",
            discovery,
            auth,
            Duration::from_secs(5),
            RetryParameters::default(),
        )
    }

    #[test]
    fn factory_for_caches_by_host_and_port() {
        let creator = test_creator();
        let endpoint = Endpoint::new("node-1", 2135, "/Root/db");
        let first = creator.factory_for(&endpoint).unwrap();
        let second = creator.factory_for(&endpoint).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn invalidate_drops_the_cached_factory_so_it_is_rebuilt() {
        let creator = test_creator();
        let endpoint = Endpoint::new("node-1", 2135, "/Root/db");
        let first = creator.factory_for(&endpoint).unwrap();
        creator.invalidate(&endpoint);
        let second = creator.factory_for(&endpoint).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn different_endpoints_get_distinct_factories() {
        let creator = test_creator();
        let a = Endpoint::new("node-1", 2135, "/Root/db");
        let b = Endpoint::new("node-2", 2135, "/Root/db");
        let fa = creator.factory_for(&a).unwrap();
        let fb = creator.factory_for(&b).unwrap();
        assert!(!Arc::ptr_eq(&fa, &fb));
    }
}
