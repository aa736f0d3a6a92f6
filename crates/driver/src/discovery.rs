//! Discovery service (C3): periodically refreshes the endpoint table,
//! diffs it against the previous snapshot, and hands out a least-loaded
//! non-pessimized endpoint. Pessimization feedback flows in from
//! `Transport` via the same handle `getEndpoint()` reads from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use ydb_shared::{Endpoint, YdbError, YdbResult};

use crate::pb::discovery_client::DiscoveryClient;
use crate::pb::ListEndpointsRequest;
use crate::transport::wire_scheme;

type EndpointKey = (String, u16);

#[derive(Default)]
struct Table {
    endpoints: HashMap<EndpointKey, Endpoint>,
}

/// A cheap, cloneable handle to the shared endpoint table. `Transport` holds
/// one so it can pessimize the endpoint it's bound to without reaching back
/// through `Discovery` itself; the session-creation path holds one to pick
/// the next endpoint a new session should land on.
#[derive(Clone)]
pub struct EndpointTableHandle {
    inner: Arc<StdMutex<Table>>,
}

impl EndpointTableHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(StdMutex::new(Table::default())),
        }
    }

    /// Empty table, for constructing a `Transport` in unit tests that never
    /// exercise discovery itself.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::new()
    }

    /// Replaces the table atomically, returning the `(added, removed)` diff
    /// keyed by `(host, port)` (spec.md section 4.3).
    fn replace(&self, fresh: Vec<Endpoint>) -> (Vec<Endpoint>, Vec<Endpoint>) {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut fresh_map: HashMap<EndpointKey, Endpoint> = fresh
            .into_iter()
            .map(|e| ((e.host.clone(), e.port), e))
            .collect();

        let removed: Vec<Endpoint> = table
            .endpoints
            .iter()
            .filter(|(k, _)| !fresh_map.contains_key(*k))
            .map(|(_, v)| v.clone())
            .collect();
        let added: Vec<Endpoint> = fresh_map
            .iter()
            .filter(|(k, _)| !table.endpoints.contains_key(*k))
            .map(|(_, v)| v.clone())
            .collect();

        // Preserve pessimization state for endpoints that survive the
        // refresh — a `ListEndpoints` response doesn't know which nodes we
        // privately consider unhealthy.
        for (key, old) in table.endpoints.drain() {
            if let Some(new) = fresh_map.get_mut(&key) {
                if let Some(until) = old.pessimized_until() {
                    new.pessimize_until(until);
                }
            }
        }
        table.endpoints = fresh_map;
        (added, removed)
    }

    /// Lowest-`load_factor` non-pessimized endpoint; ties (and near-ties
    /// within the lowest tier) broken by weighted random pick rather than a
    /// single deterministic winner, to avoid every session factory piling
    /// onto one node (SPEC_FULL.md section B).
    pub fn get_endpoint(&self) -> Option<Endpoint> {
        let table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut healthy: Vec<&Endpoint> = table
            .endpoints
            .values()
            .filter(|e| !e.is_pessimized(now))
            .collect();
        if healthy.is_empty() {
            return None;
        }
        healthy.sort_by(|a, b| a.load_factor.partial_cmp(&b.load_factor).unwrap_or(std::cmp::Ordering::Equal));
        let lowest = healthy[0].load_factor;
        let tier: Vec<&&Endpoint> = healthy
            .iter()
            .take_while(|e| (e.load_factor - lowest).abs() < f32::EPSILON)
            .collect();
        tier.choose(&mut rand::thread_rng()).map(|e| (**e).clone())
    }

    pub fn all_pessimized(&self) -> bool {
        let table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        !table.endpoints.is_empty() && table.endpoints.values().all(|e| e.is_pessimized(now))
    }

    pub fn snapshot(&self) -> Vec<Endpoint> {
        let table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        table.endpoints.values().cloned().collect()
    }

    /// Marks `endpoint` unavailable for `pessimization_delay`, called by
    /// `Transport` on any transport-level failure.
    pub fn pessimize(&self, endpoint: &Endpoint) {
        self.pessimize_for(endpoint, Duration::from_secs(60));
    }

    pub fn pessimize_for(&self, endpoint: &Endpoint, delay: Duration) {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(e) = table.endpoints.get_mut(&(endpoint.host.clone(), endpoint.port)) {
            e.pessimize_until(Instant::now() + delay);
            tracing::warn!(endpoint = %endpoint.address(), delay = ?delay, "pessimizing endpoint");
        }
    }
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Added(Endpoint),
    Removed(Endpoint),
}

/// Periodically lists endpoints and maintains the shared table. One
/// instance per `Driver`.
pub struct Discovery {
    table: EndpointTableHandle,
    channel: tonic::transport::Channel,
    database: String,
    period: Duration,
    pessimization_delay: Duration,
    events_tx: broadcast::Sender<DiscoveryEvent>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    refresh_lock: AsyncMutex<()>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(
        entry_point: &str,
        database: impl Into<String>,
        period: Duration,
        pessimization_delay: Duration,
    ) -> YdbResult<Arc<Self>> {
        let scheme = wire_scheme(entry_point);
        let without_scheme = entry_point
            .splitn(2, "://")
            .nth(1)
            .unwrap_or(entry_point);
        let uri = format!("{scheme}://{without_scheme}");
        let channel = tonic::transport::Channel::from_shared(uri.clone())
            .map_err(|e| YdbError::InvalidArgument(format!("invalid entry point {uri}: {e}")))?
            .connect_lazy();

        let (ready_tx, ready_rx) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(64);

        Ok(Arc::new(Self {
            table: EndpointTableHandle::new(),
            channel,
            database: database.into(),
            period,
            pessimization_delay,
            events_tx,
            ready_tx,
            ready_rx,
            refresh_lock: AsyncMutex::new(()),
            task: StdMutex::new(None),
        }))
    }

    pub fn table(&self) -> EndpointTableHandle {
        self.table.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events_tx.subscribe()
    }

    /// Issues `ListEndpoints`, diffs the result, and publishes
    /// `added`/`removed` events. Refreshes are serialized: a refresh already
    /// in flight is awaited rather than duplicated.
    async fn refresh(&self) -> YdbResult<()> {
        let _guard = self.refresh_lock.lock().await;
        let mut client = DiscoveryClient::new(self.channel.clone());
        let resp = client
            .list_endpoints(ListEndpointsRequest {
                database: self.database.clone(),
            })
            .await
            .map_err(|e| YdbError::status(ydb_shared::StatusCode::Unavailable, e.message()))?
            .into_inner();

        let fresh: Vec<Endpoint> = resp
            .endpoints
            .into_iter()
            .map(|e| {
                Endpoint::new(e.address, e.port as u16, self.database.clone())
                    .with_load_factor(e.load_factor)
            })
            .collect();

        let (added, removed) = self.table.replace(fresh);
        for e in added {
            tracing::info!(endpoint = %e.address(), "discovery: endpoint added");
            let _ = self.events_tx.send(DiscoveryEvent::Added(e));
        }
        for e in removed {
            tracing::info!(endpoint = %e.address(), "discovery: endpoint removed");
            let _ = self.events_tx.send(DiscoveryEvent::Removed(e));
        }

        let _ = self.ready_tx.send(true);
        Ok(())
    }

    /// Starts the periodic refresh loop, firing once immediately.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.period);
            loop {
                interval.tick().await;
                if let Err(e) = this.refresh().await {
                    tracing::warn!(error = %e, "discovery refresh failed");
                }
            }
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        // Fire the first refresh immediately rather than waiting a full
        // period, so `ready()` resolves promptly on cold start.
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.refresh().await {
                tracing::warn!(error = %e, "initial discovery refresh failed");
            }
        });
    }

    /// Resolves `true` once the first successful refresh completes, `false`
    /// if `timeout` elapses first.
    pub async fn ready(&self, timeout: Duration) -> bool {
        if *self.ready_rx.borrow() {
            return true;
        }
        let mut rx = self.ready_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|v| *v))
            .await
            .is_ok()
    }

    /// Least-loaded non-pessimized endpoint. If every known endpoint is
    /// pessimized, triggers an immediate refresh before picking.
    pub async fn get_endpoint(&self) -> YdbResult<Endpoint> {
        if self.table.all_pessimized() {
            if let Err(e) = self.refresh().await {
                tracing::warn!(error = %e, "refresh-on-all-pessimized failed");
            }
        }
        self.table
            .get_endpoint()
            .ok_or_else(|| YdbError::status(ydb_shared::StatusCode::Unavailable, "no endpoints available"))
    }

    pub fn pessimization_delay(&self) -> Duration {
        self.pessimization_delay
    }

    /// Cancels the periodic refresh and any in-flight refresh. Subsequent
    /// `get_endpoint()` calls still work against the last known table, but
    /// it will never update again.
    pub fn destroy(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_diffs_by_host_and_port() {
        let table = EndpointTableHandle::new();
        let (added, removed) = table.replace(vec![
            Endpoint::new("a", 1, "/db"),
            Endpoint::new("b", 2, "/db"),
        ]);
        assert_eq!(added.len(), 2);
        assert_eq!(removed.len(), 0);

        let (added, removed) = table.replace(vec![
            Endpoint::new("a", 1, "/db"),
            Endpoint::new("c", 3, "/db"),
        ]);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].host, "c");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].host, "b");
    }

    #[test]
    fn pessimization_survives_a_refresh_that_keeps_the_endpoint() {
        let table = EndpointTableHandle::new();
        table.replace(vec![Endpoint::new("a", 1, "/db")]);
        let e = Endpoint::new("a", 1, "/db");
        table.pessimize_for(&e, Duration::from_secs(60));
        assert!(table.get_endpoint().is_none());

        table.replace(vec![Endpoint::new("a", 1, "/db"), Endpoint::new("b", 2, "/db")]);
        // "a" is still pessimized, so only "b" should come back.
        let picked = table.get_endpoint().unwrap();
        assert_eq!(picked.host, "b");
    }

    #[test]
    fn get_endpoint_picks_lowest_load_factor() {
        let table = EndpointTableHandle::new();
        table.replace(vec![
            Endpoint::new("a", 1, "/db").with_load_factor(0.9),
            Endpoint::new("b", 2, "/db").with_load_factor(0.1),
        ]);
        let picked = table.get_endpoint().unwrap();
        assert_eq!(picked.host, "b");
    }

    #[test]
    fn all_pessimized_is_true_only_when_every_endpoint_is_down() {
        let table = EndpointTableHandle::new();
        table.replace(vec![Endpoint::new("a", 1, "/db"), Endpoint::new("b", 2, "/db")]);
        assert!(!table.all_pessimized());
        let a = Endpoint::new("a", 1, "/db");
        table.pessimize_for(&a, Duration::from_secs(60));
        assert!(!table.all_pessimized());
        let b = Endpoint::new("b", 2, "/db");
        table.pessimize_for(&b, Duration::from_secs(60));
        assert!(table.all_pessimized());
    }
}
