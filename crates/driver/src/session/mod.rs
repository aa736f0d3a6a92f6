//! Session (C5): the stateful handle bound for life to the endpoint it was
//! created on. Supports table DDL, query prepare/execute, transactions, and
//! keepalive; transitions drive the pool via `SessionEvent`.

pub mod factory;
pub mod tx;

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use tokio::sync::mpsc;
use tonic::transport::Channel;

use ydb_shared::{Endpoint, RetryParameters, YdbError, YdbResult};

use crate::pb;
use crate::pb::table_service_client::TableServiceClient;
use crate::retry::{classify_error, with_retries};
use crate::transport::{check_status, Transport};

pub use tx::{TransactionSettings, TxControl, AUTO_TX};

/// Events a `Session` pushes to its owning pool. Exactly one subscriber per
/// kind (the pool's event-consumer task) — spec.md's design notes model
/// `SESSION_RELEASE`/`SESSION_BROKEN` as a typed notification channel
/// rather than a generic emitter.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Released(String),
    Broken(String),
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Free,
    Acquired,
    Broken,
    Deleted,
}

#[derive(Debug, Default)]
struct Flags {
    acquired: bool,
    broken: bool,
    deleted: bool,
}

/// A column in a `CREATE TABLE` / `DESCRIBE TABLE` schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Builder for `createTable`/`describeTable` schemas (public API surface,
/// spec.md section 6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDescription {
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
}

impl TableDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key.push(key.into());
        self
    }
}

/// Source text for `executeQuery`: either a previously prepared handle or
/// ad-hoc YQL text (spec.md section 4.5).
#[derive(Debug, Clone)]
pub enum QuerySource {
    Prepared(String),
    Text(String),
}

#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub column_names: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteResult {
    pub result_sets: Vec<ResultSet>,
    pub tx_id: Option<String>,
}

type SessionTransport = Transport<TableServiceClient<Channel>>;

pub struct Session {
    id: String,
    endpoint: Endpoint,
    transport: SessionTransport,
    flags: StdMutex<Flags>,
    events: SessionEventSender,
    last_idle_since: StdMutex<Instant>,
    internal_retry: RetryParameters,
}

impl Session {
    pub(crate) fn new(
        id: String,
        endpoint: Endpoint,
        transport: SessionTransport,
        events: SessionEventSender,
        internal_retry: RetryParameters,
    ) -> Self {
        Self {
            id,
            endpoint,
            transport,
            flags: StdMutex::new(Flags::default()),
            events,
            last_idle_since: StdMutex::new(Instant::now()),
            internal_retry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        let flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        if flags.deleted {
            SessionState::Deleted
        } else if flags.broken {
            SessionState::Broken
        } else if flags.acquired {
            SessionState::Acquired
        } else {
            SessionState::Free
        }
    }

    /// Idle time since the last `release()` (or construction, for a session
    /// that has never been acquired). Used by the pool's idle-shrinkage
    /// sweep (SPEC_FULL.md section B).
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_idle_since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// `Free` -> `Acquired`. Callers are expected to only invoke this on a
    /// session already known to be `Free` (the pool's scan-then-reserve
    /// step guarantees this under its own lock); returns an error instead of
    /// panicking if that invariant is ever violated.
    pub fn acquire(&self) -> YdbResult<()> {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        if flags.deleted {
            return Err(YdbError::Destroyed("session"));
        }
        if flags.acquired {
            return Err(YdbError::InvalidArgument(
                "acquire() called on an already-acquired session".to_string(),
            ));
        }
        flags.acquired = true;
        Ok(())
    }

    /// `Acquired` -> `Free`; emits `SESSION_RELEASE` so the pool can hand
    /// the session to a waiter.
    pub fn release(&self) {
        {
            let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
            flags.acquired = false;
        }
        *self.last_idle_since.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        let _ = self.events.send(SessionEvent::Released(self.id.clone()));
    }

    fn mark_broken(&self) {
        let already_broken = {
            let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
            let was = flags.broken;
            flags.broken = true;
            was
        };
        if !already_broken {
            tracing::warn!(session_id = %self.id, "session marked broken");
            let _ = self.events.send(SessionEvent::Broken(self.id.clone()));
        }
    }

    /// Idempotent; a no-op when already `Deleted`.
    pub async fn delete(&self) -> YdbResult<()> {
        {
            let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
            if flags.deleted {
                return Ok(());
            }
            flags.deleted = true;
        }
        let resp = self
            .transport
            .call(
                pb::DeleteSessionRequest {
                    session_id: self.id.clone(),
                },
                |mut c, r| async move { c.delete_session(r).await },
            )
            .await?;
        check_status(resp.status)
    }

    /// Runs `op`, optionally under the retry engine, and marks the session
    /// `Broken` (firing `SESSION_BROKEN`) if the final error is classified
    /// session-scoped. Every decorated op except `execute_query` passes
    /// `retryable = true`.
    async fn run<F, Fut, T>(&self, retryable: bool, op: F) -> YdbResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = YdbResult<T>>,
    {
        let result = if retryable {
            with_retries(&op, self.internal_retry).await
        } else {
            op().await
        };
        if let Err(ref e) = result {
            if matches!(classify_error(e), ydb_shared::RetryClass::SessionBroken) {
                self.mark_broken();
            }
        }
        result
    }

    pub async fn keep_alive(&self) -> YdbResult<()> {
        self.run(true, || async {
            let resp = self
                .transport
                .call(
                    pb::KeepAliveRequest {
                        session_id: self.id.clone(),
                    },
                    |mut c, r| async move { c.keep_alive(r).await },
                )
                .await?;
            check_status(resp.status)
        })
        .await
    }

    /// `path` is composed as `database/path` (spec.md section 4.5).
    fn full_path(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint.database.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub async fn create_table(&self, path: &str, description: TableDescription) -> YdbResult<()> {
        let full_path = self.full_path(path);
        self.run(true, || async {
            let resp = self
                .transport
                .call(
                    pb::CreateTableRequest {
                        session_id: self.id.clone(),
                        path: full_path.clone(),
                        columns: description
                            .columns
                            .iter()
                            .map(|c| pb::ColumnDescription {
                                name: c.name.clone(),
                                r#type: c.type_name.clone(),
                            })
                            .collect(),
                        primary_key: description.primary_key.clone(),
                    },
                    |mut c, r| async move { c.create_table(r).await },
                )
                .await?;
            check_status(resp.status)
        })
        .await
    }

    /// Tolerates a scheme-error status as success-equivalent (dropping a
    /// table that doesn't exist is not an error).
    pub async fn drop_table(&self, path: &str) -> YdbResult<()> {
        let full_path = self.full_path(path);
        let result = self
            .run(true, || async {
                let resp = self
                    .transport
                    .call(
                        pb::DropTableRequest {
                            session_id: self.id.clone(),
                            path: full_path.clone(),
                        },
                        |mut c, r| async move { c.drop_table(r).await },
                    )
                    .await?;
                check_status(resp.status)
            })
            .await;
        match result {
            Err(ref e) if e.is_tolerable_scheme_error() => Ok(()),
            other => other,
        }
    }

    pub async fn describe_table(&self, path: &str) -> YdbResult<TableDescription> {
        let full_path = self.full_path(path);
        self.run(true, || async {
            let resp = self
                .transport
                .call(
                    pb::DescribeTableRequest {
                        session_id: self.id.clone(),
                        path: full_path.clone(),
                    },
                    |mut c, r| async move { c.describe_table(r).await },
                )
                .await?;
            check_status(resp.status.clone())?;
            Ok(TableDescription {
                columns: resp
                    .columns
                    .iter()
                    .map(|c| Column::new(c.name.clone(), c.r#type.clone()))
                    .collect(),
                primary_key: resp.primary_key.clone(),
            })
        })
        .await
    }

    /// Fails if the server returns an empty `tx_meta` (`tx_id`).
    pub async fn begin_transaction(&self, settings: TransactionSettings) -> YdbResult<String> {
        self.run(true, || async {
            let resp = self
                .transport
                .call(
                    pb::BeginTransactionRequest {
                        session_id: self.id.clone(),
                        settings: Some(pb::TransactionSettings {
                            serializable_read_write: settings.serializable_read_write,
                        }),
                    },
                    |mut c, r| async move { c.begin_transaction(r).await },
                )
                .await?;
            check_status(resp.status)?;
            if resp.tx_id.is_empty() {
                return Err(YdbError::EmptyPayload("beginTransaction returned empty tx_meta"));
            }
            Ok(resp.tx_id)
        })
        .await
    }

    pub async fn commit_transaction(&self, tx_id: &str) -> YdbResult<()> {
        let tx_id = tx_id.to_string();
        self.run(true, || async {
            let resp = self
                .transport
                .call(
                    pb::CommitTransactionRequest {
                        session_id: self.id.clone(),
                        tx_id: tx_id.clone(),
                    },
                    |mut c, r| async move { c.commit_transaction(r).await },
                )
                .await?;
            check_status(resp.status)
        })
        .await
    }

    pub async fn rollback_transaction(&self, tx_id: &str) -> YdbResult<()> {
        let tx_id = tx_id.to_string();
        self.run(true, || async {
            let resp = self
                .transport
                .call(
                    pb::RollbackTransactionRequest {
                        session_id: self.id.clone(),
                        tx_id: tx_id.clone(),
                    },
                    |mut c, r| async move { c.rollback_transaction(r).await },
                )
                .await?;
            check_status(resp.status)
        })
        .await
    }

    pub async fn prepare_query(&self, yql_text: &str) -> YdbResult<String> {
        let yql_text = yql_text.to_string();
        self.run(true, || async {
            let resp = self
                .transport
                .call(
                    pb::PrepareDataQueryRequest {
                        session_id: self.id.clone(),
                        yql_text: yql_text.clone(),
                    },
                    |mut c, r| async move { c.prepare_data_query(r).await },
                )
                .await?;
            check_status(resp.status)?;
            Ok(resp.query_id)
        })
        .await
    }

    /// Not internally retried — decorated only with pessimization via
    /// `Transport`; the caller composes `with_retries` around it
    /// explicitly (spec.md section 4.5/4.7; open question in section 9).
    pub async fn execute_query(
        &self,
        source: QuerySource,
        parameters: HashMap<String, serde_json::Value>,
        tx_control: Option<TxControl>,
    ) -> YdbResult<ExecuteResult> {
        let (query_id, yql_text) = match source {
            QuerySource::Prepared(id) => (id, String::new()),
            QuerySource::Text(text) => (String::new(), text),
        };
        let tx_control = tx_control.unwrap_or(AUTO_TX).into_wire();
        let wire_params = parameters
            .into_iter()
            .map(|(k, v)| {
                (
                    k,
                    pb::Value {
                        json: v.to_string(),
                    },
                )
            })
            .collect();

        let result = self
            .run(false, || async {
                let resp = self
                    .transport
                    .call(
                        pb::ExecuteDataQueryRequest {
                            session_id: self.id.clone(),
                            query_id: query_id.clone(),
                            yql_text: yql_text.clone(),
                            parameters: wire_params_clone(&wire_params),
                            tx_control: Some(tx_control.clone()),
                        },
                        |mut c, r| async move { c.execute_data_query(r).await },
                    )
                    .await?;
                check_status(resp.status)?;
                Ok(ExecuteResult {
                    result_sets: resp
                        .result_sets
                        .into_iter()
                        .map(|rs| ResultSet {
                            column_names: rs.column_names,
                            rows: rs
                                .rows
                                .into_iter()
                                .map(|row| {
                                    row.columns
                                        .into_iter()
                                        .map(|v| {
                                            serde_json::from_str(&v.json)
                                                .unwrap_or(serde_json::Value::Null)
                                        })
                                        .collect()
                                })
                                .collect(),
                        })
                        .collect(),
                    tx_id: if resp.tx_id.is_empty() {
                        None
                    } else {
                        Some(resp.tx_id)
                    },
                })
            })
            .await;
        result
    }
}

fn wire_params_clone(
    params: &HashMap<String, pb::Value>,
) -> HashMap<String, pb::Value> {
    params.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_path_composes_database_and_path() {
        let endpoint = Endpoint::new("h", 1, "/Root/mydb");
        // Transport can't be constructed without a real channel here; test
        // the pure path-composition helper via a Session built by the
        // factory tests instead. This test documents the expected shape.
        assert_eq!(
            format!("{}/{}", endpoint.database.trim_end_matches('/'), "tbl".trim_start_matches('/')),
            "/Root/mydb/tbl"
        );
    }

    #[test]
    fn table_description_builder_accumulates_columns_and_keys() {
        let desc = TableDescription::new()
            .with_column(Column::new("id", "Uint64"))
            .with_column(Column::new("name", "Utf8"))
            .with_primary_key("id");
        assert_eq!(desc.columns.len(), 2);
        assert_eq!(desc.primary_key, vec!["id".to_string()]);
    }
}
