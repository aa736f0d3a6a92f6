//! Client-side runtime for a gRPC-based distributed SQL driver.
//!
//! This crate wires together the four subsystems described in the design:
//! endpoint discovery (`discovery`), the session pool (`pool`, `session`),
//! the retry engine (`retry`), and the auth pipeline (`auth`). `driver`
//! assembles them behind the public `Driver`/`TableClient`/`SchemeClient`
//! surface.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod auth;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod pb;
pub mod pool;
pub mod retry;
pub mod session;
pub mod transport;

pub use config::DriverSettings;
pub use driver::{Driver, DriverBuilder, SchemeClient, TableClient};
pub use pool::{PoolStats, SessionPool};
pub use retry::with_retries;
pub use session::tx::{TransactionSettings, TxControl, AUTO_TX};
pub use session::{Column, QuerySource, Session, SessionState, TableDescription};

pub use ydb_shared::{RetryParameters, StatusCode, YdbError, YdbResult};
