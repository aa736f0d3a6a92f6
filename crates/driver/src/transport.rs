//! RPC transport (C2): attaches auth metadata to every unary call, times it
//! out, and reports failures back to discovery for pessimization.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tonic::Request;

use ydb_shared::{Endpoint, StatusCode, YdbError, YdbResult};

use crate::auth::AuthProvider;
use crate::discovery::EndpointTableHandle;
use crate::pb;

/// Builds a lazily-connecting channel for one endpoint's `host:port`,
/// honoring the scheme (`grpc://` vs `grpcs://`) of the entry point the
/// driver was constructed with.
pub fn build_channel(scheme: &str, host: &str, port: u16) -> YdbResult<tonic::transport::Channel> {
    let uri = format!("{scheme}://{host}:{port}");
    tonic::transport::Channel::from_shared(uri.clone())
        .map_err(|e| YdbError::InvalidArgument(format!("invalid endpoint uri {uri}: {e}")))
        .map(|c| c.connect_lazy())
}

/// `grpc://` -> `http`, `grpcs://` -> `https`. Anything else is passed
/// through unchanged (callers may already hand us an `http(s)://` entry
/// point in tests).
pub fn wire_scheme(entry_point: &str) -> &'static str {
    if entry_point.starts_with("grpcs://") || entry_point.starts_with("https://") {
        "https"
    } else {
        "http"
    }
}

/// Wraps a generated tonic client bound to one endpoint. `C` is cheap to
/// clone (tonic clients wrap a `Channel`, which is itself a cheap handle),
/// so `call` clones it per invocation rather than holding a lock.
#[derive(Clone)]
pub struct Transport<C> {
    endpoint: Endpoint,
    client: C,
    auth: Arc<dyn AuthProvider>,
    timeout: Duration,
    table: EndpointTableHandle,
}

impl<C: Clone> Transport<C> {
    pub fn new(
        endpoint: Endpoint,
        client: C,
        auth: Arc<dyn AuthProvider>,
        timeout: Duration,
        table: EndpointTableHandle,
    ) -> Self {
        Self {
            endpoint,
            client,
            auth,
            timeout,
            table,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// `withTimeout(promise, ms)` from spec.md section 4.2: obtains auth
    /// metadata, attaches it, races the call against `timeout`, and
    /// pessimizes the owning endpoint on any transport-level failure.
    pub async fn call<Req, Resp, F, Fut>(&self, req: Req, f: F) -> YdbResult<Resp>
    where
        F: FnOnce(C, Request<Req>) -> Fut,
        Fut: Future<Output = Result<tonic::Response<Resp>, tonic::Status>>,
    {
        let metadata = self.auth.get_auth_metadata().await?;
        let mut request = Request::new(req);
        metadata.attach(request.metadata_mut())?;

        let client = self.client.clone();
        match tokio::time::timeout(self.timeout, f(client, request)).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => {
                tracing::warn!(
                    endpoint = %self.endpoint.address(),
                    code = ?status.code(),
                    "rpc returned an error status"
                );
                self.table.pessimize(&self.endpoint);
                Err(classify_grpc_status(&status))
            }
            Err(_) => {
                tracing::warn!(
                    endpoint = %self.endpoint.address(),
                    timeout = ?self.timeout,
                    "rpc timed out"
                );
                self.table.pessimize(&self.endpoint);
                Err(YdbError::TimeoutExpired(format!(
                    "rpc to {} exceeded {:?}",
                    self.endpoint.address(),
                    self.timeout
                )))
            }
        }
    }
}

/// Maps a gRPC transport-level status onto our error taxonomy. This is
/// distinct from `check_status`, which inspects the application-level
/// `Status` message embedded in a successful response body.
fn classify_grpc_status(status: &tonic::Status) -> YdbError {
    use tonic::Code;
    let code = match status.code() {
        Code::Unavailable => StatusCode::Unavailable,
        Code::DeadlineExceeded => StatusCode::Timeout,
        Code::Cancelled => StatusCode::Cancelled,
        Code::Unauthenticated | Code::PermissionDenied => StatusCode::Unauthorized,
        Code::InvalidArgument => StatusCode::BadRequest,
        Code::NotFound => StatusCode::SchemeError,
        Code::Ok => StatusCode::Success,
        _ => StatusCode::InternalError,
    };
    YdbError::status(code, status.message())
}

/// Checks the application-level `Status` embedded in a response body (spec.md
/// distinguishes this from the gRPC transport status: a call can succeed at
/// the transport layer and still carry a non-success application status).
pub fn check_status(status: Option<pb::Status>) -> YdbResult<()> {
    let status = status.unwrap_or_default();
    let code = StatusCode::from_wire_code(status.code);
    if code.is_success() {
        return Ok(());
    }
    if code == StatusCode::SchemeError {
        return Err(YdbError::Scheme(status.message));
    }
    Err(YdbError::status(code, status.message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_scheme_maps_grpc_and_grpcs() {
        assert_eq!(wire_scheme("grpc://host:2135"), "http");
        assert_eq!(wire_scheme("grpcs://host:2135"), "https");
        assert_eq!(wire_scheme("host:2135"), "http");
    }

    #[test]
    fn check_status_tolerates_scheme_error_as_scheme_not_status() {
        let status = pb::Status {
            code: 6,
            message: "path not found".to_string(),
        };
        let err = check_status(Some(status)).unwrap_err();
        assert!(matches!(err, YdbError::Scheme(_)));
    }

    #[test]
    fn check_status_success_is_ok() {
        let status = pb::Status {
            code: 0,
            message: String::new(),
        };
        assert!(check_status(Some(status)).is_ok());
    }
}
