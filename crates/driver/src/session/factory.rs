//! Session factory (C4): one instance per endpoint. `create()` mints a new
//! server-side session and binds it for life to the endpoint it was
//! created on.

use std::sync::Arc;
use std::time::Duration;

use ydb_shared::{Endpoint, RetryParameters, YdbResult};

use crate::auth::AuthProvider;
use crate::discovery::EndpointTableHandle;
use crate::pb;
use crate::pb::table_service_client::TableServiceClient;
use crate::retry::with_retries;
use crate::transport::{build_channel, check_status, Transport};

use super::{Session, SessionEventSender};

pub struct SessionFactory {
    endpoint: Endpoint,
    transport: Transport<TableServiceClient<tonic::transport::Channel>>,
    operation_retry: RetryParameters,
}

impl SessionFactory {
    pub fn new(
        scheme: &str,
        endpoint: Endpoint,
        auth: Arc<dyn AuthProvider>,
        table: EndpointTableHandle,
        operation_timeout: Duration,
        operation_retry: RetryParameters,
    ) -> YdbResult<Self> {
        let channel = build_channel(scheme, &endpoint.host, endpoint.port)?;
        let client = TableServiceClient::new(channel);
        let transport = Transport::new(endpoint.clone(), client, auth, operation_timeout, table);
        Ok(Self {
            endpoint,
            transport,
            operation_retry,
        })
    }

    /// `create()` itself is retryable and pessimizable: failures to mint a
    /// session retry through the same policy as any other session-bound
    /// operation, against the same (possibly now-pessimized) endpoint.
    pub async fn create(&self, events: SessionEventSender) -> YdbResult<Arc<Session>> {
        let transport = self.transport.clone();
        let session_id = with_retries(
            || {
                let transport = transport.clone();
                async move {
                    let resp = transport
                        .call(pb::CreateSessionRequest {}, |mut c, r| async move {
                            c.create_session(r).await
                        })
                        .await?;
                    check_status(resp.status)?;
                    Ok(resp.session_id)
                }
            },
            self.operation_retry,
        )
        .await?;

        tracing::info!(
            session_id = %session_id,
            endpoint = %self.endpoint.address(),
            "session created"
        );

        Ok(Arc::new(Session::new(
            session_id,
            self.endpoint.clone(),
            self.transport.clone(),
            events,
            self.operation_retry,
        )))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
