//! Instance-metadata auth variant: delegates token acquisition to a
//! platform-provided token service (e.g. a VM metadata endpoint) that the
//! driver only sees through `TokenService::get_token`/`initialize`.

use std::time::Duration;

use async_trait::async_trait;

use ydb_shared::{YdbError, YdbResult};

use super::{AuthMetadata, AuthProvider};

const MAX_TRIES: u32 = 5;
const TRIES_INTERVAL: Duration = Duration::from_millis(2000);

/// The platform collaborator this variant delegates to. The driver never
/// talks to the metadata endpoint directly — only through this trait, so
/// tests can supply a fake.
#[async_trait]
pub trait TokenService: Send + Sync {
    async fn get_token(&self) -> Option<String>;

    /// Called once, lazily, the first time no token is cached yet. Default
    /// no-op for services that don't need a warm-up step.
    async fn initialize(&self) -> YdbResult<()> {
        Ok(())
    }
}

pub struct InstanceMetadataAuth {
    token_service: Box<dyn TokenService>,
    database: String,
    initialized: tokio::sync::Mutex<bool>,
}

impl InstanceMetadataAuth {
    pub fn new(token_service: Box<dyn TokenService>, database: impl Into<String>) -> Self {
        Self {
            token_service,
            database: database.into(),
            initialized: tokio::sync::Mutex::new(false),
        }
    }
}

#[async_trait]
impl AuthProvider for InstanceMetadataAuth {
    async fn get_auth_metadata(&self) -> YdbResult<AuthMetadata> {
        if let Some(token) = self.token_service.get_token().await {
            return Ok(AuthMetadata {
                token,
                database: self.database.clone(),
            });
        }

        let mut initialized = self.initialized.lock().await;
        if !*initialized {
            self.token_service.initialize().await?;
            *initialized = true;
        }
        drop(initialized);

        for attempt in 0..MAX_TRIES {
            if let Some(token) = self.token_service.get_token().await {
                return Ok(AuthMetadata {
                    token,
                    database: self.database.clone(),
                });
            }
            tracing::debug!(attempt, "instance metadata token not yet available");
            if attempt + 1 < MAX_TRIES {
                tokio::time::sleep(TRIES_INTERVAL).await;
            }
        }

        Err(YdbError::Auth(format!(
            "instance metadata token unavailable after {MAX_TRIES} tries at {TRIES_INTERVAL:?} intervals"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyService {
        calls_before_ready: u32,
        calls: Arc<AtomicU32>,
        init_calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TokenService for FlakyService {
        async fn get_token(&self) -> Option<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.calls_before_ready {
                Some("platform-token".to_string())
            } else {
                None
            }
        }

        async fn initialize(&self) -> YdbResult<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_token_available_then_stops() {
        let calls = Arc::new(AtomicU32::new(0));
        let init_calls = Arc::new(AtomicU32::new(0));
        let service = FlakyService {
            calls_before_ready: 2,
            calls: calls.clone(),
            init_calls: init_calls.clone(),
        };
        let auth = InstanceMetadataAuth::new(Box::new(service), "/Root/db");
        let meta = auth.get_auth_metadata().await.unwrap();
        assert_eq!(meta.token, "platform-token");
        assert_eq!(init_calls.load(Ordering::SeqCst), 1);
    }

    struct NeverReady;

    #[async_trait]
    impl TokenService for NeverReady {
        async fn get_token(&self) -> Option<String> {
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fails_descriptively_after_max_tries() {
        let auth = InstanceMetadataAuth::new(Box::new(NeverReady), "/Root/db");
        let err = auth.get_auth_metadata().await.unwrap_err();
        assert!(matches!(err, YdbError::Auth(_)));
    }
}
