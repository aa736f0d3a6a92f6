//! Auth provider pipeline (C1).
//!
//! Three variants share one capability — `get_auth_metadata()` — and each
//! caches/refreshes on its own schedule. Concurrency is handled the way
//! `plexmcp-api`'s `AuthState` coalesces Supabase verification: a lock held
//! across the whole check-then-refresh decision, so concurrent callers pile
//! up behind the first refresher instead of each firing their own RPC.

mod iam;
mod instance_metadata;
mod static_token;

pub use iam::IamJwtAuth;
pub use instance_metadata::{InstanceMetadataAuth, TokenService};
pub use static_token::StaticTokenAuth;

use async_trait::async_trait;
use tonic::metadata::MetadataMap;

use ydb_shared::{YdbError, YdbResult};

/// The two headers every unary call must carry (spec.md section 6).
#[derive(Debug, Clone)]
pub struct AuthMetadata {
    pub token: String,
    pub database: String,
}

impl AuthMetadata {
    /// Attaches both required headers, or fails — invariant 6 requires
    /// metadata to always carry exactly the two headers, so a value that
    /// can't be encoded as ASCII metadata (non-ASCII or control characters)
    /// must surface as an error rather than silently omit the header.
    pub fn attach(&self, metadata: &mut MetadataMap) -> YdbResult<()> {
        let token_value = self
            .token
            .parse()
            .map_err(|e| YdbError::Auth(format!("invalid x-ydb-auth-ticket metadata value: {e}")))?;
        let database_value = self
            .database
            .parse()
            .map_err(|e| YdbError::Auth(format!("invalid x-ydb-database metadata value: {e}")))?;
        metadata.insert("x-ydb-auth-ticket", token_value);
        metadata.insert("x-ydb-database", database_value);
        Ok(())
    }
}

/// Polymorphic auth capability consumed by `Transport` before every unary
/// call. Implementations must tolerate concurrent callers during a refresh
/// without each one triggering its own round trip to the token issuer.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_auth_metadata(&self) -> YdbResult<AuthMetadata>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_sets_exactly_the_two_required_headers() {
        let meta = AuthMetadata {
            token: "T".to_string(),
            database: "/Root/db".to_string(),
        };
        let mut headers = MetadataMap::new();
        meta.attach(&mut headers).unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("x-ydb-auth-ticket").unwrap(), "T");
        assert_eq!(headers.get("x-ydb-database").unwrap(), "/Root/db");
    }

    #[test]
    fn attach_fails_instead_of_dropping_an_unencodable_header() {
        let meta = AuthMetadata {
            token: "bad\nvalue".to_string(),
            database: "/Root/db".to_string(),
        };
        let mut headers = MetadataMap::new();
        let err = meta.attach(&mut headers).unwrap_err();
        assert!(matches!(err, YdbError::Auth(_)));
        assert!(headers.is_empty());
    }
}
