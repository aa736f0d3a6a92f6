//! Static-token auth variant: the token never changes, so there is nothing
//! to cache or refresh.

use async_trait::async_trait;

use ydb_shared::YdbResult;

use super::{AuthMetadata, AuthProvider};

/// Returns `{x-ydb-auth-ticket: token, x-ydb-database: db}` unchanged on
/// every call.
#[derive(Debug, Clone)]
pub struct StaticTokenAuth {
    token: String,
    database: String,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            database: database.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    async fn get_auth_metadata(&self) -> YdbResult<AuthMetadata> {
        Ok(AuthMetadata {
            token: self.token.clone(),
            database: self.database.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_the_same_token_every_call() {
        let auth = StaticTokenAuth::new("abc123", "/Root/mydb");
        let first = auth.get_auth_metadata().await.unwrap();
        let second = auth.get_auth_metadata().await.unwrap();
        assert_eq!(first.token, "abc123");
        assert_eq!(second.token, "abc123");
        assert_eq!(first.database, "/Root/mydb");
    }
}
