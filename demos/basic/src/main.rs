//! Cold-start example (spec.md section 8, scenario 1): connect, wait for the
//! first discovery refresh, then run a trivial query through the session
//! pool. Mirrors the teacher's worker `main.rs`: init tracing, load `.env`,
//! read env vars directly rather than pushing that parsing into the library.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use ydb_driver::auth::StaticTokenAuth;
use ydb_driver::{Driver, QuerySource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    let entry_point = std::env::var("YDB_ENDPOINT").unwrap_or_else(|_| "grpc://localhost:2135".to_string());
    let database = std::env::var("YDB_DATABASE").unwrap_or_else(|_| "/Root/mydb".to_string());
    let token = std::env::var("YDB_TOKEN").unwrap_or_default();

    if token.is_empty() {
        warn!("YDB_TOKEN not set; connecting with an empty static token");
    }

    info!(entry_point = %entry_point, database = %database, "starting basic demo");

    let auth = Arc::new(StaticTokenAuth::new(token, database.clone()));
    let driver = Driver::connect(entry_point, database, auth).await?;

    if !driver.ready(Duration::from_secs(5)).await {
        anyhow::bail!("driver did not become ready within 5s (no reachable endpoints?)");
    }
    info!("driver ready");

    let result = driver
        .table_client()
        .with_session(Duration::from_secs(5), |session| async move {
            session
                .execute_query(QuerySource::Text("SELECT 1".to_string()), Default::default(), None)
                .await
        })
        .await?;

    for result_set in &result.result_sets {
        for row in &result_set.rows {
            info!(?row, "row");
        }
    }

    driver.destroy().await;
    Ok(())
}
