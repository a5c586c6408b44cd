//! Content Governor Demo Application
//!
//! Walks one key through hit, miss, stale and empty outcomes against a tight
//! provider limit.
//!
//! Usage:
//!   cargo run --example governor_demo
//!
//! Environment variables:
//!   FEEDGATE_ENV - staging or production limit table (default: production)

use feedgate_cache::{
    ContentGovernor, GovernorConfig, ManualClock, MemorySessionStore, Priority, ProviderLimits, QuotaTables,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("=== Content Governor Demo ===");

    let clock = Arc::new(ManualClock::at_millis(chrono::Utc::now().timestamp_millis()));
    let config = GovernorConfig::builder()
        .quota(QuotaTables::empty().with_provider("gnews", ProviderLimits::new(10, 2, 0)))
        .ttl_jitter(0.0)
        .build();
    let governor = ContentGovernor::new(config, Arc::new(MemorySessionStore::new()), clock.clone())?;

    let mut edition = 0;
    let mut fetch_headlines = || {
        edition += 1;
        let headlines = vec![format!("Headline, edition {}", edition)];
        async move { Ok::<_, String>(headlines) }
    };

    info!("\n--- First request (nothing cached) ---");
    let response = governor
        .fetch_content("news_top", Priority::High, "gnews", &mut fetch_headlines)
        .await;
    info!("✓ {}: {:?}", response.status, response.data);

    info!("\n--- Second request (within TTL) ---");
    let response = governor
        .fetch_content("news_top", Priority::High, "gnews", &mut fetch_headlines)
        .await;
    info!("✓ {}: {:?}", response.status, response.data);

    info!("\n--- Three hours later (past the high-priority TTL) ---");
    clock.advance(Duration::from_secs(3 * 3600));
    let response = governor
        .fetch_content("news_top", Priority::High, "gnews", &mut fetch_headlines)
        .await;
    info!("✓ {}: {:?}", response.status, response.data);

    info!("\n--- Three more hours, hourly limit spent by other callers ---");
    clock.advance(Duration::from_secs(3 * 3600));
    governor.ledger().record_call("gnews", None, None).await;
    governor.ledger().record_call("gnews", None, None).await;
    let response = governor
        .fetch_content("news_top", Priority::High, "gnews", &mut fetch_headlines)
        .await;
    info!("✗ {}: {:?}", response.status, response.data);
    info!("  {}", governor.quota_usage("gnews").await);

    info!("\n--- Unknown key with no quota left ---");
    let response = governor
        .fetch_content("funding_z", Priority::Medium, "gnews", &mut fetch_headlines)
        .await;
    info!("✗ {}: {:?}", response.status, response.data);

    info!("\n--- Cleanup ---");
    let report = governor.perform_cleanup().await;
    info!("{}", report);
    info!("{}", governor.get_stats().await);

    Ok(())
}
