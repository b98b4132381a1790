//! services/api/src/web/quota_task.rs
//!
//! The scheduled monthly quota sweep. Sleeps until the first moment of the
//! next calendar month, runs the platform-wide reset, and goes back to
//! sleep. Failures are logged and the loop keeps going; the next boundary
//! gets another chance.

use chrono::Utc;
use concierge_core::quota;
use concierge_core::store::DocumentStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

pub async fn run_monthly_reset(store: Arc<dyn DocumentStore>) {
    loop {
        let now = Utc::now();
        let boundary = quota::first_of_next_month(now);
        let wait = (boundary - now)
            .to_std()
            .unwrap_or(Duration::from_secs(60));
        info!(%boundary, "quota sweep sleeping until next month boundary");
        sleep(wait).await;

        match quota::reset_monthly_counts(store.as_ref(), Utc::now()).await {
            Ok(reset) => info!(properties = reset, "monthly quota sweep ran"),
            Err(e) => error!("monthly quota sweep failed: {e}"),
        }
    }
}
