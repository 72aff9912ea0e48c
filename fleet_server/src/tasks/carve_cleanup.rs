use std::sync::Arc;

use chrono::Utc;
use rocket::tokio;

use crate::state::AppState;

/// Expire day-old carve sessions. A failed run is logged and retried on the
/// next tick.
pub fn spawn_carve_cleanup(state: Arc<AppState>) {
    let interval = state.settings().carve_cleanup_interval();
    tokio::spawn(async move {
        loop {
            let now = Utc::now().naive_utc();
            if let Err(e) = state.run(move |svc| svc.cleanup_carves(now)).await {
                log::error!("carve cleanup failed: {}", e);
            }

            tokio::time::sleep(interval).await;
        }
    });
}
