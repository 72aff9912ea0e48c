use std::sync::Arc;

use chrono::Utc;
use rocket::tokio;

use crate::state::AppState;

/// Periodically write buffered check-ins to `hosts.seen_time`.
pub fn spawn_seen_flush(state: Arc<AppState>) {
    let interval = state.settings().seen_flush_interval();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let now = Utc::now().naive_utc();
            match state.run(move |svc| svc.flush_seen_hosts(now)).await {
                Ok(0) => {}
                Ok(n) => log::debug!("flushed seen time for {} hosts", n),
                Err(e) => log::error!("seen flush failed: {}", e),
            }
        }
    });
}
