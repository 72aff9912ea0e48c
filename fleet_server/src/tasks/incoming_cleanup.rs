use std::sync::Arc;

use chrono::Utc;
use rocket::tokio;

use crate::state::AppState;

pub fn spawn_incoming_cleanup(state: Arc<AppState>) {
    let interval = state.settings().incoming_cleanup_interval();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let now = Utc::now().naive_utc();
            if let Err(e) = state.run(move |svc| svc.cleanup_incoming_hosts(now)).await {
                log::error!("incoming host cleanup failed: {}", e);
            }
        }
    });
}
