use std::sync::Arc;

use rocket::tokio;

use crate::db::DbPool;
use crate::error::Result;
use crate::service::FleetService;
use crate::settings::ServerSettings;

/// Shared state managed by rocket and handed to the background sweepers.
pub struct AppState {
    pub service: Arc<FleetService>,
}

impl AppState {
    pub fn new(pool: DbPool, settings: ServerSettings) -> Self {
        AppState {
            service: Arc::new(FleetService::new(pool, settings)),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        self.service.settings()
    }

    /// Run a blocking facade call off the async executor.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FleetService) -> Result<T> + Send + 'static,
    {
        let service = Arc::clone(&self.service);
        tokio::task::spawn_blocking(move || f(&service)).await?
    }
}
