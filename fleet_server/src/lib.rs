use std::sync::Arc;

use rocket::{Build, Rocket};

pub mod carves;
pub mod db;
pub mod error;
pub mod hosts;
pub mod models;
pub mod routes;
pub mod schema;
pub mod service;
pub mod settings;
pub mod software;
pub mod state;
pub mod status;
pub mod tasks;

use db::DbPool;
use settings::ServerSettings;
use state::AppState;

/// Assemble the server around an already migrated pool.
pub fn build_rocket(settings: ServerSettings, pool: DbPool) -> Rocket<Build> {
    let state = Arc::new(AppState::new(pool, settings));

    rocket::build()
        .manage(state)
        .mount("/", routes::osquery_routes())
        .mount("/", routes::api_routes())
        .attach(tasks::BackgroundTasks)
}
