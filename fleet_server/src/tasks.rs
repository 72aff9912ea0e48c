use std::sync::Arc;

use chrono::Utc;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Build, Orbit, Rocket};

use crate::state::AppState;

pub mod carve_cleanup;
pub mod incoming_cleanup;
pub mod seen_flush;

/// Starts the sweepers on ignite and flushes pending check-ins on shutdown.
pub struct BackgroundTasks;

#[rocket::async_trait]
impl Fairing for BackgroundTasks {
    fn info(&self) -> Info {
        Info {
            name: "Fleet Background Tasks",
            kind: Kind::Ignite | Kind::Shutdown,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let Some(state) = rocket.state::<Arc<AppState>>().cloned() else {
            log::error!("AppState not managed, background tasks not started");
            return Err(rocket);
        };

        if !state.settings().background_tasks {
            log::info!("background tasks disabled");
            return Ok(rocket);
        }

        seen_flush::spawn_seen_flush(state.clone());
        carve_cleanup::spawn_carve_cleanup(state.clone());
        incoming_cleanup::spawn_incoming_cleanup(state);
        log::info!("background tasks started");

        Ok(rocket)
    }

    async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
        let Some(state) = rocket.state::<Arc<AppState>>() else {
            return;
        };
        let now = Utc::now().naive_utc();
        match state.run(move |svc| svc.flush_seen_hosts(now)).await {
            Ok(n) => log::info!("flushed {} pending check-ins on shutdown", n),
            Err(e) => log::error!("final seen flush failed: {}", e),
        }
    }
}
