use anyhow::Result;

use fleet_server::db::{self, logger::init_logger};
use fleet_server::settings::ServerSettings;

#[rocket::main]
async fn main() -> Result<()> {
    let settings = ServerSettings::from_env();
    let _logger = init_logger(&settings)?;

    log::info!("opening database {}", settings.database_url);
    let pool = db::initialize(&settings)?;

    fleet_server::build_rocket(settings, pool)
        .launch()
        .await
        .map_err(|e| anyhow::anyhow!("server failed: {}", e))?;

    log::info!("server stopped");
    Ok(())
}
