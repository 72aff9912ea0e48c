use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::{FleetError, Result};

pub mod logger;
pub mod pool;

pub use pool::{DbConn, DbPool};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Apply any pending schema migrations.
pub fn run_migrations(conn: &mut SqliteConnection) -> Result<()> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| FleetError::Migration(e.to_string()))?;
    for version in applied {
        log::info!("applied migration {}", version);
    }
    Ok(())
}

/// Build the pool and bring the schema up to date.
pub fn initialize(settings: &crate::settings::ServerSettings) -> Result<DbPool> {
    let pool = pool::init_pool(settings)?;
    let mut conn = pool.get()?;
    run_migrations(&mut conn)?;
    Ok(pool)
}

/// Fresh in-memory database with the schema applied.
#[cfg(test)]
pub fn test_connection() -> SqliteConnection {
    use diesel::connection::SimpleConnection;
    use diesel::Connection;

    let mut conn = SqliteConnection::establish(":memory:").expect("open in-memory db");
    conn.batch_execute("PRAGMA foreign_keys = ON;")
        .expect("enable foreign keys");
    run_migrations(&mut conn).expect("migrations");
    conn
}
