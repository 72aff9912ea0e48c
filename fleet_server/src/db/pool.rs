use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;

use crate::error::Result;
use crate::settings::ServerSettings;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas. Writers from different request threads wait on the
/// SQLite lock instead of failing with SQLITE_BUSY.
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout.as_millis()
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub fn init_pool(settings: &ServerSettings) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(&settings.database_url);
    let pool = Pool::builder()
        .max_size(settings.pool_size.max(1))
        .connection_customizer(Box::new(ConnectionOptions {
            busy_timeout: Duration::from_secs(5),
        }))
        .build(manager)?;
    Ok(pool)
}
