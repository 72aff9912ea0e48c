//! File carve sessions and their blocks.
//!
//! A session is opened with its declared geometry, receives blocks in any
//! order, and is expired by [`cleanup_carves`] once it is a day old. Expiry
//! drops the block data but keeps the metadata so clients can be told the
//! session existed.

use chrono::{Duration, NaiveDateTime, Utc};
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::error::{FleetError, Result};
use crate::models::{CarveListOptions, CarveMetadata, NewCarve};
use crate::schema::{carve_blocks, carve_metadata};

/// Sessions older than this are expired by the cleanup sweep.
pub const CARVE_EXPIRY_SECS: i64 = 24 * 60 * 60;

fn check_block_index(carve: &CarveMetadata, block_index: i64) -> Result<()> {
    if block_index < 0 || block_index >= carve.block_count {
        return Err(FleetError::validation(format!(
            "block {} out of range for carve {} with {} blocks",
            block_index, carve.session_id, carve.block_count
        )));
    }
    Ok(())
}

/// Highest block index actually stored, or -1.
fn stored_max_block(conn: &mut SqliteConnection, metadata_id: i32) -> Result<i64> {
    let highest: Option<i64> = carve_blocks::table
        .filter(carve_blocks::metadata_id.eq(metadata_id))
        .select(max(carve_blocks::block_id))
        .first(conn)?;
    Ok(highest.unwrap_or(-1))
}

fn refresh_max_block(conn: &mut SqliteConnection, mut carve: CarveMetadata) -> Result<CarveMetadata> {
    carve.max_block = carve.max_block.max(stored_max_block(conn, carve.id)?);
    Ok(carve)
}

fn expired_flag(conn: &mut SqliteConnection, carve: &CarveMetadata) -> Result<bool> {
    carve_metadata::table
        .find(carve.id)
        .select(carve_metadata::expired)
        .first(conn)
        .optional()?
        .ok_or_else(|| FleetError::not_found("carve", carve.id))
}

/// Open a session. `max_block` and `expired` are reset regardless of input.
pub fn new_carve(conn: &mut SqliteConnection, carve: &CarveMetadata) -> Result<CarveMetadata> {
    if carve.session_id.is_empty() {
        return Err(FleetError::validation("carve session id must not be empty"));
    }
    if carve.block_count <= 0 || carve.block_size <= 0 || carve.carve_size < 0 {
        return Err(FleetError::validation(format!(
            "invalid carve geometry: {} blocks of {} bytes for {} bytes",
            carve.block_count, carve.block_size, carve.carve_size
        )));
    }
    let created_at = if carve.created_at == NaiveDateTime::default() {
        Utc::now().naive_utc()
    } else {
        carve.created_at
    };

    diesel::insert_into(carve_metadata::table)
        .values(NewCarve {
            host_id: carve.host_id,
            created_at,
            name: &carve.name,
            block_count: carve.block_count,
            block_size: carve.block_size,
            carve_size: carve.carve_size,
            carve_id: &carve.carve_id,
            request_id: &carve.request_id,
            session_id: &carve.session_id,
            max_block: -1,
            expired: false,
        })
        .execute(conn)
        .map_err(|e| match FleetError::from(e) {
            FleetError::Conflict(_) => {
                FleetError::Conflict(format!("carve session {} already exists", carve.session_id))
            }
            other => other,
        })?;

    log::info!(
        "opened carve {} for host {} ({} blocks)",
        carve.session_id,
        carve.host_id,
        carve.block_count
    );
    carve_by_session_id(conn, &carve.session_id)
}

/// Store one block. Blocks may arrive in any order and a repeated index
/// overwrites the previous data.
pub fn new_block(conn: &mut SqliteConnection, carve: &CarveMetadata, block_index: i64, data: &[u8]) -> Result<()> {
    check_block_index(carve, block_index)?;

    conn.transaction::<_, FleetError, _>(|conn| {
        if expired_flag(conn, carve)? {
            return Err(FleetError::Expired {
                session_id: carve.session_id.clone(),
            });
        }

        diesel::replace_into(carve_blocks::table)
            .values((
                carve_blocks::metadata_id.eq(carve.id),
                carve_blocks::block_id.eq(block_index),
                carve_blocks::data.eq(data),
            ))
            .execute(conn)?;

        diesel::update(
            carve_metadata::table
                .filter(carve_metadata::id.eq(carve.id))
                .filter(carve_metadata::max_block.lt(block_index)),
        )
        .set(carve_metadata::max_block.eq(block_index))
        .execute(conn)?;
        Ok(())
    })
}

/// Raw bytes of one block.
pub fn get_block(conn: &mut SqliteConnection, carve: &CarveMetadata, block_index: i64) -> Result<Vec<u8>> {
    check_block_index(carve, block_index)?;
    if expired_flag(conn, carve)? {
        return Err(FleetError::Expired {
            session_id: carve.session_id.clone(),
        });
    }

    carve_blocks::table
        .find((carve.id, block_index))
        .select(carve_blocks::data)
        .first(conn)
        .optional()?
        .ok_or_else(|| FleetError::not_found("carve block", format!("{}/{}", carve.session_id, block_index)))
}

pub fn carve(conn: &mut SqliteConnection, id: i32) -> Result<CarveMetadata> {
    let found = carve_metadata::table
        .find(id)
        .select(CarveMetadata::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| FleetError::not_found("carve", id))?;
    refresh_max_block(conn, found)
}

pub fn carve_by_session_id(conn: &mut SqliteConnection, session_id: &str) -> Result<CarveMetadata> {
    let found = carve_metadata::table
        .filter(carve_metadata::session_id.eq(session_id))
        .select(CarveMetadata::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| FleetError::not_found("carve", session_id))?;
    refresh_max_block(conn, found)
}

/// Names are not unique; the oldest session with the name wins.
pub fn carve_by_name(conn: &mut SqliteConnection, name: &str) -> Result<CarveMetadata> {
    let found = carve_metadata::table
        .filter(carve_metadata::name.eq(name))
        .order((carve_metadata::created_at.asc(), carve_metadata::id.asc()))
        .select(CarveMetadata::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| FleetError::not_found("carve", name))?;
    refresh_max_block(conn, found)
}

/// Expire every live session created more than a day before `now` and drop
/// its blocks. Returns how many sessions were expired; a second run with the
/// same clock returns 0.
pub fn cleanup_carves(conn: &mut SqliteConnection, now: NaiveDateTime) -> Result<usize> {
    let cutoff = now - Duration::seconds(CARVE_EXPIRY_SECS);

    let expired = conn.transaction::<_, FleetError, _>(|conn| {
        let ids: Vec<i32> = carve_metadata::table
            .filter(carve_metadata::expired.eq(false))
            .filter(carve_metadata::created_at.lt(cutoff))
            .select(carve_metadata::id)
            .load(conn)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let marked = diesel::update(carve_metadata::table.filter(carve_metadata::id.eq_any(&ids)))
            .set(carve_metadata::expired.eq(true))
            .execute(conn)?;
        let blocks = diesel::delete(carve_blocks::table.filter(carve_blocks::metadata_id.eq_any(&ids)))
            .execute(conn)?;
        log::debug!("carve sweep dropped {} blocks", blocks);
        Ok(marked)
    })?;

    if expired > 0 {
        log::info!("expired {} carve sessions", expired);
    }
    Ok(expired)
}

/// Sessions ordered by creation time. Expired sessions are only included when
/// `opt.expired` is set.
pub fn list_carves(conn: &mut SqliteConnection, opt: &CarveListOptions) -> Result<Vec<CarveMetadata>> {
    let mut query = carve_metadata::table
        .select(CarveMetadata::as_select())
        .order((carve_metadata::created_at.asc(), carve_metadata::id.asc()))
        .into_boxed();
    if !opt.expired {
        query = query.filter(carve_metadata::expired.eq(false));
    }
    if opt.list.per_page > 0 {
        query = query
            .limit(i64::from(opt.list.per_page))
            .offset(opt.list.offset());
    }

    let rows: Vec<CarveMetadata> = query.load(conn)?;
    rows.into_iter()
        .map(|carve| refresh_max_block(conn, carve))
        .collect()
}

/// Persist the mutable fields of a session: `expired` and `max_block`.
pub fn update_carve(conn: &mut SqliteConnection, carve: &CarveMetadata) -> Result<()> {
    let updated = diesel::update(carve_metadata::table.find(carve.id))
        .set((
            carve_metadata::expired.eq(carve.expired),
            carve_metadata::max_block.eq(carve.max_block),
        ))
        .execute(conn)?;
    if updated == 0 {
        return Err(FleetError::not_found("carve", carve.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_connection;
    use crate::models::ListOptions;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn metadata(session: &str, created_at: NaiveDateTime) -> CarveMetadata {
        CarveMetadata {
            id: 0,
            host_id: 1,
            created_at,
            name: format!("carve-{session}"),
            block_count: 3,
            block_size: 4,
            carve_size: 10,
            carve_id: format!("{session}-carve"),
            request_id: "req".into(),
            session_id: session.into(),
            max_block: 7,
            expired: true,
        }
    }

    #[test]
    fn new_carve_resets_progress_and_rejects_duplicates() {
        let mut conn = test_connection();
        let carve = new_carve(&mut conn, &metadata("s1", now())).unwrap();
        assert!(carve.id > 0);
        assert_eq!(carve.max_block, -1);
        assert!(!carve.expired);
        assert_eq!(carve.created_at, now());

        assert_eq!(carve_by_session_id(&mut conn, "s1").unwrap(), carve);
        assert_eq!(super::carve(&mut conn, carve.id).unwrap(), carve);
        assert_eq!(carve_by_name(&mut conn, "carve-s1").unwrap(), carve);

        assert!(matches!(
            new_carve(&mut conn, &metadata("s1", now())),
            Err(FleetError::Conflict(_))
        ));
        assert!(matches!(carve_by_session_id(&mut conn, "nope"), Err(FleetError::NotFound { .. })));
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut conn = test_connection();
        let mut bad = metadata("s1", now());
        bad.block_count = 0;
        assert!(matches!(new_carve(&mut conn, &bad), Err(FleetError::Validation(_))));
    }

    #[test]
    fn blocks_arrive_out_of_order() {
        let mut conn = test_connection();
        let carve = new_carve(&mut conn, &metadata("s1", now())).unwrap();

        new_block(&mut conn, &carve, 2, b"cc").unwrap();
        assert_eq!(carve_by_session_id(&mut conn, "s1").unwrap().max_block, 2);

        new_block(&mut conn, &carve, 0, b"aaaa").unwrap();
        new_block(&mut conn, &carve, 1, b"bbbb").unwrap();
        let reread = carve_by_session_id(&mut conn, "s1").unwrap();
        assert_eq!(reread.max_block, 2);
        assert!(reread.is_complete());

        assert_eq!(get_block(&mut conn, &carve, 0).unwrap(), b"aaaa".to_vec());
        assert_eq!(get_block(&mut conn, &carve, 2).unwrap(), b"cc".to_vec());

        // rewriting a block replaces its data
        new_block(&mut conn, &carve, 1, b"BBBB").unwrap();
        assert_eq!(get_block(&mut conn, &carve, 1).unwrap(), b"BBBB".to_vec());
    }

    #[test]
    fn block_index_must_be_in_range() {
        let mut conn = test_connection();
        let carve = new_carve(&mut conn, &metadata("s1", now())).unwrap();
        assert!(matches!(new_block(&mut conn, &carve, 3, b"x"), Err(FleetError::Validation(_))));
        assert!(matches!(new_block(&mut conn, &carve, -1, b"x"), Err(FleetError::Validation(_))));
        assert!(matches!(get_block(&mut conn, &carve, 1), Err(FleetError::NotFound { .. })));
    }

    #[test]
    fn cleanup_expires_old_sessions_once() {
        let mut conn = test_connection();
        let old = new_carve(&mut conn, &metadata("old", now() - Duration::hours(25))).unwrap();
        let fresh = new_carve(&mut conn, &metadata("fresh", now() - Duration::hours(1))).unwrap();
        new_block(&mut conn, &old, 0, b"old!").unwrap();
        new_block(&mut conn, &fresh, 0, b"new!").unwrap();

        assert_eq!(cleanup_carves(&mut conn, now()).unwrap(), 1);
        assert_eq!(cleanup_carves(&mut conn, now()).unwrap(), 0);

        let old = carve_by_session_id(&mut conn, "old").unwrap();
        assert!(old.expired);
        assert_eq!(old.max_block, 0);
        assert!(matches!(get_block(&mut conn, &old, 0), Err(FleetError::Expired { .. })));
        assert!(matches!(new_block(&mut conn, &old, 1, b"late"), Err(FleetError::Expired { .. })));

        assert_eq!(get_block(&mut conn, &fresh, 0).unwrap(), b"new!".to_vec());
        let remaining: i64 = carve_blocks::table.count().get_result(&mut conn).unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn list_hides_expired_unless_asked() {
        let mut conn = test_connection();
        new_carve(&mut conn, &metadata("b", now() - Duration::hours(2))).unwrap();
        new_carve(&mut conn, &metadata("a", now() - Duration::hours(30))).unwrap();
        new_carve(&mut conn, &metadata("c", now() - Duration::hours(1))).unwrap();
        cleanup_carves(&mut conn, now()).unwrap();

        let live: Vec<String> = list_carves(&mut conn, &CarveListOptions::default())
            .unwrap()
            .into_iter()
            .map(|c| c.session_id)
            .collect();
        assert_eq!(live, vec!["b", "c"]);

        let opt = CarveListOptions {
            expired: true,
            ..CarveListOptions::default()
        };
        let all: Vec<String> = list_carves(&mut conn, &opt)
            .unwrap()
            .into_iter()
            .map(|c| c.session_id)
            .collect();
        assert_eq!(all, vec!["a", "b", "c"]);

        let opt = CarveListOptions {
            expired: true,
            list: ListOptions {
                page: 1,
                per_page: 2,
                ..ListOptions::default()
            },
        };
        assert_eq!(list_carves(&mut conn, &opt).unwrap().len(), 1);
    }

    #[test]
    fn update_persists_only_progress_fields() {
        let mut conn = test_connection();
        let mut carve = new_carve(&mut conn, &metadata("s1", now())).unwrap();
        carve.expired = true;
        carve.max_block = 1;
        carve.name = "renamed".into();
        carve.block_count = 99;
        carve.block_size = 99;
        carve.carve_size = 99;
        update_carve(&mut conn, &carve).unwrap();

        let stored = carve_by_session_id(&mut conn, "s1").unwrap();
        assert!(stored.expired);
        assert_eq!(stored.max_block, 1);
        assert_eq!(stored.name, "carve-s1");
        assert_eq!(
            (stored.block_count, stored.block_size, stored.carve_size),
            (3, 4, 10)
        );

        carve.id = 999;
        assert!(matches!(update_carve(&mut conn, &carve), Err(FleetError::NotFound { .. })));
    }
}
