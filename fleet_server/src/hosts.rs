//! Host directory: enrollment, identity lookups, seen-time and team moves.

use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Integer, Nullable, Text, Timestamp};
use diesel::sqlite::{Sqlite, SqliteConnection};

use crate::error::{FleetError, Result};
use crate::models::{
    Host, HostDetails, HostListOptions, HostOrderKey, HostRow, HostSummary, OrderDirection,
    TeamFilter,
};
use crate::schema::{host_additional, hosts, label_membership, software};
use crate::software::save_host_software;
use crate::status::{self, Liveness};

/// Hosts that never reported a hostname or osquery version this long after
/// enrolling are dropped by [`cleanup_incoming_hosts`].
pub const INCOMING_HOST_GRACE_SECS: i64 = 5 * 60;

const SEARCH_LIMIT: i64 = 10;

/// Ids bound per statement by [`mark_hosts_seen`].
pub const SEEN_BATCH_SIZE: usize = 10_000;

/// Placeholder for "details never fetched", so the first check-in refreshes.
const NEVER: &str = "1970-01-02 00:00:00";

type HostQuery<'a> = hosts::BoxedQuery<'a, Sqlite>;

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Soft identifiers a host can be resolved by, most authoritative first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    OsqueryHostId,
    NodeKey,
    Uuid,
    Hostname,
}

impl IdentifierKind {
    pub const LOOKUP_ORDER: [IdentifierKind; 4] = [
        IdentifierKind::OsqueryHostId,
        IdentifierKind::NodeKey,
        IdentifierKind::Uuid,
        IdentifierKind::Hostname,
    ];

    fn query(self, identifier: &str) -> HostQuery<'static> {
        let identifier = identifier.to_string();
        let query = hosts::table.into_boxed();
        match self {
            IdentifierKind::OsqueryHostId => query.filter(hosts::osquery_host_id.eq(identifier)),
            IdentifierKind::NodeKey => query.filter(hosts::node_key.eq(identifier)),
            IdentifierKind::Uuid => query.filter(hosts::uuid.eq(identifier)),
            IdentifierKind::Hostname => query.filter(hosts::hostname.eq(identifier)),
        }
    }
}

fn first_host(conn: &mut SqliteConnection, query: HostQuery<'_>) -> Result<Option<Host>> {
    let row = query
        .select(HostRow::as_select())
        .order(hosts::id.asc())
        .first::<HostRow>(conn)
        .optional()?;
    Ok(row.map(Host::from))
}

fn load_hosts(conn: &mut SqliteConnection, query: HostQuery<'_>) -> Result<Vec<Host>> {
    let rows = query.select(HostRow::as_select()).load::<HostRow>(conn)?;
    Ok(rows.into_iter().map(Host::from).collect())
}

fn host_by_osquery_id(conn: &mut SqliteConnection, osquery_host_id: &str) -> Result<Host> {
    first_host(conn, IdentifierKind::OsqueryHostId.query(osquery_host_id))?
        .ok_or_else(|| FleetError::not_found("host", osquery_host_id))
}

fn apply_team_filter<'a>(query: HostQuery<'a>, filter: &TeamFilter) -> HostQuery<'a> {
    match &filter.team_ids {
        Some(ids) => query.filter(hosts::team_id.eq_any(ids.clone())),
        None => query,
    }
}

/// `%needle%` with LIKE wildcards in the needle escaped by `\`.
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn apply_match_query<'a>(query: HostQuery<'a>, needle: &str) -> HostQuery<'a> {
    let needle = needle.trim();
    if needle.is_empty() {
        return query;
    }
    let pattern = like_pattern(needle);
    query.filter(
        hosts::hostname
            .like(pattern.clone())
            .escape('\\')
            .or(hosts::uuid.like(pattern).escape('\\')),
    )
}

fn apply_order<'a>(query: HostQuery<'a>, key: HostOrderKey, direction: OrderDirection) -> HostQuery<'a> {
    let query = match (key, direction) {
        (HostOrderKey::Id, OrderDirection::Asc) => query.order(hosts::id.asc()),
        (HostOrderKey::Id, OrderDirection::Desc) => query.order(hosts::id.desc()),
        (HostOrderKey::Hostname, OrderDirection::Asc) => query.order(hosts::hostname.asc()),
        (HostOrderKey::Hostname, OrderDirection::Desc) => query.order(hosts::hostname.desc()),
        (HostOrderKey::CreatedAt, OrderDirection::Asc) => query.order(hosts::created_at.asc()),
        (HostOrderKey::CreatedAt, OrderDirection::Desc) => query.order(hosts::created_at.desc()),
        (HostOrderKey::SeenTime, OrderDirection::Asc) => query.order(hosts::seen_time.asc()),
        (HostOrderKey::SeenTime, OrderDirection::Desc) => query.order(hosts::seen_time.desc()),
    };
    query.then_order_by(hosts::id.asc())
}

/// Insert a fully described host. Production hosts arrive through
/// [`enroll_host`]; this is for imports and tests.
pub fn new_host(conn: &mut SqliteConnection, host: &Host) -> Result<Host> {
    if host.osquery_host_id.is_empty() || host.node_key.is_empty() {
        return Err(FleetError::validation("osquery_host_id and node_key are required"));
    }
    let ts = now();
    let created_at = if host.created_at == NaiveDateTime::default() {
        ts
    } else {
        host.created_at
    };

    diesel::insert_into(hosts::table)
        .values((
            HostDetails::from_host(host, ts),
            hosts::osquery_host_id.eq(&host.osquery_host_id),
            hosts::node_key.eq(&host.node_key),
            hosts::created_at.eq(created_at),
            hosts::last_enrolled_at.eq(host.last_enrolled_at),
            hosts::seen_time.eq(host.seen_time),
            hosts::team_id.eq(host.team_id),
        ))
        .execute(conn)?;

    host_by_osquery_id(conn, &host.osquery_host_id)
}

/// Enroll (or re-enroll) the host identified by `osquery_host_id`.
///
/// See [`enroll_host_at`].
pub fn enroll_host(
    conn: &mut SqliteConnection,
    osquery_host_id: &str,
    node_key: &str,
    team_id: Option<i32>,
    cooldown: Duration,
) -> Result<Host> {
    enroll_host_at(conn, osquery_host_id, node_key, team_id, cooldown, now())
}

/// Enroll with an explicit clock.
///
/// New hosts are inserted; known hosts get the new `node_key`, `team_id` and
/// `last_enrolled_at`. A known host whose previous enrollment is less than
/// `cooldown` old is rejected with [`FleetError::EnrollmentThrottled`]. The
/// cooldown test is the WHERE clause of the upsert itself, so two racing
/// enrollments cannot both pass it.
pub fn enroll_host_at(
    conn: &mut SqliteConnection,
    osquery_host_id: &str,
    node_key: &str,
    team_id: Option<i32>,
    cooldown: Duration,
    now: NaiveDateTime,
) -> Result<Host> {
    if osquery_host_id.trim().is_empty() {
        return Err(FleetError::validation("osquery_host_id must not be empty"));
    }
    if node_key.trim().is_empty() {
        return Err(FleetError::validation("node_key must not be empty"));
    }
    let cooldown = chrono::Duration::from_std(cooldown)
        .map_err(|_| FleetError::validation("enroll cooldown out of range"))?;
    let cutoff = now - cooldown;

    let affected = diesel::sql_query(format!(
        "INSERT INTO hosts (osquery_host_id, node_key, team_id, created_at, updated_at, \
                            last_enrolled_at, seen_time, detail_updated_at, label_updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, '{NEVER}', '{NEVER}') \
         ON CONFLICT (osquery_host_id) DO UPDATE SET \
             node_key = excluded.node_key, \
             team_id = excluded.team_id, \
             last_enrolled_at = excluded.last_enrolled_at, \
             updated_at = excluded.updated_at \
         WHERE hosts.last_enrolled_at <= ?"
    ))
    .bind::<Text, _>(osquery_host_id)
    .bind::<Text, _>(node_key)
    .bind::<Nullable<Integer>, _>(team_id)
    .bind::<Timestamp, _>(now)
    .bind::<Timestamp, _>(now)
    .bind::<Timestamp, _>(now)
    .bind::<Timestamp, _>(now)
    .bind::<Timestamp, _>(cutoff)
    .execute(conn)?;

    if affected == 0 {
        log::warn!("enrollment throttled for host {}", osquery_host_id);
        return Err(FleetError::EnrollmentThrottled {
            osquery_host_id: osquery_host_id.to_string(),
        });
    }

    let host = host_by_osquery_id(conn, osquery_host_id)?;
    log::info!("enrolled host {} (id {})", osquery_host_id, host.id);
    Ok(host)
}

/// Resolve a check-in credential. Does not load software or the additional blob.
pub fn authenticate_host(conn: &mut SqliteConnection, node_key: &str) -> Result<Host> {
    if node_key.is_empty() {
        return Err(FleetError::validation("node_key must not be empty"));
    }
    first_host(conn, IdentifierKind::NodeKey.query(node_key))?
        .ok_or_else(|| FleetError::not_found("host", "node key"))
}

/// Full host record, including software and additional results.
pub fn host(conn: &mut SqliteConnection, id: i32) -> Result<Host> {
    let mut host = first_host(conn, hosts::table.filter(hosts::id.eq(id)).into_boxed())?
        .ok_or_else(|| FleetError::not_found("host", id))?;
    crate::software::load_host_software(conn, &mut host)?;
    host.additional = load_additional(conn, id)?;
    Ok(host)
}

/// Try each identifier kind in [`IdentifierKind::LOOKUP_ORDER`]; first hit wins.
pub fn host_by_identifier(conn: &mut SqliteConnection, identifier: &str) -> Result<Host> {
    if identifier.is_empty() {
        return Err(FleetError::validation("identifier must not be empty"));
    }
    for kind in IdentifierKind::LOOKUP_ORDER {
        if let Some(host) = first_host(conn, kind.query(identifier))? {
            return Ok(host);
        }
    }
    Err(FleetError::not_found("host", identifier))
}

/// Persist detail columns, then reconcile software if the host is dirty.
///
/// The node key, enrollment time, team and `seen_time` are left as stored, so a
/// host read before a concurrent re-enroll or seen flush cannot undo it.
pub fn save_host(conn: &mut SqliteConnection, host: &mut Host) -> Result<()> {
    let ts = now();
    conn.transaction::<_, FleetError, _>(|conn| {
        let updated = diesel::update(hosts::table.find(host.id))
            .set(HostDetails::from_host(host, ts))
            .execute(conn)?;
        if updated == 0 {
            return Err(FleetError::not_found("host", host.id));
        }
        save_host_software(conn, host)?;
        Ok(())
    })?;
    host.updated_at = ts;
    Ok(())
}

/// Remove a host and everything it owns. Carves that reference it are kept.
pub fn delete_host(conn: &mut SqliteConnection, id: i32) -> Result<()> {
    conn.transaction::<_, FleetError, _>(|conn| {
        delete_owned_rows(conn, &[id])?;
        let deleted = diesel::delete(hosts::table.find(id)).execute(conn)?;
        if deleted == 0 {
            return Err(FleetError::not_found("host", id));
        }
        Ok(())
    })?;
    log::info!("deleted host {}", id);
    Ok(())
}

fn delete_owned_rows(conn: &mut SqliteConnection, ids: &[i32]) -> QueryResult<()> {
    diesel::delete(software::table.filter(software::host_id.eq_any(ids))).execute(conn)?;
    diesel::delete(host_additional::table.filter(host_additional::host_id.eq_any(ids)))
        .execute(conn)?;
    diesel::delete(label_membership::table.filter(label_membership::host_id.eq_any(ids)))
        .execute(conn)?;
    Ok(())
}

/// Advance one host's `seen_time`. Never moves it backwards.
pub fn mark_host_seen(conn: &mut SqliteConnection, host: &mut Host, t: NaiveDateTime) -> Result<()> {
    diesel::update(
        hosts::table
            .filter(hosts::id.eq(host.id))
            .filter(hosts::seen_time.lt(t)),
    )
    .set(hosts::seen_time.eq(t))
    .execute(conn)?;
    if host.seen_time < t {
        host.seen_time = t;
    }
    Ok(())
}

/// Batched form of [`mark_host_seen`]. Ids are written in chunks of
/// [`SEEN_BATCH_SIZE`] inside one transaction to stay under SQLite's bound
/// parameter limit. Returns the number of rows advanced.
pub fn mark_hosts_seen(conn: &mut SqliteConnection, host_ids: &[i32], t: NaiveDateTime) -> Result<usize> {
    if host_ids.is_empty() {
        return Ok(0);
    }
    conn.transaction::<_, FleetError, _>(|conn| {
        let mut updated = 0;
        for chunk in host_ids.chunks(SEEN_BATCH_SIZE) {
            updated += diesel::update(
                hosts::table
                    .filter(hosts::id.eq_any(chunk))
                    .filter(hosts::seen_time.lt(t)),
            )
            .set(hosts::seen_time.eq(t))
            .execute(conn)?;
        }
        Ok(updated)
    })
}

/// Drop hosts that enrolled but never completed detail collection.
pub fn cleanup_incoming_hosts(conn: &mut SqliteConnection, now: NaiveDateTime) -> Result<usize> {
    let cutoff = now - chrono::Duration::seconds(INCOMING_HOST_GRACE_SECS);
    let removed = conn.transaction::<_, FleetError, _>(|conn| {
        let ids: Vec<i32> = hosts::table
            .filter(hosts::hostname.eq(""))
            .filter(hosts::osquery_version.eq(""))
            .filter(hosts::created_at.lt(cutoff))
            .select(hosts::id)
            .load(conn)?;
        if ids.is_empty() {
            return Ok(0);
        }
        delete_owned_rows(conn, &ids)?;
        Ok(diesel::delete(hosts::table.filter(hosts::id.eq_any(&ids))).execute(conn)?)
    })?;
    if removed > 0 {
        log::info!("removed {} incoming hosts that never reported details", removed);
    }
    Ok(removed)
}

/// Move hosts to `team_id`; `None` clears their team.
pub fn add_hosts_to_team(conn: &mut SqliteConnection, team_id: Option<i32>, host_ids: &[i32]) -> Result<usize> {
    if host_ids.is_empty() {
        return Ok(0);
    }
    let updated = diesel::update(hosts::table.filter(hosts::id.eq_any(host_ids)))
        .set((hosts::team_id.eq(team_id), hosts::updated_at.eq(now())))
        .execute(conn)?;
    Ok(updated)
}

/// Move every host selected by the list options (and label, if given).
pub fn add_hosts_to_team_by_filter(
    conn: &mut SqliteConnection,
    team_id: Option<i32>,
    filter: &TeamFilter,
    opt: &HostListOptions,
    label_id: Option<i32>,
) -> Result<usize> {
    let mut opt = opt.clone();
    opt.list.page = 0;
    opt.list.per_page = 0;
    opt.additional_filters.clear();

    let selected = match label_id {
        Some(label) => list_hosts_in_label(conn, filter, label, &opt)?,
        None => list_hosts(conn, filter, &opt)?,
    };
    let ids: Vec<i32> = selected.iter().map(|h| h.id).collect();
    add_hosts_to_team(conn, team_id, &ids)
}

/// Store the additional-queries result, replacing any previous value.
pub fn save_host_additional(conn: &mut SqliteConnection, host: &Host) -> Result<()> {
    let raw = host.additional.as_ref().map(|v| v.to_string());
    diesel::replace_into(host_additional::table)
        .values((
            host_additional::host_id.eq(host.id),
            host_additional::additional.eq(raw),
        ))
        .execute(conn)?;
    Ok(())
}

fn load_additional(conn: &mut SqliteConnection, host_id: i32) -> Result<Option<serde_json::Value>> {
    let raw: Option<Option<String>> = host_additional::table
        .find(host_id)
        .select(host_additional::additional)
        .first(conn)
        .optional()?;
    Ok(raw.flatten().and_then(|s| match serde_json::from_str(&s) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("host {} has unreadable additional data: {}", host_id, e);
            None
        }
    }))
}

/// Keep only the requested top-level keys of each host's additional blob.
fn attach_additional(conn: &mut SqliteConnection, hosts: &mut [Host], keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    for host in hosts.iter_mut() {
        let full = load_additional(conn, host.id)?;
        let mut picked = serde_json::Map::new();
        if let Some(serde_json::Value::Object(map)) = full {
            for key in keys {
                picked.insert(key.clone(), map.get(key).cloned().unwrap_or(serde_json::Value::Null));
            }
        } else {
            for key in keys {
                picked.insert(key.clone(), serde_json::Value::Null);
            }
        }
        host.additional = Some(serde_json::Value::Object(picked));
    }
    Ok(())
}

fn base_list_query<'a>(filter: &TeamFilter, opt: &HostListOptions, label_id: Option<i32>) -> HostQuery<'a> {
    let mut query = apply_team_filter(hosts::table.into_boxed(), filter);
    if let Some(label) = label_id {
        query = query.filter(
            hosts::id.eq_any(
                label_membership::table
                    .filter(label_membership::label_id.eq(label))
                    .select(label_membership::host_id),
            ),
        );
    }
    query = apply_match_query(query, &opt.list.match_query);
    apply_order(query, opt.list.order_key, opt.list.order_direction)
}

fn run_list(
    conn: &mut SqliteConnection,
    query: HostQuery<'_>,
    opt: &HostListOptions,
    now: NaiveDateTime,
) -> Result<Vec<Host>> {
    let per_page = i64::from(opt.list.per_page);
    let mut hosts = match opt.status_filter {
        // status is derived in Rust, so filter before paginating in memory
        Some(wanted) => {
            let matching = load_hosts(conn, query)?
                .into_iter()
                .filter(|h| status::matches_filter(&Liveness::from(h), wanted, now));
            if per_page > 0 {
                matching
                    .skip(opt.list.offset() as usize)
                    .take(per_page as usize)
                    .collect()
            } else {
                matching.collect()
            }
        }
        None if per_page > 0 => load_hosts(conn, query.limit(per_page).offset(opt.list.offset()))?,
        None => load_hosts(conn, query)?,
    };
    attach_additional(conn, &mut hosts, &opt.additional_filters)?;
    Ok(hosts)
}

pub fn list_hosts(conn: &mut SqliteConnection, filter: &TeamFilter, opt: &HostListOptions) -> Result<Vec<Host>> {
    list_hosts_at(conn, filter, opt, now())
}

/// List with an explicit clock for the status filter.
pub fn list_hosts_at(
    conn: &mut SqliteConnection,
    filter: &TeamFilter,
    opt: &HostListOptions,
    now: NaiveDateTime,
) -> Result<Vec<Host>> {
    run_list(conn, base_list_query(filter, opt, None), opt, now)
}

pub fn list_hosts_in_label(
    conn: &mut SqliteConnection,
    filter: &TeamFilter,
    label_id: i32,
    opt: &HostListOptions,
) -> Result<Vec<Host>> {
    run_list(conn, base_list_query(filter, opt, Some(label_id)), opt, now())
}

/// Free-text search over hostname and uuid, at most ten results.
/// An empty query returns the most recently seen hosts.
pub fn search_hosts(
    conn: &mut SqliteConnection,
    filter: &TeamFilter,
    query: &str,
    omit: &[i32],
) -> Result<Vec<Host>> {
    let mut q = apply_team_filter(hosts::table.into_boxed(), filter);
    if !omit.is_empty() {
        q = q.filter(hosts::id.ne_all(omit.to_vec()));
    }
    let q = if query.trim().is_empty() {
        q.order(hosts::seen_time.desc()).then_order_by(hosts::id.asc())
    } else {
        apply_match_query(q, query).order(hosts::hostname.asc()).then_order_by(hosts::id.asc())
    };
    load_hosts(conn, q.limit(SEARCH_LIMIT))
}

pub fn host_ids_by_name(conn: &mut SqliteConnection, filter: &TeamFilter, hostnames: &[String]) -> Result<Vec<i32>> {
    if hostnames.is_empty() {
        return Ok(Vec::new());
    }
    let ids = apply_team_filter(hosts::table.into_boxed(), filter)
        .filter(hosts::hostname.eq_any(hostnames.to_vec()))
        .select(hosts::id)
        .order(hosts::id.asc())
        .load(conn)?;
    Ok(ids)
}

/// Ask the agent to re-send its details on the next check-in.
pub fn refetch_host(conn: &mut SqliteConnection, id: i32) -> Result<()> {
    let updated = diesel::update(hosts::table.find(id))
        .set(hosts::refetch_requested.eq(true))
        .execute(conn)?;
    if updated == 0 {
        return Err(FleetError::not_found("host", id));
    }
    Ok(())
}

/// Online/offline/mia/new counts for the hosts visible through `filter`.
pub fn generate_host_status_statistics(
    conn: &mut SqliteConnection,
    filter: &TeamFilter,
    now: NaiveDateTime,
) -> Result<HostSummary> {
    let rows: Vec<(NaiveDateTime, NaiveDateTime, i32, i32)> =
        apply_team_filter(hosts::table.into_boxed(), filter)
            .select((
                hosts::seen_time,
                hosts::created_at,
                hosts::distributed_interval,
                hosts::config_tls_refresh,
            ))
            .load(conn)?;

    let population = rows
        .into_iter()
        .map(|(seen_time, created_at, distributed_interval, config_tls_refresh)| Liveness {
            seen_time,
            created_at,
            distributed_interval,
            config_tls_refresh,
        });
    Ok(status::summarize(population, now))
}
