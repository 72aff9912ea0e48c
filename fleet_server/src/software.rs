//! Software inventory reconciliation.
//!
//! A host's report is diffed against its stored rows as plain sets keyed by
//! `(name, version, source)`. Rows present on both sides are left alone; the
//! rest is applied as one delete-then-insert transaction.

use std::collections::HashSet;

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::error::Result;
use crate::models::{Host, NewSoftware, Software};
use crate::schema::software;

type SoftwareKey<'a> = (&'a str, &'a str, &'a str);

fn key(s: &Software) -> SoftwareKey<'_> {
    (s.name.as_str(), s.version.as_str(), s.source.as_str())
}

/// What a reconcile pass has to write.
#[derive(Debug, Default, PartialEq)]
pub struct SoftwareDiff<'a> {
    pub to_insert: Vec<&'a Software>,
    /// Ids of stored rows that are no longer reported.
    pub to_delete: Vec<i32>,
}

impl SoftwareDiff<'_> {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_delete.is_empty()
    }
}

/// Counts of rows written by [`save_host_software`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub inserted: usize,
    pub deleted: usize,
}

/// Set difference between the stored rows and the observed report.
/// Duplicate entries in the report collapse to one row.
pub fn diff_software<'a>(persisted: &[Software], observed: &'a [Software]) -> SoftwareDiff<'a> {
    let stored: HashSet<SoftwareKey<'_>> = persisted.iter().map(key).collect();
    let reported: HashSet<SoftwareKey<'_>> = observed.iter().map(key).collect();

    let mut seen = HashSet::new();
    let to_insert = observed
        .iter()
        .filter(|s| !stored.contains(&key(s)) && seen.insert(key(*s)))
        .collect();

    let to_delete = persisted
        .iter()
        .filter(|s| !reported.contains(&key(s)))
        .map(|s| s.id)
        .collect();

    SoftwareDiff {
        to_insert,
        to_delete,
    }
}

fn stored_software(conn: &mut SqliteConnection, host_id: i32) -> Result<Vec<Software>> {
    let rows = software::table
        .filter(software::host_id.eq(host_id))
        .order(software::id.asc())
        .select(Software::as_select())
        .load(conn)?;
    Ok(rows)
}

/// Replace `host.software` with exactly what is stored and clear the dirty bit.
pub fn load_host_software(conn: &mut SqliteConnection, host: &mut Host) -> Result<()> {
    host.software.software = stored_software(conn, host.id)?;
    host.software.modified = false;
    Ok(())
}

/// Reconcile the host's reported software against the stored rows.
///
/// No-op unless `host.software.modified` is set. The delete and insert batches
/// commit together or not at all; on success the dirty bit is cleared.
pub fn save_host_software(conn: &mut SqliteConnection, host: &mut Host) -> Result<ReconcileStats> {
    if !host.software.modified {
        return Ok(ReconcileStats::default());
    }

    let host_id = host.id;
    let observed = &host.software.software;
    let stats = conn.transaction::<_, crate::error::FleetError, _>(|conn| {
        let persisted = stored_software(conn, host_id)?;
        let diff = diff_software(&persisted, observed);
        if diff.is_empty() {
            return Ok(ReconcileStats::default());
        }

        let deleted = if diff.to_delete.is_empty() {
            0
        } else {
            diesel::delete(
                software::table
                    .filter(software::host_id.eq(host_id))
                    .filter(software::id.eq_any(&diff.to_delete)),
            )
            .execute(conn)?
        };

        let rows: Vec<NewSoftware<'_>> = diff
            .to_insert
            .iter()
            .map(|s| NewSoftware {
                host_id,
                name: &s.name,
                version: &s.version,
                source: &s.source,
            })
            .collect();
        let inserted = if rows.is_empty() {
            0
        } else {
            diesel::insert_into(software::table)
                .values(&rows)
                .execute(conn)?
        };

        Ok(ReconcileStats { inserted, deleted })
    })?;

    if stats.inserted > 0 || stats.deleted > 0 {
        log::debug!(
            "reconciled software for host {}: +{} -{}",
            host_id,
            stats.inserted,
            stats.deleted
        );
    }
    host.software.modified = false;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_connection;
    use crate::hosts::new_host;
    use crate::models::HostSoftware;

    fn sw(name: &str, version: &str, source: &str) -> Software {
        Software::new(name, version, source)
    }

    fn sorted_keys(list: &[Software]) -> Vec<(String, String, String)> {
        let mut keys: Vec<_> = list
            .iter()
            .map(|s| (s.name.clone(), s.version.clone(), s.source.clone()))
            .collect();
        keys.sort();
        keys
    }

    fn report(host: &mut Host, software: Vec<Software>) {
        host.software = HostSoftware {
            software,
            modified: true,
        };
    }

    fn seeded_host(conn: &mut SqliteConnection, name: &str) -> Host {
        let host = Host {
            osquery_host_id: format!("{name}-id"),
            node_key: format!("{name}-key"),
            hostname: name.to_string(),
            uuid: format!("{name}-uuid"),
            ..Host::default()
        };
        new_host(conn, &host).unwrap()
    }

    #[test]
    fn diff_is_a_pure_set_difference() {
        let mut a = sw("a", "1", "apps");
        a.id = 1;
        let mut b = sw("b", "1", "apps");
        b.id = 2;
        let persisted = vec![a, b];
        let observed = vec![sw("b", "1", "apps"), sw("c", "1", "apps"), sw("c", "1", "apps")];

        let diff = diff_software(&persisted, &observed);
        assert_eq!(diff.to_delete, vec![1]);
        assert_eq!(diff.to_insert.len(), 1);
        assert_eq!(diff.to_insert[0].name, "c");
    }

    #[test]
    fn version_change_is_delete_plus_insert() {
        let mut old = sw("foo", "0.0.1", "chrome_extensions");
        old.id = 9;
        let observed = vec![sw("foo", "0.0.2", "chrome_extensions")];
        let diff = diff_software(std::slice::from_ref(&old), &observed);
        assert_eq!(diff.to_delete, vec![9]);
        assert_eq!(diff.to_insert.len(), 1);
    }

    #[test]
    fn reconcile_keeps_shared_rows_untouched() {
        let mut conn = test_connection();
        let mut host = seeded_host(&mut conn, "host1");

        report(&mut host, vec![sw("a", "1", "apps"), sw("b", "1", "deb_packages")]);
        let stats = save_host_software(&mut conn, &mut host).unwrap();
        assert_eq!(stats, ReconcileStats { inserted: 2, deleted: 0 });
        assert!(!host.software.modified);

        load_host_software(&mut conn, &mut host).unwrap();
        let b_id = host
            .software
            .software
            .iter()
            .find(|s| s.name == "b")
            .map(|s| s.id)
            .unwrap();

        report(&mut host, vec![sw("b", "1", "deb_packages"), sw("c", "2", "apps")]);
        let stats = save_host_software(&mut conn, &mut host).unwrap();
        assert_eq!(stats, ReconcileStats { inserted: 1, deleted: 1 });

        load_host_software(&mut conn, &mut host).unwrap();
        assert!(!host.software.modified);
        assert_eq!(
            sorted_keys(&host.software.software),
            sorted_keys(&[sw("b", "1", "deb_packages"), sw("c", "2", "apps")])
        );
        let b_after = host.software.software.iter().find(|s| s.name == "b").unwrap();
        assert_eq!(b_after.id, b_id);
    }

    #[test]
    fn reconciling_the_stored_set_writes_nothing() {
        let mut conn = test_connection();
        let mut host = seeded_host(&mut conn, "host1");
        report(&mut host, vec![sw("foo", "0.0.1", "chrome_extensions")]);
        save_host_software(&mut conn, &mut host).unwrap();

        load_host_software(&mut conn, &mut host).unwrap();
        host.software.modified = true;
        let stats = save_host_software(&mut conn, &mut host).unwrap();
        assert_eq!(stats, ReconcileStats::default());
        assert!(!host.software.modified);
    }

    #[test]
    fn unmodified_host_is_skipped() {
        let mut conn = test_connection();
        let mut host = seeded_host(&mut conn, "host1");
        host.software.software = vec![sw("ignored", "1", "apps")];
        host.software.modified = false;

        let stats = save_host_software(&mut conn, &mut host).unwrap();
        assert_eq!(stats, ReconcileStats::default());
        load_host_software(&mut conn, &mut host).unwrap();
        assert!(host.software.software.is_empty());
    }

    #[test]
    fn hosts_do_not_share_inventory() {
        let mut conn = test_connection();
        let mut host1 = seeded_host(&mut conn, "host1");
        let mut host2 = seeded_host(&mut conn, "host2");

        let soft1 = vec![
            sw("foo", "0.0.1", "chrome_extensions"),
            sw("foo", "0.0.3", "chrome_extensions"),
        ];
        let soft2 = vec![
            sw("foo", "0.0.2", "chrome_extensions"),
            sw("foo", "0.0.3", "chrome_extensions"),
            sw("bar", "0.0.3", "deb_packages"),
        ];
        report(&mut host1, soft1.clone());
        report(&mut host2, soft2.clone());
        save_host_software(&mut conn, &mut host1).unwrap();
        save_host_software(&mut conn, &mut host2).unwrap();

        load_host_software(&mut conn, &mut host1).unwrap();
        load_host_software(&mut conn, &mut host2).unwrap();
        assert_eq!(sorted_keys(&host1.software.software), sorted_keys(&soft1));
        assert_eq!(sorted_keys(&host2.software.software), sorted_keys(&soft2));

        // emptying one host leaves the other alone
        report(&mut host2, Vec::new());
        save_host_software(&mut conn, &mut host2).unwrap();
        load_host_software(&mut conn, &mut host2).unwrap();
        load_host_software(&mut conn, &mut host1).unwrap();
        assert!(host2.software.software.is_empty());
        assert_eq!(sorted_keys(&host1.software.software), sorted_keys(&soft1));
    }
}
