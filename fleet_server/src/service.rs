//! Query facade used by the HTTP layer and the background sweepers.
//!
//! Every call checks a connection out of the pool, runs the storage
//! operations synchronously and decorates hosts with their derived liveness.
//! Callers on the async runtime go through [`crate::state::AppState::run`].

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::carves;
use crate::db::{DbConn, DbPool};
use crate::error::{FleetError, Result};
use crate::hosts;
use crate::models::{
    CarveListOptions, CarveMetadata, Host, HostListOptions, HostSummary, Software, TeamFilter,
};
use crate::settings::ServerSettings;
use crate::software::{self, ReconcileStats};
use crate::status::{self, HostStatus};

/// Largest block an agent may send.
pub const MAX_BLOCK_SIZE: i64 = 256 * 1024 * 1024;

/// Largest file an agent may carve.
pub const MAX_CARVE_SIZE: i64 = 8 * 1024 * 1024 * 1024;

/// A host plus its liveness as of the read.
#[derive(Debug, Clone, Serialize)]
pub struct HostDetail {
    #[serde(flatten)]
    pub host: Host,
    pub status: HostStatus,
    pub is_new: bool,
}

impl HostDetail {
    pub fn new(host: Host, now: NaiveDateTime) -> Self {
        HostDetail {
            status: status::status(&host, now),
            is_new: status::is_new(&host, now),
            host,
        }
    }
}

/// Detail columns an agent reports on check-in. Absent fields are left as stored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetailReport {
    pub hostname: Option<String>,
    pub uuid: Option<String>,
    pub platform: Option<String>,
    pub osquery_version: Option<String>,
    pub os_version: Option<String>,
    pub build: Option<String>,
    pub platform_like: Option<String>,
    pub code_name: Option<String>,
    pub uptime: Option<i64>,
    pub memory: Option<i64>,
    pub cpu_type: Option<String>,
    pub cpu_brand: Option<String>,
    pub cpu_physical_cores: Option<i32>,
    pub cpu_logical_cores: Option<i32>,
    pub hardware_vendor: Option<String>,
    pub hardware_model: Option<String>,
    pub hardware_serial: Option<String>,
    pub computer_name: Option<String>,
    pub primary_ip: Option<String>,
    pub primary_mac: Option<String>,
    pub distributed_interval: Option<i32>,
    pub config_tls_refresh: Option<i32>,
    pub logger_tls_period: Option<i32>,
    pub additional: Option<serde_json::Value>,
}

impl DetailReport {
    fn apply(self, host: &mut Host) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(v) = value {
                *slot = v;
            }
        }
        set(&mut host.hostname, self.hostname);
        set(&mut host.uuid, self.uuid);
        set(&mut host.platform, self.platform);
        set(&mut host.osquery_version, self.osquery_version);
        set(&mut host.os_version, self.os_version);
        set(&mut host.build, self.build);
        set(&mut host.platform_like, self.platform_like);
        set(&mut host.code_name, self.code_name);
        set(&mut host.uptime, self.uptime);
        set(&mut host.memory, self.memory);
        set(&mut host.cpu_type, self.cpu_type);
        set(&mut host.cpu_brand, self.cpu_brand);
        set(&mut host.cpu_physical_cores, self.cpu_physical_cores);
        set(&mut host.cpu_logical_cores, self.cpu_logical_cores);
        set(&mut host.hardware_vendor, self.hardware_vendor);
        set(&mut host.hardware_model, self.hardware_model);
        set(&mut host.hardware_serial, self.hardware_serial);
        set(&mut host.computer_name, self.computer_name);
        set(&mut host.primary_ip, self.primary_ip);
        set(&mut host.primary_mac, self.primary_mac);
        set(&mut host.distributed_interval, self.distributed_interval);
        set(&mut host.config_tls_refresh, self.config_tls_refresh);
        set(&mut host.logger_tls_period, self.logger_tls_period);
        if self.additional.is_some() {
            host.additional = self.additional;
        }
    }
}

/// Parameters of a carve session as announced by the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct CarveBegin {
    pub block_count: i64,
    pub block_size: i64,
    pub carve_size: i64,
    pub carve_id: String,
    pub request_id: String,
}

/// One uploaded block; `data` is base64.
#[derive(Debug, Clone, Deserialize)]
pub struct CarveBlockUpload {
    pub session_id: String,
    pub request_id: String,
    pub block_id: i64,
    pub data: String,
}

pub struct FleetService {
    pool: DbPool,
    settings: ServerSettings,
    /// Hosts that checked in since the last flush.
    seen: Mutex<HashSet<i32>>,
}

impl FleetService {
    pub fn new(pool: DbPool, settings: ServerSettings) -> Self {
        FleetService {
            pool,
            settings,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    fn seen_set(&self) -> MutexGuard<'_, HashSet<i32>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ----- agent-facing -----

    /// Enroll an agent and hand back its freshly minted node key.
    pub fn enroll_agent(&self, osquery_host_id: &str, team_id: Option<i32>) -> Result<Host> {
        let node_key = Uuid::new_v4().to_string();
        let mut conn = self.conn()?;
        hosts::enroll_host(
            &mut conn,
            osquery_host_id,
            &node_key,
            team_id,
            self.settings.enroll_cooldown(),
        )
    }

    /// Resolve a node key and buffer the host's check-in for the next flush.
    pub fn authenticate(&self, node_key: &str) -> Result<Host> {
        let mut conn = self.conn()?;
        let host = hosts::authenticate_host(&mut conn, node_key)?;
        self.record_seen(host.id);
        Ok(host)
    }

    /// Authenticate and, when the agent sent details, persist them.
    pub fn check_in(&self, node_key: &str, report: Option<DetailReport>) -> Result<Host> {
        let mut host = self.authenticate(node_key)?;
        let Some(report) = report else {
            return Ok(host);
        };

        let mut conn = self.conn()?;
        let additional = report.additional.is_some();
        report.apply(&mut host);
        host.detail_updated_at = Utc::now().naive_utc();
        host.refetch_requested = false;
        hosts::save_host(&mut conn, &mut host)?;
        if additional {
            hosts::save_host_additional(&mut conn, &host)?;
        }
        Ok(host)
    }

    /// Replace the host's software inventory with `observed`.
    pub fn ingest_software(&self, node_key: &str, observed: Vec<Software>) -> Result<ReconcileStats> {
        let mut host = self.authenticate(node_key)?;
        host.software.software = observed;
        host.software.modified = true;
        let mut conn = self.conn()?;
        software::save_host_software(&mut conn, &mut host)
    }

    pub fn begin_carve(&self, node_key: &str, begin: CarveBegin) -> Result<CarveMetadata> {
        let host = self.authenticate(node_key)?;
        self.begin_carve_for(&host, begin, Utc::now().naive_utc())
    }

    fn begin_carve_for(&self, host: &Host, begin: CarveBegin, now: NaiveDateTime) -> Result<CarveMetadata> {
        if begin.block_size > MAX_BLOCK_SIZE {
            return Err(FleetError::validation(format!(
                "block size {} exceeds maximum {}",
                begin.block_size, MAX_BLOCK_SIZE
            )));
        }
        if begin.carve_size > MAX_CARVE_SIZE {
            return Err(FleetError::validation(format!(
                "carve size {} exceeds maximum {}",
                begin.carve_size, MAX_CARVE_SIZE
            )));
        }
        let capacity = begin
            .block_count
            .checked_mul(begin.block_size)
            .ok_or_else(|| FleetError::validation("carve geometry overflows"))?;
        if begin.carve_size > capacity {
            return Err(FleetError::validation(format!(
                "carve size {} does not fit in {} blocks of {} bytes",
                begin.carve_size, begin.block_count, begin.block_size
            )));
        }
        if begin.request_id.is_empty() {
            return Err(FleetError::validation("carve request id must not be empty"));
        }

        let name = format!(
            "{}-{}-{}",
            now.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true),
            host.hostname,
            begin.request_id
        );
        let metadata = CarveMetadata {
            id: 0,
            host_id: host.id,
            created_at: now,
            name,
            block_count: begin.block_count,
            block_size: begin.block_size,
            carve_size: begin.carve_size,
            carve_id: begin.carve_id,
            request_id: begin.request_id,
            session_id: Uuid::new_v4().to_string(),
            max_block: -1,
            expired: false,
        };

        let mut conn = self.conn()?;
        carves::new_carve(&mut conn, &metadata)
    }

    /// Accept one uploaded block. The session id is the credential.
    pub fn carve_block(&self, upload: CarveBlockUpload) -> Result<CarveMetadata> {
        let mut conn = self.conn()?;
        let carve = carves::carve_by_session_id(&mut conn, &upload.session_id)?;
        if carve.request_id != upload.request_id {
            return Err(FleetError::validation(format!(
                "request id {} does not match carve {}",
                upload.request_id, carve.session_id
            )));
        }

        let data = BASE64
            .decode(upload.data.as_bytes())
            .map_err(|e| FleetError::validation(format!("block data is not base64: {e}")))?;
        if data.len() as i64 > carve.block_size {
            return Err(FleetError::validation(format!(
                "block of {} bytes exceeds block size {}",
                data.len(),
                carve.block_size
            )));
        }

        carves::new_block(&mut conn, &carve, upload.block_id, &data)?;
        carves::carve(&mut conn, carve.id)
    }

    // ----- seen buffer -----

    pub fn record_seen(&self, host_id: i32) {
        self.seen_set().insert(host_id);
    }

    /// Write every buffered check-in with a single update. On failure the ids
    /// go back into the buffer for the next attempt.
    pub fn flush_seen_hosts(&self, now: NaiveDateTime) -> Result<usize> {
        let ids: Vec<i32> = self.seen_set().drain().collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let result = self
            .conn()
            .and_then(|mut conn| hosts::mark_hosts_seen(&mut conn, &ids, now));
        if result.is_err() {
            self.seen_set().extend(ids.iter().copied());
        }
        result
    }

    // ----- operator reads and writes -----

    pub fn list_hosts(&self, filter: &TeamFilter, opt: &HostListOptions) -> Result<Vec<HostDetail>> {
        let now = Utc::now().naive_utc();
        let mut conn = self.conn()?;
        let found = hosts::list_hosts_at(&mut conn, filter, opt, now)?;
        Ok(found.into_iter().map(|h| HostDetail::new(h, now)).collect())
    }

    pub fn get_host(&self, id: i32) -> Result<HostDetail> {
        let mut conn = self.conn()?;
        let host = hosts::host(&mut conn, id)?;
        Ok(HostDetail::new(host, Utc::now().naive_utc()))
    }

    pub fn host_by_identifier(&self, identifier: &str) -> Result<HostDetail> {
        let mut conn = self.conn()?;
        let found = hosts::host_by_identifier(&mut conn, identifier)?;
        let host = hosts::host(&mut conn, found.id)?;
        Ok(HostDetail::new(host, Utc::now().naive_utc()))
    }

    pub fn get_host_summary(&self, filter: &TeamFilter) -> Result<HostSummary> {
        let mut conn = self.conn()?;
        hosts::generate_host_status_statistics(&mut conn, filter, Utc::now().naive_utc())
    }

    pub fn search_hosts(&self, filter: &TeamFilter, query: &str, omit: &[i32]) -> Result<Vec<HostDetail>> {
        let now = Utc::now().naive_utc();
        let mut conn = self.conn()?;
        let found = hosts::search_hosts(&mut conn, filter, query, omit)?;
        Ok(found.into_iter().map(|h| HostDetail::new(h, now)).collect())
    }

    pub fn delete_host(&self, id: i32) -> Result<()> {
        let mut conn = self.conn()?;
        hosts::delete_host(&mut conn, id)?;
        self.seen_set().remove(&id);
        Ok(())
    }

    pub fn refetch_host(&self, id: i32) -> Result<()> {
        let mut conn = self.conn()?;
        hosts::refetch_host(&mut conn, id)
    }

    pub fn add_hosts_to_team(&self, team_id: Option<i32>, host_ids: &[i32]) -> Result<usize> {
        let mut conn = self.conn()?;
        hosts::add_hosts_to_team(&mut conn, team_id, host_ids)
    }

    pub fn add_hosts_to_team_by_filter(
        &self,
        team_id: Option<i32>,
        filter: &TeamFilter,
        opt: &HostListOptions,
        label_id: Option<i32>,
    ) -> Result<usize> {
        let mut conn = self.conn()?;
        hosts::add_hosts_to_team_by_filter(&mut conn, team_id, filter, opt, label_id)
    }

    pub fn list_carves(&self, opt: &CarveListOptions) -> Result<Vec<CarveMetadata>> {
        let mut conn = self.conn()?;
        carves::list_carves(&mut conn, opt)
    }

    pub fn get_carve(&self, id: i32) -> Result<CarveMetadata> {
        let mut conn = self.conn()?;
        carves::carve(&mut conn, id)
    }

    pub fn get_block(&self, carve_id: i32, block_index: i64) -> Result<Vec<u8>> {
        let mut conn = self.conn()?;
        let carve = carves::carve(&mut conn, carve_id)?;
        carves::get_block(&mut conn, &carve, block_index)
    }

    // ----- sweeps -----

    pub fn cleanup_carves(&self, now: NaiveDateTime) -> Result<usize> {
        let mut conn = self.conn()?;
        carves::cleanup_carves(&mut conn, now)
    }

    pub fn cleanup_incoming_hosts(&self, now: NaiveDateTime) -> Result<usize> {
        let mut conn = self.conn()?;
        hosts::cleanup_incoming_hosts(&mut conn, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> (TempDir, FleetService) {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServerSettings {
            database_url: dir.path().join("fleet.db").to_string_lossy().into_owned(),
            pool_size: 2,
            ..ServerSettings::default()
        };
        let pool = crate::db::initialize(&settings).unwrap();
        (dir, FleetService::new(pool, settings))
    }

    fn begin(block_count: i64, block_size: i64, carve_size: i64) -> CarveBegin {
        CarveBegin {
            block_count,
            block_size,
            carve_size,
            carve_id: "carve-1".into(),
            request_id: "req-1".into(),
        }
    }

    #[test]
    fn enrolled_agent_can_check_in_and_report_details() {
        let (_dir, svc) = service();
        let host = svc.enroll_agent("agent-1", None).unwrap();
        assert!(!host.node_key.is_empty());

        let report = DetailReport {
            hostname: Some("web-1".into()),
            osquery_version: Some("5.10.2".into()),
            distributed_interval: Some(10),
            config_tls_refresh: Some(10),
            additional: Some(serde_json::json!({"owner": "ops"})),
            ..DetailReport::default()
        };
        svc.check_in(&host.node_key, Some(report)).unwrap();

        let detail = svc.get_host(host.id).unwrap();
        assert_eq!(detail.host.hostname, "web-1");
        assert_eq!(detail.host.additional, Some(serde_json::json!({"owner": "ops"})));
        assert!(detail.is_new);
        assert_eq!(detail.status, HostStatus::Online);

        assert!(matches!(svc.authenticate("bogus"), Err(FleetError::NotFound { .. })));
    }

    #[test]
    fn flush_writes_buffered_check_ins_once() {
        let (_dir, svc) = service();
        let a = svc.enroll_agent("a", None).unwrap();
        let b = svc.enroll_agent("b", None).unwrap();
        svc.authenticate(&a.node_key).unwrap();
        svc.authenticate(&b.node_key).unwrap();
        svc.authenticate(&a.node_key).unwrap();

        let later = Utc::now().naive_utc() + chrono::Duration::minutes(1);
        assert_eq!(svc.flush_seen_hosts(later).unwrap(), 2);
        assert_eq!(svc.flush_seen_hosts(later).unwrap(), 0);
        assert_eq!(svc.get_host(a.id).unwrap().host.seen_time, later);
    }

    #[test]
    fn software_ingest_reconciles() {
        let (_dir, svc) = service();
        let host = svc.enroll_agent("a", None).unwrap();
        let stats = svc
            .ingest_software(
                &host.node_key,
                vec![Software::new("vim", "9.0", "deb_packages"), Software::new("git", "2.43", "deb_packages")],
            )
            .unwrap();
        assert_eq!(stats.inserted, 2);

        let stats = svc
            .ingest_software(&host.node_key, vec![Software::new("vim", "9.1", "deb_packages")])
            .unwrap();
        assert_eq!(stats, ReconcileStats { inserted: 1, deleted: 2 });
        assert_eq!(svc.get_host(host.id).unwrap().host.software.software.len(), 1);
    }

    #[test]
    fn carve_protocol_validation() {
        let (_dir, svc) = service();
        let host = svc.enroll_agent("a", None).unwrap();

        assert!(matches!(
            svc.begin_carve(&host.node_key, begin(2, 4, 9)),
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            svc.begin_carve(&host.node_key, begin(1, MAX_BLOCK_SIZE + 1, 1)),
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            svc.begin_carve(&host.node_key, begin(100, MAX_BLOCK_SIZE, MAX_CARVE_SIZE + 1)),
            Err(FleetError::Validation(_))
        ));

        let carve = svc.begin_carve(&host.node_key, begin(2, 4, 8)).unwrap();
        assert_eq!(carve.max_block, -1);
        assert!(carve.name.ends_with("-req-1"));

        let upload = |request_id: &str, block_id: i64, data: &[u8]| CarveBlockUpload {
            session_id: carve.session_id.clone(),
            request_id: request_id.into(),
            block_id,
            data: BASE64.encode(data),
        };
        assert!(matches!(svc.carve_block(upload("other", 0, b"abcd")), Err(FleetError::Validation(_))));
        assert!(matches!(svc.carve_block(upload("req-1", 0, b"abcde")), Err(FleetError::Validation(_))));

        svc.carve_block(upload("req-1", 1, b"efgh")).unwrap();
        let done = svc.carve_block(upload("req-1", 0, b"abcd")).unwrap();
        assert!(done.is_complete());
        assert_eq!(svc.get_block(carve.id, 1).unwrap(), b"efgh".to_vec());
    }

    #[test]
    fn carve_name_embeds_time_and_hostname() {
        let (_dir, svc) = service();
        let host = Host {
            id: 1,
            hostname: "db-2".into(),
            ..Host::default()
        };
        let now = chrono::NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let carve = svc.begin_carve_for(&host, begin(1, 4, 4), now).unwrap();
        assert_eq!(carve.name, "2024-06-01T12:00:00Z-db-2-req-1");
    }

    #[test]
    fn deleted_host_disappears_from_reads() {
        let (_dir, svc) = service();
        let host = svc.enroll_agent("a", None).unwrap();
        svc.delete_host(host.id).unwrap();
        assert!(matches!(svc.get_host(host.id), Err(FleetError::NotFound { .. })));
        assert_eq!(svc.get_host_summary(&TeamFilter::all()).unwrap().total_count, 0);
    }
}
