use chrono::NaiveDateTime;
use diesel::prelude::*;
use rocket::FromFormField;
use serde::{Deserialize, Serialize};

use crate::schema::{carve_metadata, hosts, software};
use crate::status::HostStatus;

/// One enrolled agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Host {
    pub id: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    #[serde(skip_serializing)]
    pub osquery_host_id: String,
    #[serde(skip_serializing)]
    pub node_key: String,
    pub detail_updated_at: NaiveDateTime,
    pub label_updated_at: NaiveDateTime,
    pub last_enrolled_at: NaiveDateTime,
    pub seen_time: NaiveDateTime,
    pub refetch_requested: bool,

    pub hostname: String,
    pub uuid: String,
    pub platform: String,
    pub osquery_version: String,
    pub os_version: String,
    pub build: String,
    pub platform_like: String,
    pub code_name: String,
    pub uptime: i64,
    pub memory: i64,

    pub cpu_type: String,
    pub cpu_brand: String,
    pub cpu_physical_cores: i32,
    pub cpu_logical_cores: i32,

    pub hardware_vendor: String,
    pub hardware_model: String,
    pub hardware_serial: String,
    pub computer_name: String,
    pub primary_ip: String,
    pub primary_mac: String,

    pub distributed_interval: i32,
    pub config_tls_refresh: i32,
    pub logger_tls_period: i32,
    pub team_id: Option<i32>,

    #[serde(flatten)]
    pub software: HostSoftware,
    /// Results of the additional queries; only loaded on full host reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional: Option<serde_json::Value>,
}

/// Persisted columns of a host row.
#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = hosts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct HostRow {
    pub id: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub osquery_host_id: String,
    pub node_key: String,
    pub detail_updated_at: NaiveDateTime,
    pub label_updated_at: NaiveDateTime,
    pub last_enrolled_at: NaiveDateTime,
    pub seen_time: NaiveDateTime,
    pub refetch_requested: bool,
    pub hostname: String,
    pub uuid: String,
    pub platform: String,
    pub osquery_version: String,
    pub os_version: String,
    pub build: String,
    pub platform_like: String,
    pub code_name: String,
    pub uptime: i64,
    pub memory: i64,
    pub cpu_type: String,
    pub cpu_brand: String,
    pub cpu_physical_cores: i32,
    pub cpu_logical_cores: i32,
    pub hardware_vendor: String,
    pub hardware_model: String,
    pub hardware_serial: String,
    pub computer_name: String,
    pub primary_ip: String,
    pub primary_mac: String,
    pub distributed_interval: i32,
    pub config_tls_refresh: i32,
    pub logger_tls_period: i32,
    pub team_id: Option<i32>,
}

impl From<HostRow> for Host {
    fn from(row: HostRow) -> Self {
        Host {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            osquery_host_id: row.osquery_host_id,
            node_key: row.node_key,
            detail_updated_at: row.detail_updated_at,
            label_updated_at: row.label_updated_at,
            last_enrolled_at: row.last_enrolled_at,
            seen_time: row.seen_time,
            refetch_requested: row.refetch_requested,
            hostname: row.hostname,
            uuid: row.uuid,
            platform: row.platform,
            osquery_version: row.osquery_version,
            os_version: row.os_version,
            build: row.build,
            platform_like: row.platform_like,
            code_name: row.code_name,
            uptime: row.uptime,
            memory: row.memory,
            cpu_type: row.cpu_type,
            cpu_brand: row.cpu_brand,
            cpu_physical_cores: row.cpu_physical_cores,
            cpu_logical_cores: row.cpu_logical_cores,
            hardware_vendor: row.hardware_vendor,
            hardware_model: row.hardware_model,
            hardware_serial: row.hardware_serial,
            computer_name: row.computer_name,
            primary_ip: row.primary_ip,
            primary_mac: row.primary_mac,
            distributed_interval: row.distributed_interval,
            config_tls_refresh: row.config_tls_refresh,
            logger_tls_period: row.logger_tls_period,
            team_id: row.team_id,
            software: HostSoftware::default(),
            additional: None,
        }
    }
}

/// Detail columns owned by `save_host`.
///
/// Identity and credentials (`osquery_host_id`, `node_key`), enrollment
/// (`last_enrolled_at`, `team_id`) and `seen_time` have their own writers and
/// are never part of this changeset.
#[derive(Insertable, AsChangeset)]
#[diesel(table_name = hosts)]
pub struct HostDetails<'a> {
    pub updated_at: NaiveDateTime,
    pub detail_updated_at: NaiveDateTime,
    pub label_updated_at: NaiveDateTime,
    pub refetch_requested: bool,
    pub hostname: &'a str,
    pub uuid: &'a str,
    pub platform: &'a str,
    pub osquery_version: &'a str,
    pub os_version: &'a str,
    pub build: &'a str,
    pub platform_like: &'a str,
    pub code_name: &'a str,
    pub uptime: i64,
    pub memory: i64,
    pub cpu_type: &'a str,
    pub cpu_brand: &'a str,
    pub cpu_physical_cores: i32,
    pub cpu_logical_cores: i32,
    pub hardware_vendor: &'a str,
    pub hardware_model: &'a str,
    pub hardware_serial: &'a str,
    pub computer_name: &'a str,
    pub primary_ip: &'a str,
    pub primary_mac: &'a str,
    pub distributed_interval: i32,
    pub config_tls_refresh: i32,
    pub logger_tls_period: i32,
}

impl<'a> HostDetails<'a> {
    pub fn from_host(host: &'a Host, updated_at: NaiveDateTime) -> Self {
        HostDetails {
            updated_at,
            detail_updated_at: host.detail_updated_at,
            label_updated_at: host.label_updated_at,
            refetch_requested: host.refetch_requested,
            hostname: &host.hostname,
            uuid: &host.uuid,
            platform: &host.platform,
            osquery_version: &host.osquery_version,
            os_version: &host.os_version,
            build: &host.build,
            platform_like: &host.platform_like,
            code_name: &host.code_name,
            uptime: host.uptime,
            memory: host.memory,
            cpu_type: &host.cpu_type,
            cpu_brand: &host.cpu_brand,
            cpu_physical_cores: host.cpu_physical_cores,
            cpu_logical_cores: host.cpu_logical_cores,
            hardware_vendor: &host.hardware_vendor,
            hardware_model: &host.hardware_model,
            hardware_serial: &host.hardware_serial,
            computer_name: &host.computer_name,
            primary_ip: &host.primary_ip,
            primary_mac: &host.primary_mac,
            distributed_interval: host.distributed_interval,
            config_tls_refresh: host.config_tls_refresh,
            logger_tls_period: host.logger_tls_period,
        }
    }
}

/// One installed package as reported by a host.
#[derive(Queryable, Selectable, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[diesel(table_name = software)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Software {
    #[serde(default)]
    pub id: i32,
    pub name: String,
    pub version: String,
    pub source: String,
}

impl Software {
    pub fn new(name: &str, version: &str, source: &str) -> Self {
        Software {
            id: 0,
            name: name.to_string(),
            version: version.to_string(),
            source: source.to_string(),
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = software)]
pub struct NewSoftware<'a> {
    pub host_id: i32,
    pub name: &'a str,
    pub version: &'a str,
    pub source: &'a str,
}

/// Software working set carried on a [`Host`].
///
/// `modified` is the dirty bit: callers set it after replacing `software`
/// with a fresh report, and a successful reconcile clears it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HostSoftware {
    #[serde(default)]
    pub software: Vec<Software>,
    #[serde(skip)]
    pub modified: bool,
}

/// A chunked file transfer session.
#[derive(Queryable, Selectable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = carve_metadata)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CarveMetadata {
    pub id: i32,
    pub host_id: i32,
    pub created_at: NaiveDateTime,
    pub name: String,
    pub block_count: i64,
    pub block_size: i64,
    pub carve_size: i64,
    pub carve_id: String,
    pub request_id: String,
    pub session_id: String,
    pub max_block: i64,
    pub expired: bool,
}

impl CarveMetadata {
    /// Every block up to `block_count - 1` has been seen. Gaps are not detected.
    pub fn is_complete(&self) -> bool {
        self.max_block == self.block_count - 1
    }
}

#[derive(Insertable)]
#[diesel(table_name = carve_metadata)]
pub struct NewCarve<'a> {
    pub host_id: i32,
    pub created_at: NaiveDateTime,
    pub name: &'a str,
    pub block_count: i64,
    pub block_size: i64,
    pub carve_size: i64,
    pub carve_id: &'a str,
    pub request_id: &'a str,
    pub session_id: &'a str,
    pub max_block: i64,
    pub expired: bool,
}

/// Liveness counts over a host population.
///
/// `new_count` overlaps the other buckets, so the sum may exceed `total_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostSummary {
    pub online_count: u64,
    pub offline_count: u64,
    pub mia_count: u64,
    pub new_count: u64,
    pub total_count: u64,
}

/// Team scoping for read operations. `None` sees every host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeamFilter {
    pub team_ids: Option<Vec<i32>>,
}

impl TeamFilter {
    pub fn all() -> Self {
        TeamFilter { team_ids: None }
    }

    pub fn teams(ids: Vec<i32>) -> Self {
        TeamFilter {
            team_ids: Some(ids),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, FromFormField)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    #[default]
    #[field(value = "asc")]
    Asc,
    #[field(value = "desc")]
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, FromFormField)]
#[serde(rename_all = "snake_case")]
pub enum HostOrderKey {
    #[default]
    #[field(value = "id")]
    Id,
    #[field(value = "hostname")]
    Hostname,
    #[field(value = "created_at")]
    CreatedAt,
    #[field(value = "seen_time")]
    SeenTime,
}

/// Pagination shared by the list calls. `per_page == 0` returns everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub page: u32,
    pub per_page: u32,
    pub order_key: HostOrderKey,
    pub order_direction: OrderDirection,
    /// Matched against hostname and uuid.
    pub match_query: String,
}

impl ListOptions {
    pub fn offset(&self) -> i64 {
        i64::from(self.page) * i64::from(self.per_page)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostListOptions {
    pub list: ListOptions,
    pub status_filter: Option<HostStatus>,
    /// Keys of the additional blob to return; empty returns none.
    pub additional_filters: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarveListOptions {
    pub list: ListOptions,
    /// Include expired sessions alongside live ones.
    pub expired: bool,
}
