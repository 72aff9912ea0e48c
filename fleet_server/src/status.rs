//! Host liveness.
//!
//! Status is derived, never stored: it is a pure function of the host's
//! `seen_time`, its two refresh intervals and the reference time. Keep
//! [`status`] and [`summarize`] on the same code path so per-host status and
//! the dashboard counts can never disagree.

use chrono::{Duration, NaiveDateTime};
use rocket::FromFormField;
use serde::{Deserialize, Serialize};

use crate::models::{Host, HostSummary};

/// A host created within this window is "new".
pub const NEW_DURATION_SECS: i64 = 24 * 60 * 60;

/// A host silent for this long is missing in action.
pub const MIA_DURATION_SECS: i64 = 30 * 24 * 60 * 60;

/// Slack added to the expected check-in interval so a host that checks in a
/// little late does not flap to offline.
pub const ONLINE_INTERVAL_BUFFER_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, FromFormField)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    #[field(value = "new")]
    New,
    #[field(value = "online")]
    Online,
    #[field(value = "offline")]
    Offline,
    #[field(value = "mia")]
    Mia,
}

/// Interval inputs the liveness rules read from a host.
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    pub seen_time: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub distributed_interval: i32,
    pub config_tls_refresh: i32,
}

impl From<&Host> for Liveness {
    fn from(host: &Host) -> Self {
        Liveness {
            seen_time: host.seen_time,
            created_at: host.created_at,
            distributed_interval: host.distributed_interval,
            config_tls_refresh: host.config_tls_refresh,
        }
    }
}

impl Liveness {
    /// The host's real check-in cadence is the shorter of its two refresh
    /// periods; add the buffer on top.
    pub fn online_interval(&self) -> Duration {
        let cadence = self.distributed_interval.min(self.config_tls_refresh).max(0);
        Duration::seconds(i64::from(cadence) + ONLINE_INTERVAL_BUFFER_SECS)
    }

    /// Never `New`: newness is orthogonal, see [`Liveness::is_new`].
    pub fn status(&self, now: NaiveDateTime) -> HostStatus {
        let silence = now - self.seen_time;
        if silence >= Duration::seconds(MIA_DURATION_SECS) {
            HostStatus::Mia
        } else if silence >= self.online_interval() {
            HostStatus::Offline
        } else {
            HostStatus::Online
        }
    }

    pub fn is_new(&self, now: NaiveDateTime) -> bool {
        self.created_at + Duration::seconds(NEW_DURATION_SECS) >= now
    }
}

pub fn status(host: &Host, now: NaiveDateTime) -> HostStatus {
    Liveness::from(host).status(now)
}

pub fn is_new(host: &Host, now: NaiveDateTime) -> bool {
    Liveness::from(host).is_new(now)
}

/// True if the host belongs in the bucket a list status filter asks for.
pub fn matches_filter(live: &Liveness, filter: HostStatus, now: NaiveDateTime) -> bool {
    match filter {
        HostStatus::New => live.is_new(now),
        other => live.status(now) == other,
    }
}

/// Count a population. Each host lands in exactly one of online, offline or
/// mia; `new` is counted independently on top.
pub fn summarize<I>(hosts: I, now: NaiveDateTime) -> HostSummary
where
    I: IntoIterator<Item = Liveness>,
{
    let mut summary = HostSummary::default();
    for live in hosts {
        summary.total_count += 1;
        match live.status(now) {
            HostStatus::Online => summary.online_count += 1,
            HostStatus::Offline => summary.offline_count += 1,
            HostStatus::Mia => summary.mia_count += 1,
            // counted through is_new below
            HostStatus::New => {}
        }
        if live.is_new(now) {
            summary.new_count += 1;
        }
    }
    summary
}
