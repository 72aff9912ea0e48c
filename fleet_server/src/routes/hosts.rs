use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::{Json, Value, json};
use rocket::serde::Deserialize;
use rocket::{delete, get, post, FromForm, State};

use crate::error::FleetError;
use crate::models::{
    HostListOptions, HostOrderKey, HostSummary, ListOptions, OrderDirection, TeamFilter,
};
use crate::service::HostDetail;
use crate::state::AppState;
use crate::status::HostStatus;

/// Query string accepted by `GET /api/hosts`.
#[derive(FromForm, Debug, Default)]
pub struct HostListQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub order_key: Option<HostOrderKey>,
    pub order_direction: Option<OrderDirection>,
    pub query: Option<String>,
    pub status: Option<HostStatus>,
    /// Comma separated keys of the additional blob to include.
    pub additional_info_filters: Option<String>,
    pub team_id: Option<i32>,
}

impl HostListQuery {
    fn options(&self) -> HostListOptions {
        HostListOptions {
            list: ListOptions {
                page: self.page.unwrap_or(0),
                per_page: self.per_page.unwrap_or(0),
                order_key: self.order_key.unwrap_or_default(),
                order_direction: self.order_direction.unwrap_or_default(),
                match_query: self.query.clone().unwrap_or_default(),
            },
            status_filter: self.status,
            additional_filters: self
                .additional_info_filters
                .as_deref()
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

fn team_filter(team_id: Option<i32>) -> TeamFilter {
    match team_id {
        Some(team) => TeamFilter::teams(vec![team]),
        None => TeamFilter::all(),
    }
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct TransferRequest {
    pub team_id: Option<i32>,
    #[serde(default)]
    pub hosts: Vec<i32>,
}

#[derive(Deserialize, Default)]
#[serde(crate = "rocket::serde")]
pub struct TransferFilters {
    #[serde(default)]
    pub query: String,
    pub status: Option<HostStatus>,
    pub label_id: Option<i32>,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct TransferByFilterRequest {
    pub team_id: Option<i32>,
    #[serde(default)]
    pub filters: TransferFilters,
}

#[get("/api/hosts?<q..>")]
pub async fn list_hosts(state: &State<Arc<AppState>>, q: HostListQuery) -> Result<Json<Vec<HostDetail>>, FleetError> {
    let opt = q.options();
    let filter = team_filter(q.team_id);
    let hosts = state.run(move |svc| svc.list_hosts(&filter, &opt)).await?;
    Ok(Json(hosts))
}

/// Free-text search; `omit` may be repeated
#[get("/api/hosts/search?<query>&<omit>&<team_id>")]
pub async fn search_hosts(
    state: &State<Arc<AppState>>,
    query: Option<String>,
    omit: Option<Vec<i32>>,
    team_id: Option<i32>,
) -> Result<Json<Vec<HostDetail>>, FleetError> {
    let query = query.unwrap_or_default();
    let omit = omit.unwrap_or_default();
    let filter = team_filter(team_id);
    let hosts = state
        .run(move |svc| svc.search_hosts(&filter, &query, &omit))
        .await?;
    Ok(Json(hosts))
}

#[get("/api/hosts/summary?<team_id>")]
pub async fn host_summary(state: &State<Arc<AppState>>, team_id: Option<i32>) -> Result<Json<HostSummary>, FleetError> {
    let filter = team_filter(team_id);
    let summary = state.run(move |svc| svc.get_host_summary(&filter)).await?;
    Ok(Json(summary))
}

/// Look a host up by osquery id, node key, uuid or hostname
#[get("/api/hosts/identifier/<identifier>")]
pub async fn host_by_identifier(state: &State<Arc<AppState>>, identifier: String) -> Result<Json<HostDetail>, FleetError> {
    let host = state.run(move |svc| svc.host_by_identifier(&identifier)).await?;
    Ok(Json(host))
}

#[get("/api/hosts/<id>")]
pub async fn get_host(state: &State<Arc<AppState>>, id: i32) -> Result<Json<HostDetail>, FleetError> {
    let host = state.run(move |svc| svc.get_host(id)).await?;
    Ok(Json(host))
}

#[delete("/api/hosts/<id>")]
pub async fn delete_host(state: &State<Arc<AppState>>, id: i32) -> Result<Status, FleetError> {
    state.run(move |svc| svc.delete_host(id)).await?;
    Ok(Status::NoContent)
}

#[post("/api/hosts/<id>/refetch")]
pub async fn refetch_host(state: &State<Arc<AppState>>, id: i32) -> Result<Status, FleetError> {
    state.run(move |svc| svc.refetch_host(id)).await?;
    Ok(Status::Ok)
}

/// Move the listed hosts to a team; a null team clears membership
#[post("/api/hosts/transfer", format = "json", data = "<req>")]
pub async fn transfer_hosts(state: &State<Arc<AppState>>, req: Json<TransferRequest>) -> Result<Json<Value>, FleetError> {
    let req = req.into_inner();
    let updated = state
        .run(move |svc| svc.add_hosts_to_team(req.team_id, &req.hosts))
        .await?;
    Ok(Json(json!({ "updated": updated })))
}

#[post("/api/hosts/transfer/filter", format = "json", data = "<req>")]
pub async fn transfer_hosts_by_filter(
    state: &State<Arc<AppState>>,
    req: Json<TransferByFilterRequest>,
) -> Result<Json<Value>, FleetError> {
    let req = req.into_inner();
    let opt = HostListOptions {
        list: ListOptions {
            match_query: req.filters.query,
            ..ListOptions::default()
        },
        status_filter: req.filters.status,
        additional_filters: Vec::new(),
    };
    let label_id = req.filters.label_id;
    let updated = state
        .run(move |svc| {
            svc.add_hosts_to_team_by_filter(req.team_id, &TeamFilter::all(), &opt, label_id)
        })
        .await?;
    Ok(Json(json!({ "updated": updated })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additional_filter_keys_are_split_and_trimmed() {
        let q = HostListQuery {
            additional_info_filters: Some(" owner, ,disk ".into()),
            per_page: Some(25),
            ..HostListQuery::default()
        };
        let opt = q.options();
        assert_eq!(opt.additional_filters, vec!["owner", "disk"]);
        assert_eq!(opt.list.per_page, 25);
        assert_eq!(opt.list.order_key, HostOrderKey::Id);
    }
}
