use std::sync::Arc;

use rocket::serde::json::{Json, Value, json};
use rocket::serde::Deserialize;
use rocket::{post, State};

use crate::error::FleetError;
use crate::models::Software;
use crate::service::{CarveBegin, CarveBlockUpload, DetailReport};
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct EnrollRequest {
    pub host_identifier: String,
    #[serde(default)]
    pub team_id: Option<i32>,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct CheckinRequest {
    pub node_key: String,
    #[serde(default)]
    pub details: Option<DetailReport>,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct SoftwareRequest {
    pub node_key: String,
    #[serde(default)]
    pub software: Vec<Software>,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct CarveBeginRequest {
    pub node_key: String,
    #[serde(flatten)]
    pub begin: CarveBegin,
}

/// Enroll an agent; the response carries its node key
#[post("/api/osquery/enroll", format = "json", data = "<req>")]
pub async fn enroll(state: &State<Arc<AppState>>, req: Json<EnrollRequest>) -> Result<Json<Value>, FleetError> {
    let req = req.into_inner();
    let host = state
        .run(move |svc| svc.enroll_agent(&req.host_identifier, req.team_id))
        .await?;
    Ok(Json(json!({ "node_key": host.node_key, "node_invalid": false })))
}

/// Periodic check-in, optionally carrying fresh host details
#[post("/api/osquery/checkin", format = "json", data = "<req>")]
pub async fn checkin(state: &State<Arc<AppState>>, req: Json<CheckinRequest>) -> Result<Json<Value>, FleetError> {
    let req = req.into_inner();
    let host = state
        .run(move |svc| svc.check_in(&req.node_key, req.details))
        .await?;
    Ok(Json(json!({
        "node_invalid": false,
        "host_id": host.id,
        "refetch_requested": host.refetch_requested,
    })))
}

/// Full software inventory report
#[post("/api/osquery/software", format = "json", data = "<req>")]
pub async fn software(state: &State<Arc<AppState>>, req: Json<SoftwareRequest>) -> Result<Json<Value>, FleetError> {
    let req = req.into_inner();
    let stats = state
        .run(move |svc| svc.ingest_software(&req.node_key, req.software))
        .await?;
    Ok(Json(json!({ "inserted": stats.inserted, "deleted": stats.deleted })))
}

#[post("/api/osquery/carve/begin", format = "json", data = "<req>")]
pub async fn carve_begin(state: &State<Arc<AppState>>, req: Json<CarveBeginRequest>) -> Result<Json<Value>, FleetError> {
    let req = req.into_inner();
    let carve = state
        .run(move |svc| svc.begin_carve(&req.node_key, req.begin))
        .await?;
    Ok(Json(json!({ "success": true, "session_id": carve.session_id })))
}

#[post("/api/osquery/carve/block", format = "json", data = "<upload>")]
pub async fn carve_block(state: &State<Arc<AppState>>, upload: Json<CarveBlockUpload>) -> Result<Json<Value>, FleetError> {
    let upload = upload.into_inner();
    let carve = state.run(move |svc| svc.carve_block(upload)).await?;
    Ok(Json(json!({
        "success": true,
        "max_block": carve.max_block,
        "complete": carve.is_complete(),
    })))
}
