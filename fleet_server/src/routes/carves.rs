use std::sync::Arc;

use rocket::http::ContentType;
use rocket::serde::json::Json;
use rocket::{get, State};

use crate::error::FleetError;
use crate::models::{CarveListOptions, CarveMetadata, ListOptions};
use crate::state::AppState;

#[get("/api/carves?<page>&<per_page>&<expired>")]
pub async fn list_carves(
    state: &State<Arc<AppState>>,
    page: Option<u32>,
    per_page: Option<u32>,
    expired: Option<bool>,
) -> Result<Json<Vec<CarveMetadata>>, FleetError> {
    let opt = CarveListOptions {
        list: ListOptions {
            page: page.unwrap_or(0),
            per_page: per_page.unwrap_or(0),
            ..ListOptions::default()
        },
        expired: expired.unwrap_or(false),
    };
    let carves = state.run(move |svc| svc.list_carves(&opt)).await?;
    Ok(Json(carves))
}

#[get("/api/carves/<id>")]
pub async fn get_carve(state: &State<Arc<AppState>>, id: i32) -> Result<Json<CarveMetadata>, FleetError> {
    let carve = state.run(move |svc| svc.get_carve(id)).await?;
    Ok(Json(carve))
}

/// Raw block bytes; 410 once the session has been swept
#[get("/api/carves/<id>/block/<block_id>")]
pub async fn get_block(
    state: &State<Arc<AppState>>,
    id: i32,
    block_id: i64,
) -> Result<(ContentType, Vec<u8>), FleetError> {
    let data = state.run(move |svc| svc.get_block(id, block_id)).await?;
    Ok((ContentType::Binary, data))
}
