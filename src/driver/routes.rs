//! HTTP surface of the driver plane.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode as HttpStatus;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::trace;

use crate::core::device::{Command, Device};
use crate::core::error::Result;
use crate::driver::service::DriverService;

/// Driver router nested under the driver base path.
pub fn driver_router(service: Arc<DriverService>) -> Router {
    let base = service.base_path().to_string();
    let routes = Router::new()
        .route("/balanced-connect-all", post(balanced_connect_all))
        .route("/connect-all", post(connect_all))
        .route("/connect-all-to-index", post(connect_all_to_index))
        .route("/connect-all-to-leader/{nodeIndex}", post(connect_all_to_leader))
        .route("/disconnect-all", delete(disconnect_all))
        .route("/disconnect", delete(disconnect))
        .route("/reconnect-all", put(reconnect_all))
        .route("/device-status/{deviceId}", get(device_status_of))
        .route("/device-status", get(device_status))
        .route("/device-id-map", get(device_id_map))
        .route("/response", get(responses))
        .route("/response/{deviceId}", get(responses_of))
        .route("/execute-commands/{deviceId}", post(execute_commands))
        .route("/request-commands/{deviceId}", post(request_commands))
        .route("/execute-command-ids/{deviceId}", post(execute_command_ids))
        .route("/request-command-ids/{deviceId}", post(request_command_ids));
    Router::new().nest(&base, routes).with_state(service)
}

#[derive(Debug, Deserialize)]
struct InitialValue {
    #[serde(rename = "initial-value")]
    initial_value: Option<String>,
}

async fn balanced_connect_all(
    State(service): State<Arc<DriverService>>,
    Json(devices): Json<HashSet<Device>>,
) -> Json<HashMap<String, String>> {
    trace!("POST balanced-connect-all");
    Json(service.balanced_connect_all(devices).await)
}

async fn connect_all(
    State(service): State<Arc<DriverService>>,
    Json(devices): Json<HashSet<Device>>,
) -> Json<HashMap<String, String>> {
    trace!("POST connect-all");
    let node_index = match service.cluster_opt() {
        Some(cluster) => cluster.node_index(),
        None => return Json(HashMap::new()),
    };
    Json(service.connect_all_to_leader(node_index, devices).await)
}

async fn connect_all_to_index(
    State(service): State<Arc<DriverService>>,
    Json(devices): Json<HashSet<Device>>,
) -> Json<HashMap<String, String>> {
    trace!("POST connect-all-to-index");
    Json(service.connect_all(devices).await)
}

async fn connect_all_to_leader(
    State(service): State<Arc<DriverService>>,
    Path(node_index): Path<u32>,
    Json(devices): Json<HashSet<Device>>,
) -> Json<HashMap<String, String>> {
    trace!("POST connect-all-to-leader/{}", node_index);
    Json(service.connect_all_to_leader(node_index, devices).await)
}

async fn disconnect_all(
    State(service): State<Arc<DriverService>>,
) -> Json<HashMap<String, String>> {
    trace!("DELETE disconnect-all");
    Json(service.disconnect_all(false).await.unwrap_or_default())
}

async fn disconnect(
    State(service): State<Arc<DriverService>>,
    Json(device_ids): Json<Vec<String>>,
) -> Json<HashMap<String, String>> {
    trace!("DELETE disconnect");
    Json(service.disconnect_list(device_ids, false).await.unwrap_or_default())
}

async fn reconnect_all(
    State(service): State<Arc<DriverService>>,
) -> Json<HashMap<String, String>> {
    trace!("PUT reconnect-all");
    Json(service.reconnect_all().await)
}

async fn device_status_of(
    State(service): State<Arc<DriverService>>,
    Path(device_id): Path<String>,
) -> HttpResponse {
    Json(service.device_status_of(&device_id)).into_response()
}

async fn device_status(State(service): State<Arc<DriverService>>) -> HttpResponse {
    Json(service.device_status()).into_response()
}

async fn device_id_map(State(service): State<Arc<DriverService>>) -> HttpResponse {
    Json(service.device_id_map()).into_response()
}

async fn responses(State(service): State<Arc<DriverService>>) -> HttpResponse {
    Json(service.responses()).into_response()
}

async fn responses_of(
    State(service): State<Arc<DriverService>>,
    Path(device_id): Path<String>,
) -> HttpResponse {
    Json(service.responses_of(&device_id)).into_response()
}

fn command_result(result: Result<Vec<crate::core::data::Response>>) -> HttpResponse {
    match result {
        Ok(responses) => Json(responses).into_response(),
        Err(e) => (HttpStatus::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn execute_commands(
    State(service): State<Arc<DriverService>>,
    Path(device_id): Path<String>,
    Query(query): Query<InitialValue>,
    Json(commands): Json<HashSet<Command>>,
) -> HttpResponse {
    command_result(
        service
            .execute_commands_detached(device_id, commands, query.initial_value, true)
            .await,
    )
}

async fn request_commands(
    State(service): State<Arc<DriverService>>,
    Path(device_id): Path<String>,
    Query(query): Query<InitialValue>,
    Json(commands): Json<HashSet<Command>>,
) -> HttpResponse {
    command_result(
        service
            .execute_commands_detached(device_id, commands, query.initial_value, false)
            .await,
    )
}

async fn execute_command_ids(
    State(service): State<Arc<DriverService>>,
    Path(device_id): Path<String>,
    Query(query): Query<InitialValue>,
    Json(command_ids): Json<Vec<String>>,
) -> HttpResponse {
    command_result(
        service
            .execute_command_ids_detached(device_id, command_ids, query.initial_value, true)
            .await,
    )
}

async fn request_command_ids(
    State(service): State<Arc<DriverService>>,
    Path(device_id): Path<String>,
    Query(query): Query<InitialValue>,
    Json(command_ids): Json<Vec<String>>,
) -> HttpResponse {
    command_result(
        service
            .execute_command_ids_detached(device_id, command_ids, query.initial_value, false)
            .await,
    )
}
