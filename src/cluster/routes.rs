//! HTTP surface of the cluster plane.
//!
//! Three route groups mirror the peer protocol: the internal RPC used by
//! peers, the controller surface for operators, and the redirect proxy that
//! forwards arbitrary requests to the leader or to a specific node.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post, put};
use axum::{Json, Router};
use tracing::trace;

use crate::cluster::service::ClusterService;
use crate::cluster::shared::{DeleteInfo, MergeInfo, SharedSnapshot, SharedWrite};
use crate::core::data::{NodeStatus, Role};

const NOT_PREPARED: &str = "application is not prepared";

/// Full cluster router: `/index` at the root plus the internal, controller
/// and redirect groups.
pub fn cluster_router(service: Arc<ClusterService>) -> Router {
    let base = service.config.base_path.clone();
    let grouped = Router::new()
        .merge(internal_routes())
        .merge(controller_routes());
    Router::new()
        .route("/index", get(index))
        .nest(&base, grouped)
        .merge(redirect_routes())
        .with_state(service)
}

fn internal_routes() -> Router<Arc<ClusterService>> {
    Router::new()
        .route(
            "/heartbeat/{nodeIndex}/{role}/{lastTransition}",
            put(heartbeat),
        )
        .route("/cluster-deleted/{nodeIndex}", delete(cluster_deleted))
        .route("/remove-shared-object/{nodeIndex}", delete(remove_shared_object))
        .route("/get-shared-object", get(get_own_shared_object))
        .route("/get-shared-object/{nodeIndex}", get(get_shared_object))
        .route(
            "/merge-shared-object-to-leader/{nodeIndex}",
            post(merge_shared_object_to_leader),
        )
        .route(
            "/delete-shared-object-to-leader/{nodeIndex}",
            post(delete_shared_object_to_leader),
        )
        .route(
            "/check-merge-shared-object/{nodeIndex}",
            post(check_merge_shared_object),
        )
        .route(
            "/check-delete-shared-object/{nodeIndex}",
            post(check_delete_shared_object),
        )
        .route(
            "/overwrite-shared-object/{nodeIndex}",
            post(overwrite_shared_object),
        )
        .route("/sync-shared-object/{nodeIndex}", post(sync_shared_object))
        .route("/check-shared-object-sequence", post(check_shared_object_seq))
}

fn controller_routes() -> Router<Arc<ClusterService>> {
    Router::new()
        .route("/leader-url", get(leader_url))
        .route("/index-url/{nodeIndex}", get(index_url))
        .route("/node-status", get(node_status))
        .route("/set-to-leader", put(set_to_leader))
        .route("/set-to-follower", put(set_to_follower))
        .route("/shared-object-map", get(shared_object_map))
        .route("/shared-object-seq", get(shared_object_seq))
        .route("/add-cluster-node", post(add_cluster_node))
        .route("/get-cluster-urls", get(get_cluster_urls))
        .route("/get-cluster-nodes", get(get_cluster_nodes))
        .route("/get-node-index", get(get_node_index))
}

fn redirect_routes() -> Router<Arc<ClusterService>> {
    Router::new()
        .route("/redirect-to-leader/{*path}", any(redirect_to_leader))
        .route(
            "/redirect-to-index/{nodeIndex}/{*path}",
            any(redirect_to_index),
        )
}

async fn index(State(service): State<Arc<ClusterService>>) -> String {
    service.node_index().to_string()
}

async fn heartbeat(
    State(service): State<Arc<ClusterService>>,
    Path((node_index, role, last_transition)): Path<(u32, String, i64)>,
    Json(seq_map): Json<HashMap<u32, u64>>,
) -> Response {
    let Ok(role) = role.parse::<Role>() else {
        return (StatusCode::BAD_REQUEST, format!("invalid role: {role}")).into_response();
    };
    if service.node_index() != node_index {
        service
            .heartbeat_received(node_index, role, last_transition, seq_map)
            .await;
    }
    StatusCode::OK.into_response()
}

async fn cluster_deleted(
    State(service): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
) -> StatusCode {
    if service.node_index() != node_index {
        service.cluster_deleted(node_index).await;
    }
    StatusCode::OK
}

async fn remove_shared_object(
    State(service): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
) -> StatusCode {
    if service.node_index() != node_index {
        service.remove_shared_object(node_index).await;
    }
    StatusCode::OK
}

async fn get_own_shared_object(State(service): State<Arc<ClusterService>>) -> Json<MergeInfo> {
    Json(service.shared_object_info(service.node_index()))
}

async fn get_shared_object(
    State(service): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
) -> Json<MergeInfo> {
    Json(service.shared_object_info(node_index))
}

async fn merge_shared_object_to_leader(
    State(service): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
    Json(info): Json<MergeInfo>,
) -> Response {
    match service
        .set_shared_object_to_leader(node_index, SharedWrite::Merge(info))
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn delete_shared_object_to_leader(
    State(service): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
    Json(info): Json<DeleteInfo>,
) -> Response {
    match service
        .set_shared_object_to_leader(node_index, SharedWrite::Delete(info))
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn check_merge_shared_object(
    State(service): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
    Json(info): Json<MergeInfo>,
) -> Json<bool> {
    if service.node_index() == node_index {
        return Json(true);
    }
    Json(service.check_shared_object(node_index, SharedWrite::Merge(info)))
}

async fn check_delete_shared_object(
    State(service): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
    Json(info): Json<DeleteInfo>,
) -> Json<bool> {
    if service.node_index() == node_index {
        return Json(true);
    }
    Json(service.check_shared_object(node_index, SharedWrite::Delete(info)))
}

async fn overwrite_shared_object(
    State(service): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
    Json(info): Json<MergeInfo>,
) -> StatusCode {
    if service.node_index() != node_index {
        service.overwrite_shared_object(node_index, info);
    }
    StatusCode::OK
}

async fn sync_shared_object(
    State(service): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
    Json(snapshot): Json<SharedSnapshot>,
) -> StatusCode {
    if service.node_index() != node_index {
        service.sync_shared_object(snapshot).await;
    }
    StatusCode::OK
}

async fn check_shared_object_seq(
    State(service): State<Arc<ClusterService>>,
    Json(seq_map): Json<HashMap<u32, u64>>,
) -> Json<std::collections::HashSet<u32>> {
    Json(service.check_shared_object_seq(&seq_map))
}

async fn leader_url(State(service): State<Arc<ClusterService>>) -> String {
    service
        .to_leader_confirmed("leader-url", |url| async move { Ok(url) })
        .await
}

async fn index_url(
    State(service): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
) -> Response {
    match service
        .to_index(node_index, "index-url", |url| async move { Ok(url) })
        .await
    {
        Ok(url) => url.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn node_status(State(service): State<Arc<ClusterService>>) -> Response {
    if service.prepared() {
        Json(NodeStatus {
            node_index: service.node_index(),
            role: service.role(),
            activated: service.activated(),
        })
        .into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            format!("{NOT_PREPARED}, get status ignored"),
        )
            .into_response()
    }
}

async fn set_to_leader(State(service): State<Arc<ClusterService>>) -> Response {
    match service.force_to_leader().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => (
            StatusCode::BAD_REQUEST,
            format!("{NOT_PREPARED}, set to leader ignored"),
        )
            .into_response(),
    }
}

async fn set_to_follower(State(service): State<Arc<ClusterService>>) -> Response {
    match service.force_to_follower().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => (
            StatusCode::BAD_REQUEST,
            format!("{NOT_PREPARED}, set to follower ignored"),
        )
            .into_response(),
    }
}

async fn shared_object_map(State(service): State<Arc<ClusterService>>) -> Response {
    Json(service.shared_object_map()).into_response()
}

async fn shared_object_seq(State(service): State<Arc<ClusterService>>) -> Response {
    Json(service.shared_seq_map()).into_response()
}

async fn add_cluster_node(
    State(service): State<Arc<ClusterService>>,
    body: String,
) -> Response {
    if service.add_peer_url(body.clone()) {
        StatusCode::OK.into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            format!("node {body} already registered"),
        )
            .into_response()
    }
}

async fn get_cluster_urls(State(service): State<Arc<ClusterService>>) -> Json<Vec<String>> {
    let mut urls = service.peer_url_list();
    urls.push(service.node_url().to_string());
    Json(urls)
}

async fn get_cluster_nodes(
    State(service): State<Arc<ClusterService>>,
) -> Json<std::collections::HashSet<u32>> {
    Json(service.cluster())
}

async fn get_node_index(State(service): State<Arc<ClusterService>>) -> Json<u32> {
    Json(service.node_index())
}

async fn redirect_to_leader(
    State(service): State<Arc<ClusterService>>,
    Path(path): Path<String>,
    req: Request,
) -> Response {
    trace!("redirect-to-leader /{}", path);
    let target = service
        .to_leader_confirmed("redirect-to-leader", |url| async move { Ok(url) })
        .await;
    proxy(&service, &target, &path, req).await
}

async fn redirect_to_index(
    State(service): State<Arc<ClusterService>>,
    Path((node_index, path)): Path<(u32, String)>,
    req: Request,
) -> Response {
    trace!("redirect-to-index({}) /{}", node_index, path);
    match service
        .to_index(node_index, "redirect-to-index", |url| async move { Ok(url) })
        .await
    {
        Ok(target) => proxy(&service, &target, &path, req).await,
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// Forward `req` to `{target}/{path}` preserving method, headers, query and
/// body, and mirror the answer back.
async fn proxy(service: &ClusterService, target: &str, path: &str, req: Request) -> Response {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let body = match axum::body::to_bytes(req.into_body(), 16 * 1024 * 1024).await {
        Ok(b) => b,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid request body: {e}"))
                .into_response()
        }
    };

    let url = format!("{}/{}{}", target.trim_end_matches('/'), path, query);
    let method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid http method").into_response(),
    };
    let mut builder = service.client.http().request(method, &url);
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST || name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }
    match builder.body(body.to_vec()).send().await {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut out_headers = Vec::new();
            for (name, value) in resp.headers().iter() {
                if name.as_str() == "content-length" || name.as_str() == "transfer-encoding" {
                    continue;
                }
                if let (Ok(n), Ok(v)) = (
                    HeaderName::from_bytes(name.as_str().as_bytes()),
                    HeaderValue::from_bytes(value.as_bytes()),
                ) {
                    out_headers.push((n, v));
                }
            }
            let bytes = resp.bytes().await.unwrap_or_default();
            let mut response = Response::builder().status(status);
            for (n, v) in out_headers {
                response = response.header(n, v);
            }
            response
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}
