//! Device ownership and lifecycle for this node.
//!
//! The service owns the deviceId → protocol map, validates and places
//! incoming devices (optionally balanced across the cluster), routes
//! disconnects to owning nodes, and reacts to cluster events: quorum loss
//! disconnects everything, a dead node's devices are re-placed, duplicate
//! owners after a partition heal are resolved.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use crate::cluster::service::ClusterService;
use crate::cluster::Tree;
use crate::core::data::{Response, Status, StatusCode};
use crate::core::device::{join_ids, Command, Device};
use crate::core::error::{GatewayError, Result};
use crate::core::events::{fire_device_events, ClusterEvents, DriverEvents, NodeTreeFn};
use crate::driver::protocol::DeviceProtocol;
use crate::driver::sink::DriverOutput;

/// Per-node driver service.
pub struct DriverService {
    driver_id: String,
    base_path: String,
    load_balancing: bool,
    reconnect_when_split_brain_resolved: bool,
    default_script: String,
    output: Arc<dyn DriverOutput>,
    events: DriverEvents,
    cluster: OnceLock<Arc<ClusterService>>,

    pub(crate) protocols: DashMap<String, Arc<DeviceProtocol>>,
    response_map: DashMap<String, HashMap<String, Response>>,

    /// Guards device registration and removal.
    register_lock: Mutex<()>,
    /// Serializes leader-side placement of connect-all batches.
    connect_all_lock: Mutex<()>,
}

impl DriverService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver_id: impl Into<String>,
        base_path: impl Into<String>,
        load_balancing: bool,
        reconnect_when_split_brain_resolved: bool,
        default_script: impl Into<String>,
        output: Arc<dyn DriverOutput>,
        events: DriverEvents,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver_id: driver_id.into(),
            base_path: base_path.into(),
            load_balancing,
            reconnect_when_split_brain_resolved,
            default_script: default_script.into(),
            output,
            events,
            cluster: OnceLock::new(),
            protocols: DashMap::new(),
            response_map: DashMap::new(),
            register_lock: Mutex::new(()),
            connect_all_lock: Mutex::new(()),
        })
    }

    /// Wire the cluster service in (once, at startup).
    pub fn attach_cluster(&self, cluster: Arc<ClusterService>) {
        let _ = self.cluster.set(cluster);
    }

    pub(crate) fn cluster_opt(&self) -> Option<Arc<ClusterService>> {
        self.cluster.get().cloned()
    }

    fn cluster(&self) -> Arc<ClusterService> {
        self.cluster
            .get()
            .cloned()
            .expect("cluster service is attached before the driver starts")
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub(crate) fn default_script(&self) -> &str {
        &self.default_script
    }

    // ------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------

    /// Cache the latest response per tag and forward to the output sink.
    pub async fn send_response(&self, responses: Vec<Response>) -> Result<()> {
        for response in &responses {
            self.response_map
                .entry(response.device_id.clone())
                .or_default()
                .insert(response.tag_id.clone(), response.clone());
        }
        self.output
            .send_response(&responses, &self.driver_id, self.cluster().node_index())
            .await
    }

    pub async fn send_status(&self, status: Status) -> Result<()> {
        self.output
            .send_status(&status, &self.driver_id, self.cluster().node_index())
            .await
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Device ownership across the cluster, derived from the replicated
    /// shared object (eventually consistent).
    pub fn device_id_map(&self) -> HashMap<u32, HashSet<String>> {
        self.cluster()
            .shared_object_map()
            .into_iter()
            .map(|(node, tree)| (node, tree.keys().cloned().collect()))
            .collect()
    }

    pub fn device_status(&self) -> HashMap<String, StatusCode> {
        self.protocols
            .iter()
            .filter_map(|e| e.value().status().map(|s| (e.key().clone(), s)))
            .collect()
    }

    /// Unknown devices report DISCONNECTED.
    pub fn device_status_of(&self, device_id: &str) -> StatusCode {
        self.protocols
            .get(device_id)
            .and_then(|p| p.status())
            .unwrap_or(StatusCode::Disconnected)
    }

    pub fn responses(&self) -> HashMap<String, HashMap<String, Response>> {
        self.response_map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn responses_of(&self, device_id: &str) -> HashMap<String, Response> {
        self.response_map
            .get(device_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn registered_devices(&self) -> HashSet<Device> {
        self.protocols
            .iter()
            .map(|e| e.value().device.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Connect paths
    // ------------------------------------------------------------------

    /// Leader-side entry: validate ids and cluster-wide uniqueness, then
    /// place the accepted set on the requested node. Non-leaders forward.
    pub async fn connect_all_to_leader(
        self: &Arc<Self>,
        node_index: u32,
        devices: HashSet<Device>,
    ) -> HashMap<String, String> {
        info!(
            "try to connect all to leader: {}",
            join_ids(devices.iter().map(|d| d.id.as_str()))
        );
        let cluster = self.cluster();
        if cluster.is_leader() {
            let _guard = self.connect_all_lock.lock().await;
            let mut ret = HashMap::new();
            let mut accepted = HashSet::new();
            let id_map = self.device_id_map();
            for device in devices {
                let registered = id_map
                    .iter()
                    .find(|(_, ids)| ids.contains(&device.id))
                    .map(|(node, _)| *node);
                if let Some(owner) = registered {
                    info!(
                        "[{}] connect failed, device is already registered in node-index: {}",
                        device.id, owner
                    );
                    ret.insert(
                        device.id.clone(),
                        format!(
                            "connect failed, device is already registered in node-index: {owner}"
                        ),
                    );
                } else if !device.has_valid_id() {
                    info!("[{}] connect failed, invalid device-id", device.id);
                    ret.insert(device.id.clone(), "connect failed, invalid device-id".into());
                } else {
                    accepted.insert(device);
                }
            }
            if node_index == cluster.node_index() {
                if !accepted.is_empty() {
                    ret.extend(self.connect_all(accepted).await);
                }
            } else if !accepted.is_empty() {
                let name = format!("connect all to node-index: {node_index}");
                let result = cluster
                    .to_index(node_index, &name, |url| {
                        let accepted = accepted.clone();
                        async move {
                            self.peer_post::<HashMap<String, String>, _>(
                                &url,
                                "/connect-all-to-index",
                                &accepted,
                            )
                            .await
                        }
                    })
                    .await;
                match result {
                    Ok(map) => ret.extend(map),
                    Err(e) => {
                        for device in &accepted {
                            ret.insert(device.id.clone(), e.to_string());
                        }
                    }
                }
            }
            ret
        } else {
            let name = format!("connect all to leader for node-index: {node_index}");
            let result = cluster
                .to_leader(&name, |url| {
                    let devices = devices.clone();
                    async move {
                        self.peer_post::<HashMap<String, String>, _>(
                            &url,
                            &format!("/connect-all-to-leader/{node_index}"),
                            &devices,
                        )
                        .await
                    }
                })
                .await;
            match result {
                Ok(map) => map,
                Err(e) => devices
                    .into_iter()
                    .map(|d| (d.id, e.to_string()))
                    .collect(),
            }
        }
    }

    /// Build and connect a validated device set on this node.
    pub async fn connect_all(self: &Arc<Self>, devices: HashSet<Device>) -> HashMap<String, String> {
        info!(
            "try to connect all: {}",
            join_ids(devices.iter().map(|d| d.id.as_str()))
        );
        let Ok(_guard) = self.register_lock.try_lock() else {
            info!("add devices failed, device registering process is busy");
            return devices
                .into_iter()
                .map(|d| (d.id, "connect failed, device registering process is busy".into()))
                .collect();
        };

        let mut ret = HashMap::new();
        let mut protocols = Vec::new();
        for device in devices {
            match DeviceProtocol::build(self.clone(), device.clone()) {
                Ok(protocol) => protocols.push(protocol),
                Err(e) => {
                    error!("[{}] connect failed: {}", device.id, e);
                    ret.insert(device.id, format!("connect failed::{e}"));
                }
            }
        }

        // register the accepted set in the shared object before connecting
        let mut tree = Tree::new();
        for protocol in &protocols {
            match serde_json::to_value(&protocol.device) {
                Ok(value) => {
                    tree.insert(protocol.device_id.clone(), value);
                }
                Err(e) => {
                    error!("add devices failed, while parsing: {}", e);
                    ret.insert(
                        protocol.device_id.clone(),
                        "connect failed, while parsing".into(),
                    );
                }
            }
        }
        let registered: Vec<Arc<DeviceProtocol>> = protocols
            .into_iter()
            .filter(|p| !ret.contains_key(&p.device_id))
            .collect();
        if !tree.is_empty() {
            self.cluster().merge_shared_object(tree).await;
        }

        let results = join_all(registered.into_iter().map(|protocol| {
            let service = self.clone();
            async move {
                let id = protocol.device_id.clone();
                (id, service.connect(protocol).await)
            }
        }))
        .await;
        ret.extend(results);
        ret
    }

    async fn connect(self: &Arc<Self>, protocol: Arc<DeviceProtocol>) -> String {
        trace!("[{}] try to connect...", protocol.device_id);
        self.protocols
            .insert(protocol.device_id.clone(), protocol.clone());
        let result = protocol.change_status(StatusCode::Connecting).await;
        fire_device_events(&self.events.device_added, &protocol.device, "device added");
        match result {
            Ok(()) => "connected".into(),
            Err(e) => e.to_string(),
        }
    }

    /// Spread devices across the cluster keyed on current owned counts;
    /// devices sharing a group stay together.
    pub async fn balanced_connect_all(
        self: &Arc<Self>,
        devices: HashSet<Device>,
    ) -> HashMap<String, String> {
        if devices.is_empty() {
            return HashMap::new();
        }
        info!(
            "try to balanced connect all: {}",
            join_ids(devices.iter().map(|d| d.id.as_str()))
        );
        let cluster = self.cluster();
        let nodes = cluster.cluster();
        if !self.load_balancing || nodes.len() < 2 {
            return self
                .connect_all_to_leader(cluster.node_index(), devices)
                .await;
        }

        let mut grouped: HashMap<String, HashSet<Device>> = HashMap::new();
        let mut singles = HashSet::new();
        for device in devices {
            if device.group.is_empty() {
                singles.insert(device);
            } else {
                grouped.entry(device.group.clone()).or_default().insert(device);
            }
        }

        let id_map = self.device_id_map();
        // min-heap on (owned count, node index)
        let mut heap: BinaryHeap<std::cmp::Reverse<(usize, u32)>> = nodes
            .iter()
            .map(|&node| {
                std::cmp::Reverse((id_map.get(&node).map(|s| s.len()).unwrap_or(0), node))
            })
            .collect();

        let mut divided: HashMap<u32, HashSet<Device>> =
            nodes.into_iter().map(|n| (n, HashSet::new())).collect();

        let mut group_names: Vec<&String> = grouped.keys().collect();
        group_names.sort();
        for name in group_names {
            let group = &grouped[name];
            if let Some(std::cmp::Reverse((size, node))) = heap.pop() {
                heap.push(std::cmp::Reverse((size + group.len(), node)));
                if let Some(set) = divided.get_mut(&node) {
                    set.extend(group.iter().cloned());
                }
            }
        }
        for device in singles {
            if let Some(std::cmp::Reverse((size, node))) = heap.pop() {
                heap.push(std::cmp::Reverse((size + 1, node)));
                if let Some(set) = divided.get_mut(&node) {
                    set.insert(device);
                }
            }
        }

        debug!(
            "divided list: {:?}",
            divided
                .iter()
                .map(|(n, set)| (*n, set.iter().map(|d| d.id.clone()).collect::<Vec<_>>()))
                .collect::<HashMap<_, _>>()
        );

        let results = join_all(divided.into_iter().filter(|(_, set)| !set.is_empty()).map(
            |(node, set)| {
                let service = self.clone();
                async move { service.connect_all_to_leader(node, set).await }
            },
        ))
        .await;
        results.into_iter().flatten().collect()
    }

    // ------------------------------------------------------------------
    // Disconnect paths
    // ------------------------------------------------------------------

    async fn disconnect(self: &Arc<Self>, device_id: &str) -> String {
        trace!("[{}] try to disconnect...", device_id);
        let Some(protocol) = self.protocols.get(device_id).map(|e| e.value().clone()) else {
            info!("[{}] disconnect failed, device is not registered", device_id);
            return "disconnect failed, device is not registered".into();
        };
        match protocol.change_status(StatusCode::Disconnected).await {
            Ok(()) => {
                fire_device_events(
                    &self.events.device_deleted,
                    &protocol.device,
                    "device deleted",
                );
                self.response_map.remove(device_id);
                self.protocols.remove(device_id);
                "disconnected".into()
            }
            Err(e) => e.to_string(),
        }
    }

    /// Disconnect a set of ids wherever they are owned; locally detached
    /// ids are pruned from the shared object afterwards. Returns `None`
    /// when `try_lock` is set and a registration pass is running.
    pub async fn disconnect_list(
        self: &Arc<Self>,
        device_ids: Vec<String>,
        try_lock: bool,
    ) -> Option<HashMap<String, String>> {
        info!("[{}] try to disconnect list", device_ids.join(","));
        let _guard = if try_lock {
            match self.register_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    info!(
                        "[{}] disconnect failed, device registering process is busy",
                        device_ids.join(",")
                    );
                    return None;
                }
            }
        } else {
            self.register_lock.lock().await
        };

        let cluster = self.cluster();
        let id_map = self.device_id_map();
        let mut local = Vec::new();
        let mut remote: Vec<(u32, Vec<String>)> = Vec::new();
        for (node, owned) in &id_map {
            let list: Vec<String> = device_ids
                .iter()
                .filter(|id| owned.contains(*id))
                .cloned()
                .collect();
            if list.is_empty() {
                continue;
            }
            if *node == cluster.node_index() {
                local.extend(list);
            } else {
                remote.push((*node, list));
            }
        }

        let mut ret = HashMap::new();
        let local_results = join_all(local.into_iter().map(|id| {
            let service = self.clone();
            async move {
                let result = service.disconnect(&id).await;
                (id, result)
            }
        }))
        .await;
        ret.extend(local_results);

        let remote_results = join_all(remote.into_iter().map(|(node, ids)| {
            let service = self.clone();
            let cluster = cluster.clone();
            async move {
                let name = format!("disconnect to node-index: {node}");
                let result = cluster
                    .to_index(node, &name, |url| {
                        let ids = ids.clone();
                        let service = service.clone();
                        async move {
                            service
                                .peer_delete::<HashMap<String, String>, _>(&url, "/disconnect", &ids)
                                .await
                        }
                    })
                    .await;
                match result {
                    Ok(map) => map,
                    Err(e) => ids.iter().map(|id| (id.clone(), e.to_string())).collect(),
                }
            }
        }))
        .await;
        for map in remote_results {
            ret.extend(map);
        }

        self.delete_devices(ret.keys().cloned().collect()).await;
        Some(ret)
    }

    pub async fn disconnect_all(self: &Arc<Self>, try_lock: bool) -> Option<HashMap<String, String>> {
        info!("try to disconnect all");
        let ids: Vec<String> = self.protocols.iter().map(|e| e.key().clone()).collect();
        self.disconnect_list(ids, try_lock).await
    }

    /// Disconnect every local device and re-place the same set through the
    /// balancer.
    pub async fn reconnect_all(self: &Arc<Self>) -> HashMap<String, String> {
        info!("try to reconnect all");
        let devices = self.registered_devices();
        let mut ret = self.disconnect_all(false).await.unwrap_or_default();
        ret.extend(self.balanced_connect_all(devices).await);
        ret
    }

    /// Prune ids that are no longer locally driven from this node's shared
    /// subtree.
    async fn delete_devices(&self, device_ids: Vec<String>) {
        let cluster = self.cluster();
        let own = cluster.own_shared_object();
        let paths: Vec<Vec<String>> = device_ids
            .into_iter()
            .filter(|id| !self.protocols.contains_key(id) && own.contains_key(id))
            .map(|id| vec![id])
            .collect();
        if !paths.is_empty() {
            cluster.delete_shared_object(paths).await;
        }
    }

    /// Drain every device on shutdown, retrying until the map is empty.
    pub async fn dispose(self: &Arc<Self>) {
        let _guard = self.register_lock.lock().await;
        while !self.protocols.is_empty() {
            let ids: Vec<String> = self.protocols.iter().map(|e| e.key().clone()).collect();
            join_all(ids.into_iter().map(|id| {
                let service = self.clone();
                async move { service.disconnect(&id).await }
            }))
            .await;
            if !self.protocols.is_empty() {
                tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Command execution
    // ------------------------------------------------------------------

    pub async fn execute_command_ids(
        &self,
        device_id: &str,
        command_ids: Vec<String>,
        initial_value: Option<String>,
        emit_responses: bool,
    ) -> Result<Vec<Response>> {
        let function = if emit_responses { "execute" } else { "request" };
        info!(
            "[{}] try to {} command-ids({:?})",
            device_id, function, command_ids
        );
        let Some(protocol) = self.protocols.get(device_id).map(|e| e.value().clone()) else {
            let msg =
                format!("[{device_id}] {function} command-ids({command_ids:?}) failed, device id not found");
            error!("{}", msg);
            return Err(GatewayError::Validation(msg));
        };
        protocol
            .runtime()
            .locked_execute_ids(&protocol, &command_ids, initial_value.as_deref(), emit_responses)
            .await
            .map_err(|e| {
                GatewayError::Validation(format!(
                    "[{device_id}] {function} command-ids({command_ids:?}) failed::{e}"
                ))
            })
    }

    pub async fn execute_commands(
        &self,
        device_id: &str,
        commands: HashSet<Command>,
        initial_value: Option<String>,
        emit_responses: bool,
    ) -> Result<Vec<Response>> {
        let function = if emit_responses { "execute" } else { "request" };
        info!(
            "[{}] try to {} commands({})",
            device_id,
            function,
            join_ids(commands.iter().map(|c| c.id.as_str()))
        );
        let Some(protocol) = self.protocols.get(device_id).map(|e| e.value().clone()) else {
            let msg = format!("[{device_id}] {function} commands failed, device id not found");
            error!("{}", msg);
            return Err(GatewayError::Validation(msg));
        };
        protocol
            .runtime()
            .locked_execute_commands(
                &protocol,
                commands.into_iter().collect(),
                initial_value.as_deref(),
                emit_responses,
            )
            .await
            .map_err(|e| {
                GatewayError::Validation(format!("[{device_id}] {function} commands failed::{e}"))
            })
    }

    /// Run a command batch on a detached task so an aborted HTTP request
    /// cannot interrupt the per-device command lock mid-batch.
    pub async fn execute_command_ids_detached(
        self: &Arc<Self>,
        device_id: String,
        command_ids: Vec<String>,
        initial_value: Option<String>,
        emit_responses: bool,
    ) -> Result<Vec<Response>> {
        let service = self.clone();
        tokio::spawn(async move {
            service
                .execute_command_ids(&device_id, command_ids, initial_value, emit_responses)
                .await
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("command execution task failed: {e}")))?
    }

    pub async fn execute_commands_detached(
        self: &Arc<Self>,
        device_id: String,
        commands: HashSet<Command>,
        initial_value: Option<String>,
        emit_responses: bool,
    ) -> Result<Vec<Response>> {
        let service = self.clone();
        tokio::spawn(async move {
            service
                .execute_commands(&device_id, commands, initial_value, emit_responses)
                .await
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("command execution task failed: {e}")))?
    }

    // ------------------------------------------------------------------
    // Cluster event wiring
    // ------------------------------------------------------------------

    /// The cluster-event handlers that keep device ownership coherent.
    pub fn cluster_events(self: &Arc<Self>) -> ClusterEvents {
        let mut events = ClusterEvents::new();

        let service = self.clone();
        events = events.inactivated(
            "disconnect-all",
            Arc::new(move || {
                let service = service.clone();
                Box::pin(async move {
                    info!("node inactivated, disconnect all");
                    service.disconnect_all(false).await;
                    Ok(())
                })
            }),
        );

        let service = self.clone();
        let deleted: NodeTreeFn = Arc::new(move |node_index, tree| {
            let service = service.clone();
            Box::pin(async move {
                info!(
                    "node(node-index={}) deleted, connect all deleted node devices",
                    node_index
                );
                let mut devices = HashSet::new();
                for value in tree.values() {
                    match serde_json::from_value::<Device>(value.clone()) {
                        Ok(device) => {
                            devices.insert(device);
                        }
                        Err(e) => error!("decode orphaned device failed: {}", e),
                    }
                }
                service.balanced_connect_all(devices).await;
                Ok(())
            })
        });
        events = events.cluster_deleted("connect-all for deleted node", deleted);

        let service = self.clone();
        events = events.overwritten(
            "disconnect duplicated devices",
            Arc::new(move |_node_index| {
                let service = service.clone();
                Box::pin(async move {
                    let id_map = service.device_id_map();
                    let own_index = service.cluster().node_index();
                    let Some(mine) = id_map.get(&own_index).cloned() else {
                        return Ok(());
                    };
                    for (node, owned) in &id_map {
                        if *node >= own_index {
                            continue;
                        }
                        let duplicated: Vec<String> =
                            mine.intersection(owned).cloned().collect();
                        if !duplicated.is_empty() {
                            service.disconnect_list(duplicated, false).await;
                        }
                    }
                    Ok(())
                })
            }),
        );

        if self.reconnect_when_split_brain_resolved {
            let service = self.clone();
            events = events.split_brain_resolved(
                "reconnect-all",
                Arc::new(move || {
                    let service = service.clone();
                    Box::pin(async move {
                        service.reconnect_all().await;
                        Ok(())
                    })
                }),
            );
        }
        events
    }

    // ------------------------------------------------------------------
    // Peer driver RPC
    // ------------------------------------------------------------------

    async fn peer_post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let full = format!("{}{}{}", url.trim_end_matches('/'), self.base_path, path);
        let resp = self
            .cluster()
            .client
            .http()
            .post(&full)
            .json(body)
            .send()
            .await?;
        Self::decode_peer_response(resp).await
    }

    async fn peer_delete<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let full = format!("{}{}{}", url.trim_end_matches('/'), self.base_path, path);
        let resp = self
            .cluster()
            .client
            .http()
            .delete(&full)
            .json(body)
            .send()
            .await?;
        Self::decode_peer_response(resp).await
    }

    async fn decode_peer_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp.json().await?)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(GatewayError::Cluster(if body.is_empty() {
                format!("peer answered {status}")
            } else {
                body
            }))
        }
    }
}
