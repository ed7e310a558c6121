//! Cluster membership, leader election state, heartbeats and shared-state
//! replication.
//!
//! One [`ClusterService`] exists per process. Peers talk to it through the
//! HTTP routes in [`crate::cluster::routes`]; the driver plane talks to it
//! directly. Redirect primitives (`to_leader` / `to_index` / `to_all`) live
//! in [`crate::cluster::redirect`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::cluster::client::ClusterClient;
use crate::cluster::config::ClusterConfig;
use crate::cluster::shared::{
    deep_merge, delete_path, get_path, tree_from_path, DeleteInfo, MergeInfo, SharedSnapshot,
    SharedWrite, Tree,
};
use crate::core::data::{now_millis, Role};
use crate::core::error::{GatewayError, Result};
use crate::core::events::{
    fire_actions, fire_node_events, fire_node_tree_events, ClusterEvents,
};
use crate::core::tasks::TaskSet;

/// Shared-object tables guarded together so sequence numbers can never
/// drift from the trees they describe.
#[derive(Default)]
pub(crate) struct SharedTables {
    pub obj: HashMap<u32, Tree>,
    pub seq: HashMap<u32, u64>,
}

impl SharedTables {
    fn ensure(&mut self, node_index: u32) {
        self.obj.entry(node_index).or_default();
        self.seq.entry(node_index).or_insert(0);
    }

    fn apply(&mut self, node_index: u32, write: &SharedWrite) {
        self.ensure(node_index);
        match write {
            SharedWrite::Merge(info) => {
                let tree = self.obj.get_mut(&node_index).unwrap();
                deep_merge(tree, &info.obj);
            }
            SharedWrite::Delete(info) => {
                let tree = self.obj.get_mut(&node_index).unwrap();
                for path in &info.paths {
                    delete_path(tree, path);
                }
            }
        }
    }
}

/// Liveness watchdog of one peer.
struct NodeTimer {
    notify: Arc<Notify>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

/// The per-process cluster coordination service.
pub struct ClusterService {
    pub(crate) config: ClusterConfig,
    node_url: String,
    pub(crate) peer_urls: StdRwLock<HashSet<String>>,
    pub(crate) client: ClusterClient,
    events: ClusterEvents,

    role: StdRwLock<Option<Role>>,
    activated: AtomicBool,
    prepared: AtomicBool,
    /// Cleared by the first heartbeat observed from a LEADER; while set,
    /// node 1 may self-promote after the prepare window.
    initial_role: AtomicBool,
    last_transition: AtomicI64,
    max_cluster_size: AtomicU32,

    pub(crate) shared: StdMutex<SharedTables>,

    nodes: DashMap<u32, Arc<NodeTimer>>,
    leader_notify: Arc<Notify>,

    transition_lock: Mutex<()>,
    pub(crate) elect_lock: Mutex<()>,
    set_shared_lock: Mutex<()>,
    heartbeat_lock: Mutex<()>,
    sync_lock: Mutex<()>,

    /// Role-scoped background tasks, cleared on every transition.
    subscriptions: TaskSet,
    /// Process-scoped tasks (heartbeat ticker).
    background: TaskSet,
}

impl ClusterService {
    pub(crate) fn new(
        config: ClusterConfig,
        node_url: String,
        peer_urls: HashSet<String>,
        client: ClusterClient,
        events: ClusterEvents,
    ) -> Self {
        Self {
            config,
            node_url,
            peer_urls: StdRwLock::new(peer_urls),
            client,
            events,
            role: StdRwLock::new(None),
            activated: AtomicBool::new(false),
            prepared: AtomicBool::new(false),
            initial_role: AtomicBool::new(true),
            last_transition: AtomicI64::new(now_millis()),
            max_cluster_size: AtomicU32::new(0),
            shared: StdMutex::new(SharedTables::default()),
            nodes: DashMap::new(),
            leader_notify: Arc::new(Notify::new()),
            transition_lock: Mutex::new(()),
            elect_lock: Mutex::new(()),
            set_shared_lock: Mutex::new(()),
            heartbeat_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
            subscriptions: TaskSet::new(),
            background: TaskSet::new(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn node_index(&self) -> u32 {
        self.config.node_index
    }

    pub fn node_url(&self) -> &str {
        &self.node_url
    }

    pub fn role(&self) -> Option<Role> {
        *self.role.read().unwrap()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Some(Role::Leader)
    }

    pub fn activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    pub fn prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn last_transition(&self) -> i64 {
        self.last_transition.load(Ordering::SeqCst)
    }

    /// Node indexes currently considered alive, including this node.
    pub fn cluster(&self) -> HashSet<u32> {
        self.nodes.iter().map(|e| *e.key()).collect()
    }

    pub fn peer_url_list(&self) -> Vec<String> {
        self.peer_urls.read().unwrap().iter().cloned().collect()
    }

    /// Register another peer URL at runtime. False when already known.
    pub fn add_peer_url(&self, url: String) -> bool {
        if url == self.node_url {
            return false;
        }
        self.peer_urls.write().unwrap().insert(url)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Prepare and enter the cluster: wait out the prepare window so an
    /// existing leader can assert itself, take the initial role, then start
    /// heartbeating.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.ensure(self.config.node_index);
        }
        let delay = self.config.prepare_delay();
        info!(
            "cluster application preparing for {:.1}[sec]",
            delay.as_secs_f64()
        );
        tokio::time::sleep(delay).await;

        if self.config.node_index == 1 && self.initial_role.load(Ordering::SeqCst) {
            self.transition(Role::Leader).await;
        } else {
            self.transition(Role::Follower).await;
        }

        // self occupies a slot in the cluster view
        self.nodes.insert(
            self.config.node_index,
            Arc::new(NodeTimer {
                notify: Arc::new(Notify::new()),
                task: StdMutex::new(None),
            }),
        );

        let service = self.clone();
        let interval = self.config.heartbeat_interval();
        self.background.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.heartbeat_tick().await;
            }
        });
        self.verify_activation();

        self.prepared.store(true, Ordering::SeqCst);
        info!("cluster application prepared");
    }

    /// Stop timers and drop replicated state.
    pub fn dispose(&self) {
        self.initial_role.store(true, Ordering::SeqCst);
        self.subscriptions.clear();
        self.background.clear();
        for entry in self.nodes.iter() {
            if let Some(task) = entry.value().task.lock().unwrap().take() {
                task.abort();
            }
        }
        self.nodes.clear();
        let mut shared = self.shared.lock().unwrap();
        shared.obj.clear();
        shared.seq.clear();
    }

    pub async fn force_to_leader(self: &Arc<Self>) -> Result<()> {
        if self.prepared() {
            self.transition(Role::Leader).await;
            Ok(())
        } else {
            error!("application is not prepared, force to leader ignored");
            Err(GatewayError::Cluster("application is not prepared".into()))
        }
    }

    pub async fn force_to_follower(self: &Arc<Self>) -> Result<()> {
        if self.prepared() {
            self.transition(Role::Follower).await;
            Ok(())
        } else {
            error!("application is not prepared, force to follower ignored");
            Err(GatewayError::Cluster("application is not prepared".into()))
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    async fn heartbeat_tick(self: &Arc<Self>) {
        let role = self.role();
        info!(
            "role: {} (last transition time: {})",
            role.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            self.last_transition()
        );
        let service = self.clone();
        tokio::spawn(async move {
            let begin = std::time::Instant::now();
            match role {
                Some(Role::Leader) => {
                    let _hb = service.heartbeat_lock.lock().await;
                    service.send_heartbeat(Role::Leader).await;
                }
                Some(r) => service.send_heartbeat(r).await,
                None => {}
            }
            trace!(
                "send heartbeat finished, elapsed time: {}[ms]",
                begin.elapsed().as_millis()
            );
        });
    }

    pub(crate) async fn send_heartbeat(&self, role: Role) {
        let seq_map = self.shared_seq_map();
        let node_index = self.config.node_index;
        let last_transition = self.last_transition();
        self.to_all("send heartbeat", |url| {
            let seq_map = seq_map.clone();
            async move {
                self.client
                    .heartbeat(&url, node_index, role, last_transition, &seq_map)
                    .await
            }
        })
        .await;
    }

    /// Handle a peer heartbeat.
    pub async fn heartbeat_received(
        self: &Arc<Self>,
        from_index: u32,
        from_role: Role,
        _last_transition: i64,
        their_seq: HashMap<u32, u64>,
    ) {
        if from_role == Role::Leader {
            self.initial_role.store(false, Ordering::SeqCst);
        }

        if self.is_leader() && from_role == Role::Leader && from_index != self.config.node_index {
            error!("unexpected heartbeat received from leader, set to follower");
            self.transition(Role::Follower).await;

            {
                // this node just demoted itself, so the winning leader is
                // always a peer here
                let _sync = self.sync_lock.lock().await;
                let snapshot = self.snapshot();
                let node_index = self.config.node_index;
                self.to_leader_confirmed("synchronize split brain leader shared object", |url| {
                    let snapshot = snapshot.clone();
                    async move {
                        self.client
                            .sync_shared_object(&url, node_index, &snapshot)
                            .await
                    }
                })
                .await;
            }
            fire_actions(&self.events.split_brain_resolved, "split brain resolved");
        }

        if from_role == Role::Leader {
            self.leader_notify.notify_one();
        }

        if let Some(timer) = self.nodes.get(&from_index).map(|e| e.value().clone()) {
            timer.notify.notify_one();
        } else {
            self.cluster_added(from_index);
        }

        if from_role == Role::Leader {
            self.sync_follower_with_leader(&their_seq).await;
        }

        if self.is_leader() {
            let mismatch = {
                let shared = self.shared.lock().unwrap();
                shared.seq.get(&from_index).copied() != their_seq.get(&from_index).copied()
            };
            if mismatch {
                let _sync = self.sync_lock.lock().await;
                if let Err(e) = self.overwrite_leader_shared_object(from_index).await {
                    error!(
                        "get shared object for sync leader from node-index: {} failed: {}",
                        from_index, e
                    );
                }
            }
        }
    }

    /// Follower side of heartbeat reconciliation: pull any subtree whose
    /// leader-advertised sequence differs from the local one.
    async fn sync_follower_with_leader(self: &Arc<Self>, their_seq: &HashMap<u32, u64>) {
        for (&k, &leader_seq) in their_seq {
            if k == self.config.node_index {
                continue;
            }
            let local = {
                let mut shared = self.shared.lock().unwrap();
                shared.ensure(k);
                shared.seq[&k]
            };
            if local == leader_seq {
                trace!("heartbeat shared-object-sequence match for node-index: {}", k);
                continue;
            }
            debug!(
                "heartbeat shared-object-sequence mismatch for node-index: {}, leader: {}, this: {}",
                k, leader_seq, local
            );
            let fetched = self
                .to_leader("get shared object", |url| async move {
                    self.client.get_shared_object(&url, Some(k)).await
                })
                .await;
            match fetched {
                Ok(info) => {
                    trace!("get shared object for sync follower from node-index: {} success", k);
                    self.overwrite_shared_object(k, info);
                }
                Err(e) => {
                    error!(
                        "get shared object for sync follower from node-index: {} failed: {}",
                        k, e
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    /// Flip the role. Concurrent calls collapse on the transition lock; a
    /// no-op when the role already matches.
    pub async fn transition(self: &Arc<Self>, role: Role) {
        let Ok(_guard) = self.transition_lock.try_lock() else {
            debug!("transition to {} ignored, because of already processing", role);
            return;
        };
        let current = self.role();
        if current == Some(role) {
            info!("role is already {}", role);
            return;
        }
        info!(
            "role changed {} => {}",
            current.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            role
        );
        *self.role.write().unwrap() = Some(role);
        self.last_transition.store(now_millis(), Ordering::SeqCst);
        self.subscriptions.clear();

        match role {
            Role::Leader => {
                self.send_heartbeat(Role::Leader).await;
                fire_actions(&self.events.become_leader, "become leader");
            }
            Role::Follower => {
                fire_actions(&self.events.become_follower, "become follower");

                let service = self.clone();
                let notify = self.leader_notify.clone();
                let timeout = self.config.leader_lost_timeout();
                self.subscriptions.spawn(async move {
                    loop {
                        match tokio::time::timeout(timeout, notify.notified()).await {
                            Ok(()) => trace!("heartbeat received from leader"),
                            Err(_) => {
                                error!(
                                    "no heartbeat from leader for {}[sec], start to elect leader",
                                    timeout.as_secs()
                                );
                                service.elect_leader().await;
                            }
                        }
                    }
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Cluster view
    // ------------------------------------------------------------------

    fn cluster_added(self: &Arc<Self>, node_index: u32) {
        use dashmap::mapref::entry::Entry;
        let notify = Arc::new(Notify::new());
        let timer = Arc::new(NodeTimer {
            notify: notify.clone(),
            task: StdMutex::new(None),
        });
        match self.nodes.entry(node_index) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(timer.clone());
            }
        }
        info!("cluster node added, nodeIndex: {}", node_index);

        fire_node_events(&self.events.cluster_added, node_index, "cluster added");
        self.verify_activation();

        let service = self.clone();
        let timeout = self.config.leader_lost_timeout();
        let handle = tokio::spawn(async move {
            loop {
                match tokio::time::timeout(timeout, notify.notified()).await {
                    Ok(()) => {
                        trace!("heartbeat received from node-index: {}", node_index)
                    }
                    Err(_) => {
                        service.cluster_deleted(node_index).await;
                        break;
                    }
                }
            }
        });
        *timer.task.lock().unwrap() = Some(handle);
    }

    /// Drop a peer from the cluster view; the leader prunes its shared
    /// subtree cluster-wide.
    pub async fn cluster_deleted(self: &Arc<Self>, node_index: u32) {
        let Some((_, timer)) = self.nodes.remove(&node_index) else {
            trace!("node-index: {}, already deleted", node_index);
            return;
        };
        if let Some(task) = timer.task.lock().unwrap().take() {
            task.abort();
        }
        info!("cluster node removed, nodeIndex: {}", node_index);
        self.to_leader_confirmed("remove shared object", |url| async move {
            if url == self.node_url {
                self.remove_shared_object(node_index).await;
                Ok(())
            } else {
                self.client.remove_shared_object(&url, node_index).await
            }
        })
        .await;
        self.shared.lock().unwrap().obj.remove(&node_index);
        self.verify_activation();
    }

    /// Leader-side removal of a dead node's subtree: prune locally, tell
    /// every peer, hand the orphaned tree to the cluster-deleted handlers.
    pub async fn remove_shared_object(self: &Arc<Self>, node_index: u32) {
        let removed = {
            let mut shared = self.shared.lock().unwrap();
            let removed = shared.obj.remove(&node_index);
            if removed.is_some() {
                shared.seq.remove(&node_index);
            }
            removed
        };
        let Some(removed) = removed else {
            return;
        };
        debug!("node-index: {}, removed shared object process", node_index);
        self.to_all("cluster deleted", |url| async move {
            self.client.cluster_deleted(&url, node_index).await
        })
        .await;
        fire_node_tree_events(
            &self.events.cluster_deleted,
            node_index,
            &removed,
            "cluster deleted",
        );
    }

    fn verify_activation(&self) {
        let size = self.nodes.len() as u32;
        let max = self
            .max_cluster_size
            .fetch_max(size, Ordering::SeqCst)
            .max(size);
        let quorum = if self.config.quorum > 0 {
            self.config.quorum
        } else {
            max / 2 + 1
        };
        trace!("current quorum: {}", quorum);

        if size < quorum && self.activated.swap(false, Ordering::SeqCst) {
            info!("application inactivated");
            fire_actions(&self.events.inactivated, "inactivated");
        } else if size >= quorum && !self.activated.swap(true, Ordering::SeqCst) {
            info!("application activated");
            fire_actions(&self.events.activated, "activated");
        }
    }

    // ------------------------------------------------------------------
    // Shared object: peer-facing handlers
    // ------------------------------------------------------------------

    /// Leader-side write application and propagation round.
    pub async fn set_shared_object_to_leader(
        self: &Arc<Self>,
        sender: u32,
        write: SharedWrite,
    ) -> Result<()> {
        let _sync = self.sync_lock.lock().await;
        if !self.is_leader() {
            error!(
                "set shared object to leader ignored, role is not leader, sender-node-index: {}",
                sender
            );
            return Err(GatewayError::Cluster(
                "set shared object to leader ignored, role is not leader".into(),
            ));
        }
        trace!("set shared object to leader, sender-node-index: {}", sender);

        if sender != self.config.node_index {
            let local_seq = {
                let mut shared = self.shared.lock().unwrap();
                shared.ensure(sender);
                shared.seq[&sender]
            };
            if local_seq != write.seq() {
                trace!(
                    "set shared object to leader, sequence mismatch for node-index: {}, leader: {}, sender: {}",
                    sender, local_seq, write.seq()
                );
                self.overwrite_leader_shared_object(sender).await?;
            } else {
                self.shared.lock().unwrap().apply(sender, &write);
            }
        }

        {
            let _hb = self.heartbeat_lock.lock().await;
            trace!("propagate shared object for node-index: {}", sender);
            let results = match &write {
                SharedWrite::Merge(info) => {
                    self.to_all_collect(|url| {
                        let info = info.clone();
                        async move {
                            self.client
                                .check_merge_shared_object(&url, sender, &info)
                                .await
                        }
                    })
                    .await
                }
                SharedWrite::Delete(info) => {
                    self.to_all_collect(|url| {
                        let info = info.clone();
                        async move {
                            self.client
                                .check_delete_shared_object(&url, sender, &info)
                                .await
                        }
                    })
                    .await
                }
            };

            let need_sync: Vec<String> = results
                .into_iter()
                .filter_map(|(url, res)| match res {
                    Ok(false) => Some(url),
                    Ok(true) => None,
                    Err(e) => {
                        error!("check shared object (url={}) failed: {}", url, e);
                        None
                    }
                })
                .collect();

            let overwrite = {
                let shared = self.shared.lock().unwrap();
                MergeInfo {
                    seq: shared.seq.get(&sender).copied().unwrap_or(0) + 1,
                    obj: shared.obj.get(&sender).cloned().unwrap_or_default(),
                }
            };
            let futs = need_sync.into_iter().map(|url| {
                let overwrite = overwrite.clone();
                async move {
                    if let Err(e) = self
                        .client
                        .overwrite_shared_object(&url, sender, &overwrite)
                        .await
                    {
                        error!("overwrite shared object (url={}) failed: {}", url, e);
                    }
                }
            });
            futures::future::join_all(futs).await;

            if sender != self.config.node_index {
                let mut shared = self.shared.lock().unwrap();
                let slot = shared.seq.entry(sender).or_insert(0);
                *slot += 1;
            }
        }
        Ok(())
    }

    /// Pull `node_index`'s current subtree from its owner (leader resync).
    async fn overwrite_leader_shared_object(self: &Arc<Self>, node_index: u32) -> Result<()> {
        debug!("overwrite leader shared object for node-index: {}", node_index);
        let info = self
            .to_index(node_index, "get shared object", |url| async move {
                self.client.get_shared_object(&url, None).await
            })
            .await?;
        trace!("get shared object for sync leader from node-index: {} success", node_index);
        self.overwrite_shared_object(node_index, info);
        Ok(())
    }

    /// Replace a node's subtree wholesale.
    pub fn overwrite_shared_object(&self, node_index: u32, info: MergeInfo) {
        trace!(
            "overwrite shared object, node-index: {}, seq: {}",
            node_index, info.seq
        );
        {
            let mut shared = self.shared.lock().unwrap();
            shared.obj.insert(node_index, info.obj);
            shared.seq.insert(node_index, info.seq);
        }
        fire_node_events(&self.events.overwritten, node_index, "overwritten");
    }

    /// Peer-side acceptance of a propagated write: apply iff the sequence
    /// matches, bumping it on success.
    pub fn check_shared_object(&self, sender: u32, write: SharedWrite) -> bool {
        let mut shared = self.shared.lock().unwrap();
        shared.ensure(sender);
        let local = shared.seq[&sender];
        if local == write.seq() {
            trace!("received shared-object-sequence match for node-index: {}", sender);
            shared.apply(sender, &write);
            *shared.seq.get_mut(&sender).unwrap() += 1;
            true
        } else {
            trace!(
                "check shared object sequence mismatch for node-index: {}, leader: {}, this: {}",
                sender, write.seq(), local
            );
            false
        }
    }

    /// Split-brain reconciliation on the winning side: adopt unknown
    /// subtrees, then push every divergent subtree to the peers that report
    /// a different sequence.
    pub async fn sync_shared_object(self: &Arc<Self>, snapshot: SharedSnapshot) {
        trace!("synchronize split brain nodes start");
        let _sync = self.sync_lock.lock().await;
        {
            let mut shared = self.shared.lock().unwrap();
            for (k, tree) in snapshot.shared_object {
                shared.obj.entry(k).or_insert(tree);
            }
            for (k, seq) in snapshot.shared_object_seq {
                shared.seq.entry(k).or_insert(seq);
            }
        }
        let seq_map = self.shared_seq_map();
        let results = self
            .to_all_collect(|url| {
                let seq_map = seq_map.clone();
                async move { self.client.check_shared_object_seq(&url, &seq_map).await }
            })
            .await;

        let mut sync_list: Vec<(String, u32)> = Vec::new();
        for (url, res) in results {
            match res {
                Ok(mismatched) => {
                    sync_list.extend(mismatched.into_iter().map(|k| (url.clone(), k)))
                }
                Err(e) => error!("check shared-object-sequence (url={}) failed: {}", url, e),
            }
        }
        let futs = sync_list.into_iter().map(|(url, k)| {
            let info = {
                let shared = self.shared.lock().unwrap();
                MergeInfo {
                    seq: shared.seq.get(&k).copied().unwrap_or(0),
                    obj: shared.obj.get(&k).cloned().unwrap_or_default(),
                }
            };
            async move {
                if let Err(e) = self.client.overwrite_shared_object(&url, k, &info).await {
                    error!("overwrite shared object (url={}) failed: {}", url, e);
                }
            }
        });
        futures::future::join_all(futs).await;
        trace!("synchronize split brain nodes end");
    }

    /// Node indexes whose local sequence differs from `seq_map` (self
    /// excluded).
    pub fn check_shared_object_seq(&self, seq_map: &HashMap<u32, u64>) -> HashSet<u32> {
        let shared = self.shared.lock().unwrap();
        seq_map
            .iter()
            .filter(|(&k, &seq)| {
                k != self.config.node_index && shared.seq.get(&k).copied() != Some(seq)
            })
            .map(|(&k, _)| k)
            .collect()
    }

    // ------------------------------------------------------------------
    // Shared object: owner-side writes
    // ------------------------------------------------------------------

    /// Merge a delta into this node's own subtree and propagate it through
    /// the leader (confirmed).
    pub async fn merge_shared_object(self: &Arc<Self>, obj: Tree) {
        if obj.is_empty() {
            trace!("merge shared object finished, empty delta");
            return;
        }
        let _set = self.set_shared_lock.lock().await;
        let info = {
            let mut shared = self.shared.lock().unwrap();
            let node_index = self.config.node_index;
            shared.ensure(node_index);
            let tree = shared.obj.get_mut(&node_index).unwrap();
            deep_merge(tree, &obj);
            MergeInfo {
                seq: shared.seq[&node_index],
                obj,
            }
        };
        let node_index = self.config.node_index;
        self.to_leader_confirmed("merge shared object to leader", |url| {
            let info = info.clone();
            async move {
                if url == self.node_url {
                    self.set_shared_object_to_leader(node_index, SharedWrite::Merge(info))
                        .await
                } else {
                    self.client
                        .merge_shared_object_to_leader(&url, node_index, &info)
                        .await
                }
            }
        })
        .await;
        let seq = {
            let mut shared = self.shared.lock().unwrap();
            let slot = shared.seq.entry(node_index).or_insert(0);
            *slot += 1;
            *slot
        };
        debug!("merge shared object finished, shared-object-sequence: {}", seq);
    }

    /// Merge a single value at `path` in this node's subtree.
    pub async fn merge_shared_object_at(self: &Arc<Self>, path: &[String], value: Value) {
        if path.is_empty() {
            trace!("merge shared object finished, empty path");
            return;
        }
        self.merge_shared_object(tree_from_path(path, value)).await;
    }

    /// Delete paths from this node's subtree and propagate (confirmed).
    pub async fn delete_shared_object(self: &Arc<Self>, paths: Vec<Vec<String>>) {
        if paths.is_empty() {
            trace!("delete shared object finished, empty path");
            return;
        }
        let _set = self.set_shared_lock.lock().await;
        let node_index = self.config.node_index;
        let info = {
            let mut shared = self.shared.lock().unwrap();
            shared.ensure(node_index);
            let tree = shared.obj.get_mut(&node_index).unwrap();
            let mut deleted = false;
            for path in &paths {
                if delete_path(tree, path) {
                    deleted = true;
                }
            }
            if !deleted {
                debug!("delete shared object finished, there is no deleted object");
                return;
            }
            DeleteInfo {
                seq: shared.seq[&node_index],
                paths,
            }
        };
        self.to_leader_confirmed("delete shared object to leader", |url| {
            let info = info.clone();
            async move {
                if url == self.node_url {
                    self.set_shared_object_to_leader(node_index, SharedWrite::Delete(info))
                        .await
                } else {
                    self.client
                        .delete_shared_object_to_leader(&url, node_index, &info)
                        .await
                }
            }
        })
        .await;
        let seq = {
            let mut shared = self.shared.lock().unwrap();
            let slot = shared.seq.entry(node_index).or_insert(0);
            *slot += 1;
            *slot
        };
        debug!("delete shared object finished, shared-object-sequence: {}", seq);
    }

    // ------------------------------------------------------------------
    // Shared object: reads
    // ------------------------------------------------------------------

    /// Read a value from any node's subtree; empty path yields the subtree.
    pub fn get_item(&self, node_index: u32, path: &[String]) -> Option<Value> {
        let shared = self.shared.lock().unwrap();
        let tree = shared.obj.get(&node_index)?;
        if path.is_empty() {
            return Some(Value::Object(tree.clone()));
        }
        get_path(tree, path).cloned()
    }

    pub fn shared_object_map(&self) -> HashMap<u32, Tree> {
        self.shared.lock().unwrap().obj.clone()
    }

    pub fn shared_seq_map(&self) -> HashMap<u32, u64> {
        self.shared.lock().unwrap().seq.clone()
    }

    /// This node's own subtree.
    pub fn own_shared_object(&self) -> Tree {
        self.shared
            .lock()
            .unwrap()
            .obj
            .get(&self.config.node_index)
            .cloned()
            .unwrap_or_default()
    }

    /// `{seq, obj}` for a node, defaulting to an empty record.
    pub fn shared_object_info(&self, node_index: u32) -> MergeInfo {
        let shared = self.shared.lock().unwrap();
        MergeInfo {
            seq: shared.seq.get(&node_index).copied().unwrap_or(0),
            obj: shared.obj.get(&node_index).cloned().unwrap_or_default(),
        }
    }

    pub fn snapshot(&self) -> SharedSnapshot {
        let shared = self.shared.lock().unwrap();
        SharedSnapshot {
            shared_object: shared.obj.clone(),
            shared_object_seq: shared.seq.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> Arc<ClusterService> {
        let config = ClusterConfig::new(1, 18080, vec![]);
        let client = ClusterClient::new(
            "/cluster",
            std::time::Duration::from_millis(200),
            std::time::Duration::from_millis(500),
        )
        .unwrap();
        Arc::new(ClusterService::new(
            config,
            "http://127.0.0.1:18080".into(),
            HashSet::new(),
            client,
            ClusterEvents::new(),
        ))
    }

    #[tokio::test]
    async fn test_check_shared_object_sequence_gate() {
        let svc = service();
        let write = |seq| {
            SharedWrite::Merge(MergeInfo {
                seq,
                obj: json!({"devices": {"d1": 1}}).as_object().unwrap().clone(),
            })
        };
        // mismatched sequence is rejected without applying
        assert!(!svc.check_shared_object(7, write(3)));
        assert_eq!(svc.get_item(7, &["devices".into()]), None);

        // matching sequence applies and bumps by exactly one
        assert!(svc.check_shared_object(7, write(0)));
        assert_eq!(svc.shared_seq_map()[&7], 1);
        assert_eq!(
            svc.get_item(7, &["devices".into(), "d1".into()]),
            Some(json!(1))
        );
    }

    #[tokio::test]
    async fn test_check_shared_object_seq_reports_divergence() {
        let svc = service();
        svc.overwrite_shared_object(
            2,
            MergeInfo {
                seq: 4,
                obj: Tree::new(),
            },
        );
        let mut map = HashMap::new();
        map.insert(1u32, 9u64); // self: always skipped
        map.insert(2, 4); // matches
        map.insert(3, 1); // unknown locally
        let diff = svc.check_shared_object_seq(&map);
        assert_eq!(diff, HashSet::from([3]));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_subtree() {
        let svc = service();
        assert!(svc.check_shared_object(
            5,
            SharedWrite::Merge(MergeInfo {
                seq: 0,
                obj: json!({"a": 1, "b": 2}).as_object().unwrap().clone(),
            })
        ));
        svc.overwrite_shared_object(
            5,
            MergeInfo {
                seq: 10,
                obj: json!({"c": 3}).as_object().unwrap().clone(),
            },
        );
        assert_eq!(svc.get_item(5, &["a".into()]), None);
        assert_eq!(svc.get_item(5, &["c".into()]), Some(json!(3)));
        assert_eq!(svc.shared_seq_map()[&5], 10);
    }

    #[tokio::test]
    async fn test_get_item_empty_path_returns_tree() {
        let svc = service();
        assert!(svc.check_shared_object(
            2,
            SharedWrite::Merge(MergeInfo {
                seq: 0,
                obj: json!({"x": {"y": true}}).as_object().unwrap().clone(),
            })
        ));
        let tree = svc.get_item(2, &[]).unwrap();
        assert_eq!(tree, json!({"x": {"y": true}}));
    }

    #[tokio::test]
    async fn test_delete_write_prunes() {
        let svc = service();
        assert!(svc.check_shared_object(
            3,
            SharedWrite::Merge(MergeInfo {
                seq: 0,
                obj: json!({"d": {"data": {"k": 1}}}).as_object().unwrap().clone(),
            })
        ));
        assert!(svc.check_shared_object(
            3,
            SharedWrite::Delete(DeleteInfo {
                seq: 1,
                paths: vec![vec!["d".into(), "data".into(), "k".into()]],
            })
        ));
        assert_eq!(svc.get_item(3, &["d".into()]), None);
        assert_eq!(svc.shared_seq_map()[&3], 2);
    }
}

