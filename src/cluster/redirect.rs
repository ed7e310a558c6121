//! Request routing primitives: to-leader, to-index, to-all, and leader
//! election.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, trace};

use crate::cluster::service::ClusterService;
use crate::core::data::Role;
use crate::core::error::{GatewayError, Result};

impl ClusterService {
    /// Probe all peers in parallel and return the URL of the node that
    /// reports LEADER. Self short-circuits when this node is the leader.
    pub async fn find_leader_url(&self) -> Option<String> {
        if self.is_leader() {
            return Some(self.node_url().to_string());
        }
        let urls = self.peer_url_list();
        let probes = urls.iter().map(|url| async move {
            match self.client.get_node_status(url).await {
                Ok(status) if status.role == Some(Role::Leader) => Some(url.clone()),
                Ok(_) => None,
                Err(e) => {
                    trace!("check status (url={}) failed: {}", url, e);
                    None
                }
            }
        });
        join_all(probes).await.into_iter().flatten().next()
    }

    /// Resolve the URL of the node with `node_index`.
    pub async fn find_index_url(&self, node_index: u32) -> Option<String> {
        if self.node_index() == node_index {
            return Some(self.node_url().to_string());
        }
        let urls = self.peer_url_list();
        let probes = urls.iter().map(|url| async move {
            match self.client.get_node_status(url).await {
                Ok(status) if status.node_index == node_index => Some(url.clone()),
                Ok(_) => None,
                Err(e) => {
                    trace!("check status (url={}) failed: {}", url, e);
                    None
                }
            }
        });
        join_all(probes).await.into_iter().flatten().next()
    }

    /// Invoke `f` against the current leader. When no leader is reachable an
    /// election is triggered and the call retries after one heartbeat
    /// interval; a failed invocation surfaces to the caller.
    pub async fn to_leader<T, F, Fut>(self: &Arc<Self>, name: &str, f: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.to_leader_inner(name, false, f).await
    }

    /// Like [`Self::to_leader`] but retries indefinitely until the current
    /// leader accepts the call.
    pub async fn to_leader_confirmed<T, F, Fut>(self: &Arc<Self>, name: &str, f: F) -> T
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.to_leader_inner(name, true, f).await {
            Ok(v) => v,
            // confirmed execution only returns on success
            Err(_) => unreachable!("confirmed to-leader call returned an error"),
        }
    }

    async fn to_leader_inner<T, F, Fut>(self: &Arc<Self>, name: &str, confirmed: bool, f: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        trace!("execute to-leader-function: {}", name);
        let mut first = true;
        loop {
            if !first {
                tokio::time::sleep(self.config.heartbeat_interval()).await;
            }
            first = false;

            let Some(leader_url) = self.find_leader_url().await else {
                error!(
                    "({}) leader not found, start to elect leader and retry to leader function",
                    name
                );
                self.elect_leader().await;
                continue;
            };
            match f(leader_url.clone()).await {
                Ok(v) => {
                    trace!("execute to-leader-function finished: {}", name);
                    return Ok(v);
                }
                Err(e) => {
                    error!(
                        "({}) execute to-leader-function failed (url={}): {}",
                        name, leader_url, e
                    );
                    if !confirmed {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Invoke `f` against the node with `node_index`.
    pub async fn to_index<T, F, Fut>(&self, node_index: u32, name: &str, f: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        trace!("execute to-index-function: {}, node-index: {}", name, node_index);
        let Some(url) = self.find_index_url(node_index).await else {
            error!(
                "({}) execute to-index-function failed, node-index({}) not found",
                name, node_index
            );
            return Err(GatewayError::Cluster(format!(
                "node-index({node_index}) not found"
            )));
        };
        match f(url.clone()).await {
            Ok(v) => {
                trace!(
                    "execute to-index-function finished: {}, node-index: {}",
                    name, node_index
                );
                Ok(v)
            }
            Err(e) => {
                error!(
                    "({}) execute to-index-function failed (url={}): {}",
                    name, url, e
                );
                Err(e)
            }
        }
    }

    /// Parallel fan-out over every peer URL; per-URL failures are logged
    /// and never fail the caller.
    pub async fn to_all<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        trace!("execute to-all-function: {}", name);
        let urls = self.peer_url_list();
        let calls = urls.into_iter().map(|url| {
            let fut = f(url.clone());
            async move {
                if let Err(e) = fut.await {
                    error!("({}) execute to-all-function failed (url={}): {}", name, url, e);
                }
            }
        });
        join_all(calls).await;
        trace!("execute to-all-function finished: {}", name);
    }

    /// Parallel fan-out collecting each peer's outcome.
    pub async fn to_all_collect<T, F, Fut>(&self, f: F) -> Vec<(String, Result<T>)>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let urls = self.peer_url_list();
        let calls = urls.into_iter().map(|url| {
            let fut = f(url.clone());
            async move { (url, fut.await) }
        });
        join_all(calls).await
    }

    /// Elect a leader: probe everyone, and if no LEADER exists promote the
    /// reachable candidate with the lowest node index. Single-flight per
    /// node via try-lock.
    pub async fn elect_leader(self: &Arc<Self>) {
        trace!("try to elect leader");
        let Ok(_guard) = self.elect_lock.try_lock() else {
            debug!("elect leader ignored, because of already processing");
            return;
        };

        if self.is_leader() {
            return;
        }

        let mut exist_leader = false;
        let mut candidates: BTreeMap<u32, String> = BTreeMap::new();
        candidates.insert(self.node_index(), self.node_url().to_string());

        let urls = self.peer_url_list();
        let probes = urls.iter().map(|url| async move {
            match self.client.get_node_status(url).await {
                Ok(status) => Some((url.clone(), status)),
                Err(e) => {
                    trace!("check status (url={}) failed to elect leader: {}", url, e);
                    None
                }
            }
        });
        for (url, status) in join_all(probes).await.into_iter().flatten() {
            if status.role == Some(Role::Leader) {
                exist_leader = true;
            } else {
                candidates.entry(status.node_index).or_insert(url);
            }
        }
        if exist_leader {
            return;
        }

        // lowest index wins
        for (index, url) in candidates {
            info!("set to leader (index={}, url={})", index, url);
            if index == self.node_index() {
                self.transition(Role::Leader).await;
                break;
            }
            match self.client.set_to_leader(&url).await {
                Ok(()) => break,
                Err(e) => {
                    error!("set to leader (index={}, url={}) failed: {}", index, url, e);
                }
            }
        }
    }
}

/// Run `f` over every item in parallel, logging failures.
pub async fn parallel_execute<T, F, Fut>(items: Vec<T>, f: F)
where
    T: Send,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let calls = items.into_iter().map(|item| {
        let fut = f(item);
        async move {
            if let Err(e) = fut.await {
                trace!("parallel-execute failed: {}", e);
            }
        }
    });
    join_all(calls).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parallel_execute_observes_all_outcomes() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        parallel_execute(vec![1, 2, 3, 4], |n| {
            let c = c.clone();
            async move {
                c.fetch_add(n, Ordering::SeqCst);
                if n % 2 == 0 {
                    Err(GatewayError::Internal("even".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
