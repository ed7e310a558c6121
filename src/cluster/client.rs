//! Typed peer RPC and the load-balanced client wrapper.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::cluster::shared::{DeleteInfo, MergeInfo, SharedSnapshot};
use crate::core::data::{NodeStatus, Role};
use crate::core::error::{GatewayError, Result};

/// Load balancer over an index range.
///
/// Each call walks one of the pre-shuffled permutations. An index failing
/// repeatedly is skipped for as many subsequent attempts as it has recorded
/// failures (capped), then retried, so a flaky peer is routed around without
/// being removed.
pub struct LoadBalancer {
    size: usize,
    threshold: u32,
    failed: Vec<AtomicU32>,
    skipped: Vec<AtomicU32>,
    permutations: Vec<Vec<usize>>,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(size: usize) -> Self {
        Self::with_limits(size, (size as u32) * 5, size * 100)
    }

    pub fn with_limits(size: usize, threshold: u32, permutation_count: usize) -> Self {
        let mut rng = rand::thread_rng();
        let permutations = (0..permutation_count.max(1))
            .map(|_| {
                let mut idx: Vec<usize> = (0..size).collect();
                idx.shuffle(&mut rng);
                idx
            })
            .collect();
        Self {
            size,
            threshold,
            failed: (0..size).map(|_| AtomicU32::new(0)).collect(),
            skipped: (0..size).map(|_| AtomicU32::new(0)).collect(),
            permutations,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Run `f` against indexes in shuffled order until one succeeds.
    /// Skipped indexes get a second pass before the last error surfaces.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.size == 0 {
            return Err(GatewayError::Cluster("load balancer has no targets".into()));
        }
        let slot = self.cursor.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
            Some(if c + 1 < self.permutations.len() { c + 1 } else { 0 })
        });
        let order = &self.permutations[slot.unwrap_or(0)];

        let mut skipped_idx = Vec::new();
        let mut last_err = None;
        for &idx in order {
            if self.should_skip(idx) {
                skipped_idx.push(idx);
                continue;
            }
            match f(idx).await {
                Ok(v) => {
                    self.reset(idx);
                    return Ok(v);
                }
                Err(e) => {
                    self.record_failure(idx);
                    last_err = Some(e);
                }
            }
        }
        for idx in skipped_idx {
            match f(idx).await {
                Ok(v) => {
                    self.reset(idx);
                    return Ok(v);
                }
                Err(e) => {
                    self.record_failure(idx);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::Cluster("no target attempted".into())))
    }

    fn should_skip(&self, idx: usize) -> bool {
        let failed = self.failed[idx].load(Ordering::SeqCst);
        if failed == 0 {
            return false;
        }
        let prev = self.skipped[idx]
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(if failed > c { c + 1 } else { 0 })
            })
            .unwrap_or(0);
        // the update landing back on zero means the skip budget is spent
        !(prev >= failed)
    }

    fn record_failure(&self, idx: usize) {
        let _ = self.failed[idx].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
            Some(if c + 1 < self.threshold { c + 1 } else { c })
        });
    }

    fn reset(&self, idx: usize) {
        self.failed[idx].store(0, Ordering::SeqCst);
        self.skipped[idx].store(0, Ordering::SeqCst);
    }

    /// Forget all failure history.
    pub fn clear(&self) {
        for i in 0..self.size {
            self.reset(i);
        }
    }
}

/// Typed HTTP client for the peer RPC surface.
///
/// One pooled client is reused for every peer; each call carries its own
/// deadline and is never retried here (retries belong to the redirect
/// layer).
pub struct ClusterClient {
    http: reqwest::Client,
    base_path: String,
    balancers: DashMap<Vec<String>, Arc<LoadBalancer>>,
}

impl ClusterClient {
    pub fn new(base_path: &str, connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(Self {
            http,
            base_path: base_path.to_string(),
            balancers: DashMap::new(),
        })
    }

    /// The pooled HTTP client (shared with the redirect proxy and sinks).
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// One load balancer per distinct URL set, reused across calls.
    pub fn load_balancer(&self, urls: &[String]) -> Arc<LoadBalancer> {
        let mut key: Vec<String> = urls.to_vec();
        key.sort();
        self.balancers
            .entry(key)
            .or_insert_with(|| Arc::new(LoadBalancer::new(urls.len())))
            .clone()
    }

    fn url(&self, base: &str, path: &str) -> String {
        format!("{}{}{}", base.trim_end_matches('/'), self.base_path, path)
    }

    async fn expect_ok(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(GatewayError::Cluster(if body.is_empty() {
                format!("peer answered {status}")
            } else {
                body
            }))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        let resp = self.http.get(&url).send().await?;
        Ok(Self::expect_ok(resp).await?.json().await?)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: String,
        body: &B,
    ) -> Result<T> {
        let resp = self.http.post(&url).json(body).send().await?;
        Ok(Self::expect_ok(resp).await?.json().await?)
    }

    async fn post_unit<B: Serialize + ?Sized>(&self, url: String, body: &B) -> Result<()> {
        let resp = self.http.post(&url).json(body).send().await?;
        Self::expect_ok(resp).await.map(|_| ())
    }

    pub async fn heartbeat(
        &self,
        base: &str,
        node_index: u32,
        role: Role,
        last_transition: i64,
        seq_map: &HashMap<u32, u64>,
    ) -> Result<()> {
        let url = self.url(
            base,
            &format!("/heartbeat/{node_index}/{role}/{last_transition}"),
        );
        trace!("PUT {}", url);
        let resp = self.http.put(&url).json(seq_map).send().await?;
        Self::expect_ok(resp).await.map(|_| ())
    }

    pub async fn get_node_status(&self, base: &str) -> Result<NodeStatus> {
        self.get_json(self.url(base, "/node-status")).await
    }

    pub async fn get_node_index(&self, base: &str) -> Result<u32> {
        self.get_json(self.url(base, "/get-node-index")).await
    }

    pub async fn set_to_leader(&self, base: &str) -> Result<()> {
        let resp = self.http.put(self.url(base, "/set-to-leader")).send().await?;
        Self::expect_ok(resp).await.map(|_| ())
    }

    pub async fn set_to_follower(&self, base: &str) -> Result<()> {
        let resp = self
            .http
            .put(self.url(base, "/set-to-follower"))
            .send()
            .await?;
        Self::expect_ok(resp).await.map(|_| ())
    }

    pub async fn cluster_deleted(&self, base: &str, node_index: u32) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(base, &format!("/cluster-deleted/{node_index}")))
            .send()
            .await?;
        Self::expect_ok(resp).await.map(|_| ())
    }

    pub async fn remove_shared_object(&self, base: &str, node_index: u32) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(base, &format!("/remove-shared-object/{node_index}")))
            .send()
            .await?;
        Self::expect_ok(resp).await.map(|_| ())
    }

    pub async fn merge_shared_object_to_leader(
        &self,
        base: &str,
        sender: u32,
        info: &MergeInfo,
    ) -> Result<()> {
        self.post_unit(
            self.url(base, &format!("/merge-shared-object-to-leader/{sender}")),
            info,
        )
        .await
    }

    pub async fn delete_shared_object_to_leader(
        &self,
        base: &str,
        sender: u32,
        info: &DeleteInfo,
    ) -> Result<()> {
        self.post_unit(
            self.url(base, &format!("/delete-shared-object-to-leader/{sender}")),
            info,
        )
        .await
    }

    pub async fn overwrite_shared_object(
        &self,
        base: &str,
        node_index: u32,
        info: &MergeInfo,
    ) -> Result<()> {
        self.post_unit(
            self.url(base, &format!("/overwrite-shared-object/{node_index}")),
            info,
        )
        .await
    }

    pub async fn check_merge_shared_object(
        &self,
        base: &str,
        sender: u32,
        info: &MergeInfo,
    ) -> Result<bool> {
        self.post_json(
            self.url(base, &format!("/check-merge-shared-object/{sender}")),
            info,
        )
        .await
    }

    pub async fn check_delete_shared_object(
        &self,
        base: &str,
        sender: u32,
        info: &DeleteInfo,
    ) -> Result<bool> {
        self.post_json(
            self.url(base, &format!("/check-delete-shared-object/{sender}")),
            info,
        )
        .await
    }

    pub async fn get_shared_object(&self, base: &str, node_index: Option<u32>) -> Result<MergeInfo> {
        let path = match node_index {
            Some(idx) => format!("/get-shared-object/{idx}"),
            None => "/get-shared-object".to_string(),
        };
        self.get_json(self.url(base, &path)).await
    }

    pub async fn sync_shared_object(
        &self,
        base: &str,
        sender: u32,
        snapshot: &SharedSnapshot,
    ) -> Result<()> {
        self.post_unit(self.url(base, &format!("/sync-shared-object/{sender}")), snapshot)
            .await
    }

    pub async fn check_shared_object_seq(
        &self,
        base: &str,
        seq_map: &HashMap<u32, u64>,
    ) -> Result<HashSet<u32>> {
        self.post_json(self.url(base, "/check-shared-object-sequence"), seq_map)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_load_balancer_first_success_wins() {
        let lb = LoadBalancer::new(3);
        let calls = AtomicUsize::new(0);
        let out = lb
            .run(|idx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, GatewayError>(idx) }
            })
            .await
            .unwrap();
        assert!(out < 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_balancer_falls_through_failures() {
        let lb = LoadBalancer::new(3);
        let out = lb
            .run(|idx| async move {
                if idx == 2 {
                    Ok(idx)
                } else {
                    Err(GatewayError::Cluster("down".into()))
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn test_load_balancer_all_fail() {
        let lb = LoadBalancer::new(2);
        let err = lb
            .run(|_| async { Err::<(), _>(GatewayError::Cluster("down".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cluster(_)));
    }

    #[tokio::test]
    async fn test_failed_index_is_skipped_then_retried() {
        let lb = LoadBalancer::with_limits(1, 5, 4);
        // one failure recorded
        let _ = lb
            .run(|_| async { Err::<(), _>(GatewayError::Cluster("down".into())) })
            .await;
        assert_eq!(lb.failed[0].load(Ordering::SeqCst), 1);

        // next call: the only index is skipped on the first pass but the
        // second pass still reaches it
        let ok = lb.run(|idx| async move { Ok::<_, GatewayError>(idx) }).await;
        assert_eq!(ok.unwrap(), 0);
        // success resets the counters
        assert_eq!(lb.failed[0].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_load_balancer() {
        let lb = LoadBalancer::new(0);
        assert!(lb
            .run(|idx| async move { Ok::<_, GatewayError>(idx) })
            .await
            .is_err());
    }
}
