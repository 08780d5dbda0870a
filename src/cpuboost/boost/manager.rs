/*
 * Copyright (C) 2025 The Cpuboost Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cpuboost::boost::duration::FIXED_DURATION_POLICY_NAME;
use crate::cpuboost::boost::record::BoostRecord;
use crate::cpuboost::k8s::boost::StartupCPUBoost;
use crate::cpuboost::k8s::pod::Pod;
use crate::cpuboost::logger::{log_debug, log_error, log_info};
use crate::cpuboost::observability::metrics;
use crate::cpuboost::util::error::{join_errors, new_error, with_context, BoxError};

pub const DEFAULT_MANAGER_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONCURRENT_REVERTS: usize = 10;

const COMPONENT: &str = "boost-manager";

/// Identity of a boost whose observed status needs convergence.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReconcileRequest {
    pub namespace: String,
    pub name: String,
}

/// Consumer of post-revert reconciliation requests. The status reconciler
/// implements this; the manager treats an unset reconciler as "skip".
#[async_trait]
pub trait StatusReconciler: Send + Sync {
    async fn reconcile(&self, request: &ReconcileRequest);
}

/// Tick source for the periodic policy check. Injectable so tests drive the
/// loop deterministically.
pub trait Ticker: Send {
    fn tick(&mut self) -> impl std::future::Future<Output = ()> + Send;
}

pub struct IntervalTicker {
    interval: tokio::time::Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        IntervalTicker { interval }
    }
}

impl Ticker for IntervalTicker {
    fn tick(&mut self) -> impl std::future::Future<Output = ()> + Send {
        async {
            self.interval.tick().await;
        }
    }
}

/// Ticker driven by an external channel; used by tests.
pub struct ManualTicker {
    rx: mpsc::Receiver<()>,
}

impl ManualTicker {
    pub fn new() -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(1);
        (tx, ManualTicker { rx })
    }
}

impl Ticker for ManualTicker {
    fn tick(&mut self) -> impl std::future::Future<Output = ()> + Send {
        async {
            if self.rx.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
    }
}

struct ManagerState {
    regular: HashMap<String, HashMap<String, Arc<BoostRecord>>>,
    /// Subset of `regular` carrying a fixed duration policy; only these are
    /// walked by the tick loop.
    timed: HashMap<String, HashMap<String, Arc<BoostRecord>>>,
    /// Pods carrying a boost label whose boost is not registered yet.
    orphaned: HashMap<String, HashMap<String, Pod>>,
    is_running: bool,
}

/// Process-wide registry of boost records and orphan pods, plus the periodic
/// revert scheduler.
pub struct BoostManager {
    state: RwLock<ManagerState>,
    reconciler: RwLock<Option<Arc<dyn StatusReconciler>>>,
    max_concurrent_reverts: usize,
}

impl Default for BoostManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BoostManager {
    pub fn new() -> Self {
        Self::with_max_concurrent_reverts(DEFAULT_MAX_CONCURRENT_REVERTS)
    }

    pub fn with_max_concurrent_reverts(max_concurrent_reverts: usize) -> Self {
        BoostManager {
            state: RwLock::new(ManagerState {
                regular: HashMap::new(),
                timed: HashMap::new(),
                orphaned: HashMap::new(),
                is_running: false,
            }),
            reconciler: RwLock::new(None),
            max_concurrent_reverts,
        }
    }

    pub async fn set_reconciler(&self, reconciler: Arc<dyn StatusReconciler>) {
        *self.reconciler.write().await = Some(reconciler);
    }

    /// Surfaced through the readiness endpoint.
    pub async fn is_running(&self) -> bool {
        self.state.read().await.is_running
    }

    /// Registers a new boost record, rejecting duplicates, and promotes any
    /// orphan pods in the namespace that its selector matches. Per-pod
    /// promotion errors are joined and returned; promoted pods leave the
    /// orphan map either way.
    pub async fn add_regular_boost(&self, record: Arc<BoostRecord>) -> Result<(), BoxError> {
        let mut state = self.state.write().await;
        let namespace = record.namespace().to_string();
        let name = record.name().to_string();
        if state
            .regular
            .get(&namespace)
            .is_some_and(|boosts| boosts.contains_key(&name))
        {
            return Err(new_error("startupCPUBoost already exists"));
        }
        state
            .regular
            .entry(namespace.clone())
            .or_default()
            .insert(name.clone(), record.clone());
        metrics::new_boost_configuration(&namespace);
        if record.has_fixed_duration_policy().await {
            state
                .timed
                .entry(namespace.clone())
                .or_default()
                .insert(name.clone(), record.clone());
        }
        log_info(
            COMPONENT,
            "boost registered",
            &[("name", name.as_str()), ("namespace", namespace.as_str())],
        );

        let mut errs: Vec<BoxError> = Vec::new();
        if let Some(orphans) = state.orphaned.get_mut(&namespace) {
            let mut promoted = Vec::new();
            for (pod_name, pod) in orphans.iter() {
                if record.matches(pod).await {
                    promoted.push((pod_name.clone(), pod.clone()));
                }
            }
            for (pod_name, pod) in promoted {
                orphans.remove(&pod_name);
                log_debug(
                    COMPONENT,
                    "promoting orphaned pod",
                    &[("pod", pod_name.as_str()), ("boost", name.as_str())],
                );
                if let Err(err) = record.upsert_pod(&pod).await {
                    errs.push(with_context(
                        err,
                        format!("failed to promote orphaned pod {}", pod_name),
                    ));
                }
            }
            if orphans.is_empty() {
                state.orphaned.remove(&namespace);
            }
        }
        join_errors(errs)
    }

    /// Applies a changed spec to the registered record and maintains the
    /// timed-boost index.
    pub async fn update_regular_boost(&self, boost: &StartupCPUBoost) -> Result<(), BoxError> {
        let mut state = self.state.write().await;
        let namespace = boost.metadata.namespace.clone();
        let name = boost.metadata.name.clone();
        let record = state
            .regular
            .get(&namespace)
            .and_then(|boosts| boosts.get(&name))
            .cloned()
            .ok_or_else(|| new_error("startupCPUBoost is not registered"))?;
        record.update_from_spec(boost).await?;
        if record.has_fixed_duration_policy().await {
            state
                .timed
                .entry(namespace)
                .or_default()
                .insert(name, record);
        } else if let Some(timed) = state.timed.get_mut(&namespace) {
            timed.remove(&name);
            if timed.is_empty() {
                state.timed.remove(&namespace);
            }
        }
        Ok(())
    }

    /// Removes a boost record. Its tracked pods are discarded with it; they
    /// do not return to the orphan map.
    pub async fn delete_regular_boost(&self, namespace: &str, name: &str) {
        let mut state = self.state.write().await;
        let removed = state
            .regular
            .get_mut(namespace)
            .and_then(|boosts| boosts.remove(name));
        if removed.is_none() {
            return;
        }
        if state.regular.get(namespace).is_some_and(HashMap::is_empty) {
            state.regular.remove(namespace);
        }
        if let Some(timed) = state.timed.get_mut(namespace) {
            timed.remove(name);
            if timed.is_empty() {
                state.timed.remove(namespace);
            }
        }
        metrics::delete_boost_configuration(namespace);
        metrics::clear_boost_metrics(namespace, name);
        log_info(
            COMPONENT,
            "boost deleted",
            &[("name", name), ("namespace", namespace)],
        );
    }

    pub async fn get_regular_boost(&self, namespace: &str, name: &str) -> Option<Arc<BoostRecord>> {
        self.state
            .read()
            .await
            .regular
            .get(namespace)
            .and_then(|boosts| boosts.get(name))
            .cloned()
    }

    /// The most specific boost whose selector matches the pod: ties on
    /// requirement count break on name for determinism.
    pub async fn get_boost_for_pod(&self, pod: &Pod) -> Option<Arc<BoostRecord>> {
        let state = self.state.read().await;
        let boosts = state.regular.get(&pod.metadata.namespace)?;
        let mut best: Option<(usize, &str, Arc<BoostRecord>)> = None;
        for (name, record) in boosts {
            if !record.matches(pod).await {
                continue;
            }
            let specificity = record.selector_specificity().await;
            let better = match &best {
                None => true,
                Some((best_specificity, best_name, _)) => {
                    specificity > *best_specificity
                        || (specificity == *best_specificity && name.as_str() < *best_name)
                }
            };
            if better {
                best = Some((specificity, name, record.clone()));
            }
        }
        best.map(|(_, _, record)| record)
    }

    /// Routes a pod to its governing record, or parks it in the orphan map.
    /// A pod lives in at most one place. Returns the governing boost's
    /// identity when one was found.
    pub async fn upsert_pod(&self, pod: &Pod) -> Result<Option<ReconcileRequest>, BoxError> {
        let mut state = self.state.write().await;
        let namespace = pod.metadata.namespace.clone();
        let name = pod.metadata.name.clone();
        let record = find_matching_record(&state, pod).await;
        match record {
            Some(record) => {
                if let Some(orphans) = state.orphaned.get_mut(&namespace) {
                    orphans.remove(&name);
                    if orphans.is_empty() {
                        state.orphaned.remove(&namespace);
                    }
                }
                record.upsert_pod(pod).await?;
                Ok(Some(ReconcileRequest {
                    namespace: record.namespace().to_string(),
                    name: record.name().to_string(),
                }))
            }
            None => {
                log_debug(
                    COMPONENT,
                    "no boost for pod, keeping as orphan",
                    &[("pod", name.as_str()), ("namespace", namespace.as_str())],
                );
                state
                    .orphaned
                    .entry(namespace)
                    .or_default()
                    .insert(name, pod.clone());
                Ok(None)
            }
        }
    }

    /// Drops a pod from its governing record or from the orphan map.
    pub async fn delete_pod(&self, pod: &Pod) -> Option<ReconcileRequest> {
        let mut state = self.state.write().await;
        let namespace = pod.metadata.namespace.clone();
        let name = pod.metadata.name.clone();
        if let Some(record) = find_matching_record(&state, pod).await {
            record.delete_pod(pod).await;
            return Some(ReconcileRequest {
                namespace: record.namespace().to_string(),
                name: record.name().to_string(),
            });
        }
        if let Some(orphans) = state.orphaned.get_mut(&namespace) {
            orphans.remove(&name);
            if orphans.is_empty() {
                state.orphaned.remove(&namespace);
            }
        }
        None
    }

    /// Number of orphan pods in a namespace. Used by tests and diagnostics.
    pub async fn orphaned_pod_count(&self, namespace: &str) -> usize {
        self.state
            .read()
            .await
            .orphaned
            .get(namespace)
            .map_or(0, HashMap::len)
    }

    /// Blocks on the periodic policy-check loop until cancellation.
    pub async fn start<T: Ticker>(&self, token: CancellationToken, mut ticker: T) {
        {
            let mut state = self.state.write().await;
            state.is_running = true;
        }
        log_info(COMPONENT, "boost manager starting", &[]);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    log_debug(COMPONENT, "tick", &[]);
                    self.revert_expired_boosts(&token).await;
                }
            }
        }
        {
            let mut state = self.state.write().await;
            state.is_running = false;
        }
        log_info(COMPONENT, "boost manager stopped", &[]);
    }

    /// One tick: walk the timed boosts, revert expired pods through a
    /// bounded worker pool, then fire deduplicated reconciliation requests.
    pub async fn revert_expired_boosts(&self, token: &CancellationToken) {
        let timed: Vec<Arc<BoostRecord>> = {
            let state = self.state.read().await;
            state
                .timed
                .values()
                .flat_map(|boosts| boosts.values().cloned())
                .collect()
        };
        if timed.is_empty() {
            return;
        }

        let (task_tx, task_rx) = mpsc::channel::<(Arc<BoostRecord>, Pod)>(self.max_concurrent_reverts);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<ReconcileRequest>();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<(String, String, BoxError)>();

        let producer = {
            let token = token.clone();
            tokio::spawn(async move {
                'records: for record in timed {
                    let expired = record.validate_policy(FIXED_DURATION_POLICY_NAME).await;
                    for pod in expired {
                        tokio::select! {
                            _ = token.cancelled() => break 'records,
                            sent = task_tx.send((record.clone(), pod)) => {
                                if sent.is_err() {
                                    break 'records;
                                }
                            }
                        }
                    }
                }
            })
        };

        let mut workers = JoinSet::new();
        for _ in 0..self.max_concurrent_reverts {
            let task_rx = task_rx.clone();
            let done_tx = done_tx.clone();
            let err_tx = err_tx.clone();
            workers.spawn(async move {
                loop {
                    let task = { task_rx.lock().await.recv().await };
                    let Some((record, pod)) = task else {
                        break;
                    };
                    match record.revert_resources(&pod).await {
                        Ok(()) => {
                            let _ = done_tx.send(ReconcileRequest {
                                namespace: record.namespace().to_string(),
                                name: record.name().to_string(),
                            });
                        }
                        Err(err) => {
                            let _ = err_tx.send((
                                pod.metadata.namespace.clone(),
                                pod.metadata.name.clone(),
                                err,
                            ));
                        }
                    }
                }
            });
        }
        drop(done_tx);
        drop(err_tx);

        let _ = producer.await;
        while workers.join_next().await.is_some() {}

        while let Some((namespace, name, err)) = err_rx.recv().await {
            log_error(
                COMPONENT,
                "failed to revert pod resources",
                &[
                    ("pod", name.as_str()),
                    ("namespace", namespace.as_str()),
                    ("error", &err.to_string()),
                ],
            );
        }

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        while let Some(request) = done_rx.recv().await {
            if seen.insert(request.clone()) {
                unique.push(request);
            }
        }
        if unique.is_empty() {
            return;
        }
        let reconciler = self.reconciler.read().await.clone();
        let Some(reconciler) = reconciler else {
            return;
        };
        for request in unique {
            reconciler.reconcile(&request).await;
        }
    }
}

async fn find_matching_record(state: &ManagerState, pod: &Pod) -> Option<Arc<BoostRecord>> {
    let boosts = state.regular.get(&pod.metadata.namespace)?;
    let mut best: Option<(usize, String, Arc<BoostRecord>)> = None;
    for (name, record) in boosts {
        if !record.matches(pod).await {
            continue;
        }
        let specificity = record.selector_specificity().await;
        let better = match &best {
            None => true,
            Some((best_specificity, best_name, _)) => {
                specificity > *best_specificity
                    || (specificity == *best_specificity && name < best_name)
            }
        };
        if better {
            best = Some((specificity, name.clone(), record.clone()));
        }
    }
    best.map(|(_, _, record)| record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuboost::boost::pod::{BoostAnnotation, BOOST_ANNOTATION_KEY, BOOST_LABEL_KEY};
    use crate::cpuboost::k8s::selector::{
        LabelSelectorRequirement, SELECTOR_OP_EXISTS,
    };
    use crate::cpuboost::test_support::{percentage_boost, FakeClusterClient, PodBuilder};
    use chrono::{Duration as ChronoDuration, Utc};
    use serial_test::serial;
    use std::sync::Mutex as StdMutex;

    struct RecordingReconciler {
        calls: StdMutex<Vec<ReconcileRequest>>,
    }

    impl RecordingReconciler {
        fn new() -> Arc<Self> {
            Arc::new(RecordingReconciler {
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<ReconcileRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusReconciler for RecordingReconciler {
        async fn reconcile(&self, request: &ReconcileRequest) {
            self.calls.lock().unwrap().push(request.clone());
        }
    }

    fn boosted_pod(namespace: &str, name: &str, boost: &str) -> Pod {
        let mut annotation = BoostAnnotation::new(Utc::now());
        annotation
            .init_cpu_requests
            .insert("main".to_string(), "500m".to_string());
        PodBuilder::new(namespace, name)
            .label("app", "demo")
            .label(BOOST_LABEL_KEY, boost)
            .annotation(BOOST_ANNOTATION_KEY, &annotation.to_json())
            .container("main", Some("1100m"), None)
            .build()
    }

    fn expired_pod(namespace: &str, name: &str, boost: &str) -> Pod {
        let mut pod = boosted_pod(namespace, name, boost);
        pod.metadata.creation_timestamp = Some(Utc::now() - ChronoDuration::seconds(120));
        pod
    }

    async fn registered_manager(
        client: Arc<FakeClusterClient>,
    ) -> (Arc<BoostManager>, Arc<BoostRecord>) {
        let manager = Arc::new(BoostManager::new());
        let boost = percentage_boost("demo", "boost-1", "demo", "main", 120, 60);
        let record = Arc::new(BoostRecord::from_spec(client, &boost, false).unwrap());
        manager.add_regular_boost(record.clone()).await.unwrap();
        (manager, record)
    }

    #[tokio::test]
    #[serial]
    async fn duplicate_registration_is_rejected() {
        let client = Arc::new(FakeClusterClient::new());
        let (manager, _) = registered_manager(client.clone()).await;
        let boost = percentage_boost("demo", "boost-1", "demo", "main", 120, 60);
        let duplicate = Arc::new(BoostRecord::from_spec(client, &boost, false).unwrap());
        let err = manager.add_regular_boost(duplicate).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    #[serial]
    async fn pods_without_a_boost_become_orphans_and_promote_later() {
        let client = Arc::new(FakeClusterClient::new());
        let manager = Arc::new(BoostManager::new());

        let pod_a = boosted_pod("demo", "pod-a", "boost-1");
        let pod_b = boosted_pod("demo", "pod-b", "boost-1");
        let unrelated = PodBuilder::new("demo", "loner")
            .label("app", "other")
            .label(BOOST_LABEL_KEY, "boost-1")
            .container("main", Some("100m"), None)
            .build();
        assert!(manager.upsert_pod(&pod_a).await.unwrap().is_none());
        assert!(manager.upsert_pod(&pod_b).await.unwrap().is_none());
        assert!(manager.upsert_pod(&unrelated).await.unwrap().is_none());
        assert_eq!(manager.orphaned_pod_count("demo").await, 3);

        let boost = percentage_boost("demo", "boost-1", "demo", "main", 120, 60);
        let record = Arc::new(BoostRecord::from_spec(client, &boost, false).unwrap());
        manager.add_regular_boost(record.clone()).await.unwrap();

        assert_eq!(manager.orphaned_pod_count("demo").await, 1, "non-matching pod stays");
        assert!(record.pod("pod-a").await.is_some());
        assert!(record.pod("pod-b").await.is_some());
        assert_eq!(record.stats().await.active_container_boosts, 2);
    }

    #[tokio::test]
    #[serial]
    async fn upsert_routes_to_matching_record_and_clears_orphan() {
        let client = Arc::new(FakeClusterClient::new());
        let manager = Arc::new(BoostManager::new());
        let pod = boosted_pod("demo", "pod-1", "boost-1");
        manager.upsert_pod(&pod).await.unwrap();

        let boost = percentage_boost("demo", "boost-1", "demo", "main", 120, 60);
        let record = Arc::new(BoostRecord::from_spec(client, &boost, false).unwrap());
        manager.add_regular_boost(record.clone()).await.unwrap();

        let request = manager.upsert_pod(&pod).await.unwrap().unwrap();
        assert_eq!(request.name, "boost-1");
        assert_eq!(manager.orphaned_pod_count("demo").await, 0);
        assert!(record.pod("pod-1").await.is_some());
    }

    #[tokio::test]
    #[serial]
    async fn delete_pod_removes_from_record_or_orphans() {
        let client = Arc::new(FakeClusterClient::new());
        let (manager, record) = registered_manager(client).await;
        let pod = boosted_pod("demo", "pod-1", "boost-1");
        manager.upsert_pod(&pod).await.unwrap();

        let request = manager.delete_pod(&pod).await.unwrap();
        assert_eq!(request.name, "boost-1");
        assert!(record.pod("pod-1").await.is_none());

        let stray = PodBuilder::new("demo", "stray")
            .label(BOOST_LABEL_KEY, "missing")
            .container("main", Some("100m"), None)
            .build();
        manager.upsert_pod(&stray).await.unwrap();
        assert_eq!(manager.orphaned_pod_count("demo").await, 1);
        assert!(manager.delete_pod(&stray).await.is_none());
        assert_eq!(manager.orphaned_pod_count("demo").await, 0);
    }

    #[tokio::test]
    #[serial]
    async fn most_specific_selector_wins() {
        let client = Arc::new(FakeClusterClient::new());
        let manager = Arc::new(BoostManager::new());
        let broad = percentage_boost("demo", "broad", "demo", "main", 50, 60);
        let mut narrow = percentage_boost("demo", "narrow", "demo", "main", 100, 60);
        narrow
            .selector
            .match_expressions
            .push(LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: SELECTOR_OP_EXISTS.to_string(),
                values: vec![],
            });
        for boost in [&broad, &narrow] {
            let record = Arc::new(BoostRecord::from_spec(client.clone(), boost, false).unwrap());
            manager.add_regular_boost(record).await.unwrap();
        }

        let pod = PodBuilder::new("demo", "pod-1")
            .label("app", "demo")
            .label("tier", "web")
            .container("main", Some("100m"), None)
            .build();
        let found = manager.get_boost_for_pod(&pod).await.unwrap();
        assert_eq!(found.name(), "narrow");

        let plain = PodBuilder::new("demo", "pod-2")
            .label("app", "demo")
            .container("main", Some("100m"), None)
            .build();
        let found = manager.get_boost_for_pod(&plain).await.unwrap();
        assert_eq!(found.name(), "broad");
    }

    #[tokio::test]
    #[serial]
    async fn tick_reverts_expired_pods_and_dedups_reconciliation() {
        let client = Arc::new(FakeClusterClient::new());
        let (manager, record) = registered_manager(client.clone()).await;
        let reconciler = RecordingReconciler::new();
        manager.set_reconciler(reconciler.clone()).await;

        for i in 0..4 {
            let pod = expired_pod("demo", &format!("pod-{}", i), "boost-1");
            manager.upsert_pod(&pod).await.unwrap();
        }
        let fresh = boosted_pod("demo", "fresh", "boost-1");
        manager.upsert_pod(&fresh).await.unwrap();

        let token = CancellationToken::new();
        manager.revert_expired_boosts(&token).await;

        assert_eq!(client.resize_patches().len(), 4);
        assert!(record.pod("fresh").await.is_some());
        assert_eq!(record.stats().await.active_container_boosts, 1);
        let calls = reconciler.calls();
        assert_eq!(calls.len(), 1, "reconciliation deduplicated per boost");
        assert_eq!(calls[0].name, "boost-1");
    }

    #[tokio::test]
    #[serial]
    async fn tick_is_idempotent_without_policy_transitions() {
        let client = Arc::new(FakeClusterClient::new());
        let (manager, _) = registered_manager(client.clone()).await;
        let pod = expired_pod("demo", "pod-1", "boost-1");
        manager.upsert_pod(&pod).await.unwrap();

        let token = CancellationToken::new();
        manager.revert_expired_boosts(&token).await;
        manager.revert_expired_boosts(&token).await;
        manager.revert_expired_boosts(&token).await;

        assert_eq!(client.resize_patches().len(), 1, "revert happened once");
        assert_eq!(client.pod_patches().len(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn failed_reverts_stay_tracked_and_retry_next_tick() {
        let client = Arc::new(FakeClusterClient::new());
        let (manager, record) = registered_manager(client.clone()).await;
        let reconciler = RecordingReconciler::new();
        manager.set_reconciler(reconciler.clone()).await;

        for i in 0..10 {
            let pod = expired_pod("demo", &format!("pod-{}", i), "boost-1");
            manager.upsert_pod(&pod).await.unwrap();
        }
        client.fail_pod_writes("pod-3");
        client.fail_pod_writes("pod-7");

        let token = CancellationToken::new();
        manager.revert_expired_boosts(&token).await;

        assert_eq!(client.resize_patches().len(), 8);
        assert!(record.pod("pod-3").await.is_some());
        assert!(record.pod("pod-7").await.is_some());
        assert_eq!(reconciler.calls().len(), 1);

        client.heal_pod("pod-3");
        client.heal_pod("pod-7");
        manager.revert_expired_boosts(&token).await;
        assert_eq!(client.resize_patches().len(), 10);
        assert!(record.pod("pod-3").await.is_none());
        assert_eq!(record.stats().await.active_container_boosts, 0);
    }

    #[tokio::test]
    #[serial]
    async fn start_flips_running_flag_until_cancelled() {
        let client = Arc::new(FakeClusterClient::new());
        let (manager, _) = registered_manager(client).await;
        assert!(!manager.is_running().await);

        let token = CancellationToken::new();
        let (tick_tx, ticker) = ManualTicker::new();
        let handle = {
            let manager = manager.clone();
            let token = token.clone();
            tokio::spawn(async move { manager.start(token, ticker).await })
        };

        // Drive one tick so the loop is demonstrably live.
        tick_tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !manager.is_running().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("manager did not report running");

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("manager did not stop")
            .unwrap();
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    #[serial]
    async fn deleting_boost_discards_tracked_pods() {
        let client = Arc::new(FakeClusterClient::new());
        let (manager, record) = registered_manager(client).await;
        let pod = boosted_pod("demo", "pod-1", "boost-1");
        manager.upsert_pod(&pod).await.unwrap();

        manager.delete_regular_boost("demo", "boost-1").await;
        assert!(manager.get_regular_boost("demo", "boost-1").await.is_none());
        assert_eq!(manager.orphaned_pod_count("demo").await, 0);
        assert!(record.pod("pod-1").await.is_some(), "record itself is dropped whole");
    }

    #[tokio::test]
    #[serial]
    async fn update_removes_boost_from_timed_index() {
        let client = Arc::new(FakeClusterClient::new());
        let (manager, _) = registered_manager(client.clone()).await;
        let pod = expired_pod("demo", "pod-1", "boost-1");
        manager.upsert_pod(&pod).await.unwrap();

        let mut updated = percentage_boost("demo", "boost-1", "demo", "main", 120, 60);
        updated.spec.duration_policy = crate::cpuboost::k8s::boost::DurationPolicySpec {
            pod_condition: Some(crate::cpuboost::k8s::boost::PodConditionDurationPolicySpec {
                condition_type: "Ready".to_string(),
                status: "True".to_string(),
            }),
            ..Default::default()
        };
        manager.update_regular_boost(&updated).await.unwrap();

        let token = CancellationToken::new();
        manager.revert_expired_boosts(&token).await;
        assert!(client.resize_patches().is_empty(), "no longer a timed boost");
    }
}
