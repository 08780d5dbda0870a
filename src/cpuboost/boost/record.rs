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

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

use crate::cpuboost::boost::duration::{
    DurationPolicy, TimeSource, FIXED_DURATION_POLICY_NAME, POD_CONDITION_POLICY_NAME,
};
use crate::cpuboost::boost::pod::{
    boost_containers_len, revert_resource_boost, BoostAnnotation, BOOST_ANNOTATION_KEY,
    BOOST_LABEL_KEY,
};
use crate::cpuboost::boost::resource::ContainerPolicy;
use crate::cpuboost::k8s::boost::{StartupCPUBoost, FIXED_DURATION_UNIT_MINUTES};
use crate::cpuboost::k8s::client::ClusterClient;
use crate::cpuboost::k8s::pod::Pod;
use crate::cpuboost::k8s::selector::Selector;
use crate::cpuboost::logger::{log_debug, log_info};
use crate::cpuboost::observability::metrics;
use crate::cpuboost::util::error::{join_errors, new_error, with_context, BoxError};

const COMPONENT: &str = "boost";

/// Usage statistics for a boost record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BoostStats {
    /// Containers currently boosted and not yet reverted.
    pub active_container_boosts: usize,
    /// Containers ever boosted by this record. Non-decreasing.
    pub total_container_boosts: usize,
}

struct RecordState {
    selector: Selector,
    resource_policies: HashMap<String, ContainerPolicy>,
    duration_policies: HashMap<String, DurationPolicy>,
    pods: HashMap<String, Pod>,
    stats: BoostStats,
}

/// In-memory aggregate for one StartupCPUBoost configuration. Exclusively
/// owns the pods it governs; the manager only ever holds orphans.
pub struct BoostRecord {
    name: String,
    namespace: String,
    legacy_revert: bool,
    client: Arc<dyn ClusterClient>,
    state: RwLock<RecordState>,
}

impl BoostRecord {
    /// Builds a record from the external object. Selector compilation and
    /// resource-policy validation failures fail the constructor.
    pub fn from_spec(
        client: Arc<dyn ClusterClient>,
        boost: &StartupCPUBoost,
        legacy_revert: bool,
    ) -> Result<BoostRecord, BoxError> {
        Self::from_spec_with_time_source(
            client,
            boost,
            legacy_revert,
            crate::cpuboost::boost::duration::system_time_source(),
        )
    }

    pub fn from_spec_with_time_source(
        client: Arc<dyn ClusterClient>,
        boost: &StartupCPUBoost,
        legacy_revert: bool,
        time_source: TimeSource,
    ) -> Result<BoostRecord, BoxError> {
        let selector = boost
            .selector
            .compile()
            .map_err(|e| with_context(e, "failed to compile boost selector"))?;
        let resource_policies = map_resource_policies(boost)?;
        let duration_policies = map_duration_policies(boost, time_source);
        Ok(BoostRecord {
            name: boost.metadata.name.clone(),
            namespace: boost.metadata.namespace.clone(),
            legacy_revert,
            client,
            state: RwLock::new(RecordState {
                selector,
                resource_policies,
                duration_policies,
                pods: HashMap::new(),
                stats: BoostStats::default(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn legacy_revert(&self) -> bool {
        self.legacy_revert
    }

    pub async fn matches(&self, pod: &Pod) -> bool {
        self.state.read().await.selector.matches(&pod.metadata.labels)
    }

    /// Selector requirement count, for most-specific-match ranking.
    pub async fn selector_specificity(&self) -> usize {
        self.state.read().await.selector.requirement_count()
    }

    pub async fn resource_policy(&self, container_name: &str) -> Option<ContainerPolicy> {
        self.state
            .read()
            .await
            .resource_policies
            .get(container_name)
            .cloned()
    }

    pub async fn duration_policies(&self) -> HashMap<String, DurationPolicy> {
        self.state.read().await.duration_policies.clone()
    }

    pub async fn has_fixed_duration_policy(&self) -> bool {
        self.state
            .read()
            .await
            .duration_policies
            .contains_key(FIXED_DURATION_POLICY_NAME)
    }

    pub async fn pod(&self, name: &str) -> Option<Pod> {
        self.state.read().await.pods.get(name).cloned()
    }

    pub async fn stats(&self) -> BoostStats {
        self.state.read().await.stats
    }

    /// Inserts or replaces a tracked pod snapshot. When a pod-condition
    /// duration policy already evaluates false for the pod, the revert runs
    /// inline: the condition fired before the controller saw the pod.
    pub async fn upsert_pod(&self, pod: &Pod) -> Result<(), BoxError> {
        let mut state = self.state.write().await;
        log_debug(
            COMPONENT,
            "handling pod upsert",
            &[
                ("name", &self.name),
                ("namespace", &self.namespace),
                ("pod", &pod.metadata.name),
            ],
        );
        let existing = state.pods.contains_key(&pod.metadata.name);
        state.pods.insert(pod.metadata.name.clone(), pod.clone());
        self.update_stats(&mut state, if existing { None } else { Some(pod) });

        let Some(cond_policy) = state.duration_policies.get(POD_CONDITION_POLICY_NAME).cloned()
        else {
            return Ok(());
        };
        if !cond_policy.valid(pod).await {
            log_debug(
                COMPONENT,
                "pod condition policy expired, reverting resources",
                &[("pod", &pod.metadata.name)],
            );
            self.revert_locked(&mut state, pod)
                .await
                .map_err(|e| with_context(e, "pod resources reversion failed"))?;
            log_info(
                COMPONENT,
                "pod resources reverted successfully",
                &[
                    ("name", &self.name),
                    ("namespace", &self.namespace),
                    ("pod", &pod.metadata.name),
                ],
            );
        }
        Ok(())
    }

    /// Drops a pod from tracking. The total counter is unaffected.
    pub async fn delete_pod(&self, pod: &Pod) {
        let mut state = self.state.write().await;
        log_debug(
            COMPONENT,
            "handling pod delete",
            &[("name", &self.name), ("pod", &pod.metadata.name)],
        );
        state.pods.remove(&pod.metadata.name);
        self.update_stats(&mut state, None);
    }

    /// Pods for which the named duration policy no longer holds.
    pub async fn validate_policy(&self, name: &str) -> Vec<Pod> {
        let state = self.state.read().await;
        let Some(policy) = state.duration_policies.get(name) else {
            return Vec::new();
        };
        let mut violated = Vec::new();
        for pod in state.pods.values() {
            if !policy.valid(pod).await {
                violated.push(pod.clone());
            }
        }
        violated
    }

    /// Reverts the pod's CPU resources to the values in its boost
    /// annotation. Holds the record's write lock across the patch sequence
    /// so a concurrent upsert cannot observe a half-reverted pod.
    pub async fn revert_resources(&self, pod: &Pod) -> Result<(), BoxError> {
        let mut state = self.state.write().await;
        self.revert_locked(&mut state, pod).await
    }

    /// Re-compiles selector and policy maps from a changed spec and swaps
    /// them in atomically. Tracked pods and counters are preserved.
    pub async fn update_from_spec(&self, boost: &StartupCPUBoost) -> Result<(), BoxError> {
        let selector = boost
            .selector
            .compile()
            .map_err(|e| with_context(e, "failed to compile boost selector"))?;
        let resource_policies = map_resource_policies(boost)?;
        let duration_policies =
            map_duration_policies(boost, crate::cpuboost::boost::duration::system_time_source());
        let mut state = self.state.write().await;
        state.selector = selector;
        state.resource_policies = resource_policies;
        state.duration_policies = duration_policies;
        Ok(())
    }

    async fn revert_locked(&self, state: &mut RecordState, pod: &Pod) -> Result<(), BoxError> {
        if self.legacy_revert {
            self.revert_with_update(pod).await?;
        } else {
            self.revert_with_patches(pod).await?;
        }
        state.pods.remove(&pod.metadata.name);
        self.update_stats(state, None);
        Ok(())
    }

    /// Legacy mode (server < v1.32.0): mutate a deep copy and issue a full
    /// update.
    async fn revert_with_update(&self, pod: &Pod) -> Result<(), BoxError> {
        let mut updated = pod.clone();
        revert_resource_boost(&mut updated)
            .map_err(|e| with_context(e, "failed to update pod spec"))?;
        self.client
            .update_pod(&updated)
            .await
            .map_err(|e| with_context(e, "pod update failed"))?;
        Ok(())
    }

    /// Modern mode: a merge patch on the `/resize` subresource restoring the
    /// recorded quantities, then a merge patch clearing the boost label and
    /// annotation. Empty patches are success.
    async fn revert_with_patches(&self, pod: &Pod) -> Result<(), BoxError> {
        let annotation = BoostAnnotation::from_pod(pod)
            .map_err(|e| with_context(e, "pod cannot be reverted"))?;
        let namespace = &pod.metadata.namespace;
        let name = &pod.metadata.name;

        if let Some(resize_patch) = build_resize_patch(pod, &annotation) {
            self.client
                .patch_pod_resize(namespace, name, &resize_patch)
                .await
                .map_err(|e| with_context(e, "pod resize patch failed"))?;
        }
        if let Some(meta_patch) = build_metadata_patch(pod) {
            self.client
                .patch_pod(namespace, name, &meta_patch)
                .await
                .map_err(|e| with_context(e, "pod metadata patch failed"))?;
        }
        Ok(())
    }

    /// Recomputes `active` from the tracked set; an inserted pod bumps the
    /// total counter by its boosted-container count.
    fn update_stats(&self, state: &mut RecordState, inserted: Option<&Pod>) {
        let active: usize = state.pods.values().map(boost_containers_len).sum();
        state.stats.active_container_boosts = active;
        metrics::set_boost_containers_active(&self.namespace, &self.name, active as i64);
        if let Some(pod) = inserted {
            let boosted = boost_containers_len(pod);
            state.stats.total_container_boosts += boosted;
            metrics::add_boost_containers_total(&self.namespace, &self.name, boosted as u64);
        }
    }
}

fn map_resource_policies(
    boost: &StartupCPUBoost,
) -> Result<HashMap<String, ContainerPolicy>, BoxError> {
    let mut errs: Vec<BoxError> = Vec::new();
    let mut policies = HashMap::new();
    for spec in &boost.spec.resource_policy.container_policies {
        let mut policy = None;
        let mut cnt = 0;
        if let Some(fixed) = &spec.fixed_resources {
            policy = Some(ContainerPolicy::fixed(
                fixed.requests.clone(),
                fixed.limits.clone(),
            ));
            cnt += 1;
        }
        if let Some(percentage) = &spec.percentage_increase {
            policy = Some(ContainerPolicy::percentage(percentage.value));
            cnt += 1;
        }
        if let Some(auto) = &spec.auto_policy {
            policy = Some(ContainerPolicy::auto(auto.api_endpoint.clone()));
            cnt += 1;
        }
        if cnt != 1 {
            errs.push(new_error(format!(
                "invalid number of resource policies for container {}; must be one",
                spec.container_name
            )));
            continue;
        }
        policies.insert(
            spec.container_name.clone(),
            policy.expect("policy set when cnt == 1"),
        );
    }
    join_errors(errs)?;
    Ok(policies)
}

fn map_duration_policies(
    boost: &StartupCPUBoost,
    time_source: TimeSource,
) -> HashMap<String, DurationPolicy> {
    let mut policies = HashMap::new();
    let spec = &boost.spec.duration_policy;
    if let Some(fixed) = &spec.fixed {
        let duration = if fixed.unit == FIXED_DURATION_UNIT_MINUTES {
            Duration::minutes(fixed.value)
        } else {
            Duration::seconds(fixed.value)
        };
        policies.insert(
            FIXED_DURATION_POLICY_NAME.to_string(),
            DurationPolicy::fixed_with_time_source(duration, time_source.clone()),
        );
    }
    if let Some(condition) = &spec.pod_condition {
        policies.insert(
            POD_CONDITION_POLICY_NAME.to_string(),
            DurationPolicy::pod_condition(&condition.condition_type, &condition.status),
        );
    }
    if let Some(auto) = &spec.auto_policy {
        policies.insert(
            crate::cpuboost::boost::duration::AUTO_DURATION_POLICY_NAME.to_string(),
            DurationPolicy::auto_with_time_source(&auto.api_endpoint, time_source),
        );
    }
    policies
}

/// Merge patch restoring recorded CPU quantities through the `/resize`
/// subresource. `None` when the annotation holds nothing to restore.
fn build_resize_patch(pod: &Pod, annotation: &BoostAnnotation) -> Option<Value> {
    let mut containers = Vec::new();
    for container in &pod.spec.containers {
        let mut resources = Map::new();
        if let Some(request) = annotation.init_cpu_requests.get(&container.name) {
            resources.insert("requests".to_string(), json!({ "cpu": request }));
        }
        if let Some(limit) = annotation.init_cpu_limits.get(&container.name) {
            resources.insert("limits".to_string(), json!({ "cpu": limit }));
        }
        if resources.is_empty() {
            continue;
        }
        containers.push(json!({
            "name": container.name,
            "resources": Value::Object(resources),
        }));
    }
    if containers.is_empty() {
        return None;
    }
    Some(json!({ "spec": { "containers": containers } }))
}

/// Merge patch clearing the boost label and annotation. `None` when the pod
/// carries neither.
fn build_metadata_patch(pod: &Pod) -> Option<Value> {
    let mut metadata = Map::new();
    if pod.metadata.labels.contains_key(BOOST_LABEL_KEY) {
        metadata.insert("labels".to_string(), json!({ BOOST_LABEL_KEY: null }));
    }
    if pod.metadata.annotations.contains_key(BOOST_ANNOTATION_KEY) {
        metadata.insert("annotations".to_string(), json!({ BOOST_ANNOTATION_KEY: null }));
    }
    if metadata.is_empty() {
        return None;
    }
    Some(Value::Object(Map::from_iter([(
        "metadata".to_string(),
        Value::Object(metadata),
    )])))
}
