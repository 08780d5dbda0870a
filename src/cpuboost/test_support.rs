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

//! Shared fixtures for unit and integration tests: an in-memory cluster
//! client that records every write, and builders for pods and boost objects.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cpuboost::k8s::boost::{
    ContainerPolicySpec, DurationPolicySpec, FixedDurationPolicySpec, PercentageIncreaseSpec,
    ResourcePolicySpec, StartupCPUBoost, StartupCPUBoostSpec, FIXED_DURATION_UNIT_SECONDS,
};
use crate::cpuboost::k8s::client::{ApiError, ApiResult, ClusterClient};
use crate::cpuboost::k8s::pod::{
    Container, ObjectMeta, Pod, PodCondition, PodSpec, PodStatus, ResourceRequirements,
    RESOURCE_CPU,
};
use crate::cpuboost::k8s::quantity::Quantity;
use crate::cpuboost::k8s::selector::LabelSelector;

#[derive(Default)]
struct FakeClusterState {
    pods: HashMap<(String, String), Pod>,
    boosts: HashMap<(String, String), StartupCPUBoost>,
    resize_patches: Vec<(String, String, Value)>,
    pod_patches: Vec<(String, String, Value)>,
    pod_updates: Vec<Pod>,
    status_updates: Vec<StartupCPUBoost>,
    failing_pods: HashSet<String>,
    conflicting_status_updates: u32,
    server_version: String,
    metrics_text: String,
}

/// In-memory `ClusterClient` that records writes and can be scripted to fail
/// specific pods or status updates.
pub struct FakeClusterClient {
    state: Mutex<FakeClusterState>,
}

impl Default for FakeClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClusterClient {
    pub fn new() -> Self {
        FakeClusterClient {
            state: Mutex::new(FakeClusterState {
                server_version: "v1.32.0".to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn put_pod(&self, pod: Pod) {
        let key = (pod.metadata.namespace.clone(), pod.metadata.name.clone());
        self.state.lock().unwrap().pods.insert(key, pod);
    }

    pub fn put_boost(&self, boost: StartupCPUBoost) {
        let key = (
            boost.metadata.namespace.clone(),
            boost.metadata.name.clone(),
        );
        self.state.lock().unwrap().boosts.insert(key, boost);
    }

    /// All writes against the named pod fail with a transient API error
    /// until `heal_pod` is called.
    pub fn fail_pod_writes(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_pods
            .insert(name.to_string());
    }

    pub fn heal_pod(&self, name: &str) {
        self.state.lock().unwrap().failing_pods.remove(name);
    }

    /// The next `count` status updates answer with a conflict.
    pub fn conflict_on_status_updates(&self, count: u32) {
        self.state.lock().unwrap().conflicting_status_updates = count;
    }

    pub fn set_server_version(&self, version: &str) {
        self.state.lock().unwrap().server_version = version.to_string();
    }

    pub fn set_metrics_text(&self, text: &str) {
        self.state.lock().unwrap().metrics_text = text.to_string();
    }

    pub fn resize_patches(&self) -> Vec<(String, String, Value)> {
        self.state.lock().unwrap().resize_patches.clone()
    }

    pub fn pod_patches(&self) -> Vec<(String, String, Value)> {
        self.state.lock().unwrap().pod_patches.clone()
    }

    pub fn pod_updates(&self) -> Vec<Pod> {
        self.state.lock().unwrap().pod_updates.clone()
    }

    pub fn status_updates(&self) -> Vec<StartupCPUBoost> {
        self.state.lock().unwrap().status_updates.clone()
    }

    fn check_pod_writable(state: &FakeClusterState, name: &str) -> ApiResult<()> {
        if state.failing_pods.contains(name) {
            return Err(ApiError::Api {
                status: 500,
                message: format!("scripted failure for pod {}", name),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> ApiResult<Pod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn update_pod(&self, pod: &Pod) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_pod_writable(&state, &pod.metadata.name)?;
        let key = (pod.metadata.namespace.clone(), pod.metadata.name.clone());
        if !state.pods.contains_key(&key) {
            return Err(ApiError::NotFound);
        }
        state.pods.insert(key, pod.clone());
        state.pod_updates.push(pod.clone());
        Ok(())
    }

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_pod_writable(&state, name)?;
        state
            .pod_patches
            .push((namespace.to_string(), name.to_string(), patch.clone()));
        Ok(())
    }

    async fn patch_pod_resize(&self, namespace: &str, name: &str, patch: &Value) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_pod_writable(&state, name)?;
        state
            .resize_patches
            .push((namespace.to_string(), name.to_string(), patch.clone()));
        Ok(())
    }

    async fn get_boost(&self, namespace: &str, name: &str) -> ApiResult<StartupCPUBoost> {
        self.state
            .lock()
            .unwrap()
            .boosts
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn update_boost_status(&self, boost: &StartupCPUBoost) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.conflicting_status_updates > 0 {
            state.conflicting_status_updates -= 1;
            return Err(ApiError::Conflict("scripted status conflict".to_string()));
        }
        let key = (
            boost.metadata.namespace.clone(),
            boost.metadata.name.clone(),
        );
        if let Some(existing) = state.boosts.get_mut(&key) {
            existing.status = boost.status.clone();
        } else {
            return Err(ApiError::NotFound);
        }
        state.status_updates.push(boost.clone());
        Ok(())
    }

    async fn server_version(&self) -> ApiResult<String> {
        Ok(self.state.lock().unwrap().server_version.clone())
    }

    async fn raw_metrics(&self) -> ApiResult<String> {
        Ok(self.state.lock().unwrap().metrics_text.clone())
    }
}

/// Pod builder used across the test suites.
pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        PodBuilder {
            pod: Pod {
                metadata: ObjectMeta {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    creation_timestamp: Some(Utc::now()),
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    pub fn created_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.pod.metadata.creation_timestamp = Some(timestamp);
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.pod
            .metadata
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.pod
            .metadata
            .annotations
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn container(mut self, name: &str, requests: Option<&str>, limits: Option<&str>) -> Self {
        let mut resources = ResourceRequirements::default();
        if let Some(requests) = requests {
            resources.requests.insert(
                RESOURCE_CPU.to_string(),
                Quantity::parse(requests).expect("request quantity"),
            );
        }
        if let Some(limits) = limits {
            resources.limits.insert(
                RESOURCE_CPU.to_string(),
                Quantity::parse(limits).expect("limit quantity"),
            );
        }
        self.pod.spec.containers.push(Container {
            name: name.to_string(),
            resources,
            ..Default::default()
        });
        self
    }

    pub fn condition(mut self, condition_type: &str, status: &str) -> Self {
        let status_block = self.pod.status.get_or_insert_with(PodStatus::default);
        status_block.conditions.push(PodCondition {
            condition_type: condition_type.to_string(),
            status: status.to_string(),
            last_transition_time: None,
        });
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }
}

/// Minimal boost object: selector on `app=<app>`, one percentage container
/// policy, fixed duration in seconds.
pub fn percentage_boost(
    namespace: &str,
    name: &str,
    app: &str,
    container: &str,
    percent: i64,
    duration_sec: i64,
) -> StartupCPUBoost {
    StartupCPUBoost {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        },
        selector: LabelSelector {
            match_labels: HashMap::from([("app".to_string(), app.to_string())]),
            ..Default::default()
        },
        spec: StartupCPUBoostSpec {
            resource_policy: ResourcePolicySpec {
                container_policies: vec![ContainerPolicySpec {
                    container_name: container.to_string(),
                    percentage_increase: Some(PercentageIncreaseSpec { value: percent }),
                    ..Default::default()
                }],
            },
            duration_policy: DurationPolicySpec {
                fixed: Some(FixedDurationPolicySpec {
                    unit: FIXED_DURATION_UNIT_SECONDS.to_string(),
                    value: duration_sec,
                }),
                ..Default::default()
            },
        },
        ..Default::default()
    }
}
