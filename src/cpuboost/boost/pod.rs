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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cpuboost::k8s::pod::{Pod, RESOURCE_CPU};
use crate::cpuboost::k8s::quantity::Quantity;
use crate::cpuboost::util::error::{new_error, with_context, BoxError};

/// Label carrying the governing boost's name, set at admission and removed
/// on revert.
pub const BOOST_LABEL_KEY: &str = "autoscaling.x-k8s.io/startup-cpu-boost";
/// Annotation carrying the revert metadata. Same key as the label, different
/// namespace on the object.
pub const BOOST_ANNOTATION_KEY: &str = "autoscaling.x-k8s.io/startup-cpu-boost";

/// Revert metadata stamped on every boosted pod. The annotation is the sole
/// source of truth for revert values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoostAnnotation {
    #[serde(rename = "timestamp")]
    pub boost_timestamp: DateTime<Utc>,
    #[serde(rename = "initCPURequests", default)]
    pub init_cpu_requests: HashMap<String, String>,
    #[serde(rename = "initCPULimits", default)]
    pub init_cpu_limits: HashMap<String, String>,
}

impl BoostAnnotation {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        BoostAnnotation {
            boost_timestamp: timestamp,
            init_cpu_requests: HashMap::new(),
            init_cpu_limits: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.init_cpu_requests.is_empty() && self.init_cpu_limits.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("boost annotation serializes to JSON")
    }

    pub fn from_pod(pod: &Pod) -> Result<BoostAnnotation, BoxError> {
        let data = pod
            .metadata
            .annotations
            .get(BOOST_ANNOTATION_KEY)
            .ok_or_else(|| new_error("boost annotation not found"))?;
        serde_json::from_str(data)
            .map_err(|e| with_context(e, "failed to decode boost annotation"))
    }
}

/// Name of the boost governing this pod, taken from the selector label.
pub fn boost_name_from_pod(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .get(BOOST_LABEL_KEY)
        .map(String::as_str)
}

/// Number of containers whose CPU resources were raised on this pod.
pub fn boost_containers_len(pod: &Pod) -> usize {
    BoostAnnotation::from_pod(pod)
        .map(|annotation| annotation.init_cpu_requests.len())
        .unwrap_or(0)
}

/// Restores the pod's container CPU requests and limits to the values
/// recorded in the boost annotation and clears the boost label and
/// annotation. The pod is mutated in place; callers issue the update.
pub fn revert_resource_boost(pod: &mut Pod) -> Result<(), BoxError> {
    let annotation = BoostAnnotation::from_pod(pod)
        .map_err(|e| with_context(e, "failed to get boost annotation from pod"))?;
    pod.metadata.labels.remove(BOOST_LABEL_KEY);
    pod.metadata.annotations.remove(BOOST_ANNOTATION_KEY);
    for container in &mut pod.spec.containers {
        if let Some(request) = annotation.init_cpu_requests.get(&container.name) {
            let quantity = Quantity::parse(request)
                .map_err(|e| with_context(e, "failed to parse init CPU request"))?;
            container
                .resources
                .requests
                .insert(RESOURCE_CPU.to_string(), quantity);
        }
        if let Some(limit) = annotation.init_cpu_limits.get(&container.name) {
            let quantity = Quantity::parse(limit)
                .map_err(|e| with_context(e, "failed to parse init CPU limit"))?;
            container
                .resources
                .limits
                .insert(RESOURCE_CPU.to_string(), quantity);
        }
    }
    Ok(())
}
