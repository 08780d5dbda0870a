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

use crate::cpuboost::k8s::pod::{Container, Pod, RESOURCE_CPU, RESOURCE_MEMORY};
use crate::cpuboost::k8s::quantity::Quantity;

/// Pod quality-of-service classification derived from container resources.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

fn is_supported_qos_resource(name: &str) -> bool {
    name == RESOURCE_CPU || name == RESOURCE_MEMORY
}

fn accumulate(totals: &mut HashMap<String, i128>, list: &HashMap<String, Quantity>) {
    for (name, quantity) in list {
        if !is_supported_qos_resource(name) || quantity.is_zero() {
            continue;
        }
        *totals.entry(name.clone()).or_insert(0) += quantity.nanos();
    }
}

fn qos_resources(list: &HashMap<String, Quantity>) -> HashSet<&str> {
    list.iter()
        .filter(|(name, quantity)| is_supported_qos_resource(name) && !quantity.is_zero())
        .map(|(name, _)| name.as_str())
        .collect()
}

fn has_cpu_and_memory(resources: &HashSet<&str>) -> bool {
    resources.contains(RESOURCE_CPU) && resources.contains(RESOURCE_MEMORY)
}

/// Determines a pod's QoS class from its container (and, when the feature is
/// enabled, pod-level) resource specifications.
///
/// BestEffort: no container sets any supported request or limit. Guaranteed:
/// every container sets equal, non-zero CPU and memory requests and limits.
/// Burstable: everything else.
pub fn compute_pod_qos(pod: &Pod, pod_level_resources_enabled: bool) -> QosClass {
    let mut requests: HashMap<String, i128> = HashMap::new();
    let mut limits: HashMap<String, i128> = HashMap::new();
    let mut is_guaranteed = true;

    let pod_level = pod
        .spec
        .resources
        .as_ref()
        .filter(|_| pod_level_resources_enabled);
    if let Some(resources) = pod_level {
        accumulate(&mut requests, &resources.requests);
        accumulate(&mut limits, &resources.limits);
        if !has_cpu_and_memory(&qos_resources(&resources.limits)) {
            is_guaranteed = false;
        }
    } else {
        let all_containers: Vec<&Container> = pod
            .spec
            .containers
            .iter()
            .chain(pod.spec.init_containers.iter())
            .collect();
        for container in all_containers {
            accumulate(&mut requests, &container.resources.requests);
            accumulate(&mut limits, &container.resources.limits);
            if !has_cpu_and_memory(&qos_resources(&container.resources.limits)) {
                is_guaranteed = false;
            }
        }
    }

    if requests.is_empty() && limits.is_empty() {
        return QosClass::BestEffort;
    }
    if is_guaranteed {
        for (name, request) in &requests {
            match limits.get(name) {
                Some(limit) if limit == request => {}
                _ => {
                    is_guaranteed = false;
                    break;
                }
            }
        }
    }
    if is_guaranteed && requests.len() == limits.len() {
        QosClass::Guaranteed
    } else {
        QosClass::Burstable
    }
}
