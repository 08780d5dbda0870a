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

use std::sync::Arc;

use serde_json::{json, Value};

use crate::cpuboost::boost::duration::{system_time_source, TimeSource};
use crate::cpuboost::boost::manager::BoostManager;
use crate::cpuboost::boost::pod::{BoostAnnotation, BOOST_ANNOTATION_KEY, BOOST_LABEL_KEY};
use crate::cpuboost::boost::record::BoostRecord;
use crate::cpuboost::k8s::pod::{Pod, RESOURCE_CPU};
use crate::cpuboost::logger::{log_debug, log_warn};
use crate::cpuboost::webhook::qos::compute_pod_qos;
use crate::cpuboost::webhook::AdmissionReview;

const COMPONENT: &str = "cpuboost-webhook";

/// Mutating admission handler for pod creation. Raises container CPU
/// resources per the matching boost's policies and stamps the revert
/// metadata. Never blocks pod creation: every internal failure admits the
/// pod unchanged with a warning.
pub struct PodMutator {
    manager: Arc<BoostManager>,
    remove_limits: bool,
    pod_level_resources: bool,
    now: TimeSource,
}

impl PodMutator {
    pub fn new(manager: Arc<BoostManager>, remove_limits: bool, pod_level_resources: bool) -> Self {
        Self::with_time_source(
            manager,
            remove_limits,
            pod_level_resources,
            system_time_source(),
        )
    }

    pub fn with_time_source(
        manager: Arc<BoostManager>,
        remove_limits: bool,
        pod_level_resources: bool,
        now: TimeSource,
    ) -> Self {
        PodMutator {
            manager,
            remove_limits,
            pod_level_resources,
            now,
        }
    }

    pub async fn mutate(&self, review: AdmissionReview) -> AdmissionReview {
        let Some(request) = review.request else {
            return AdmissionReview::allowed("", vec!["admission request is missing".to_string()]);
        };
        let uid = request.uid.clone();
        let pod: Pod = match serde_json::from_value(request.object) {
            Ok(pod) => pod,
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "failed to decode pod, admitting unchanged",
                    &[("error", &err.to_string())],
                );
                return AdmissionReview::allowed(
                    &uid,
                    vec![format!("startup cpu boost skipped: {}", err)],
                );
            }
        };
        log_debug(
            COMPONENT,
            "handling pod",
            &[
                ("pod", &pod.metadata.name),
                ("namespace", &pod.metadata.namespace),
            ],
        );

        let Some(boost) = self.manager.get_boost_for_pod(&pod).await else {
            log_debug(COMPONENT, "no matching boost found", &[]);
            return AdmissionReview::allowed(&uid, vec![]);
        };

        let (mutated, annotation) = self.boost_containers(&pod, &boost).await;
        if annotation.is_empty() {
            log_debug(COMPONENT, "no suitable CPU resources were found", &[]);
            return AdmissionReview::allowed(&uid, vec![]);
        }

        let mut mutated = mutated;
        mutated
            .metadata
            .labels
            .insert(BOOST_LABEL_KEY.to_string(), boost.name().to_string());
        mutated
            .metadata
            .annotations
            .insert(BOOST_ANNOTATION_KEY.to_string(), annotation.to_json());

        let ops = match build_patch_ops(&mutated) {
            Ok(ops) => ops,
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "failed to build admission patch, admitting unchanged",
                    &[("error", &err)],
                );
                return AdmissionReview::allowed(
                    &uid,
                    vec![format!("startup cpu boost skipped: {}", err)],
                );
            }
        };
        AdmissionReview::patched(&uid, &ops)
    }

    /// Applies the boost's resource policies container by container against
    /// a working copy of the pod, collecting the original CPU quantity
    /// strings for every container that actually changed.
    async fn boost_containers(&self, pod: &Pod, boost: &BoostRecord) -> (Pod, BoostAnnotation) {
        let mut working = pod.clone();
        let mut annotation = BoostAnnotation::new((self.now)());

        for index in 0..working.spec.containers.len() {
            let container = working.spec.containers[index].clone();
            let Some(policy) = boost.resource_policy(&container.name).await else {
                continue;
            };
            if container.resources.requests.get(RESOURCE_CPU).is_none()
                && container.resources.limits.get(RESOURCE_CPU).is_none()
            {
                log_debug(
                    COMPONENT,
                    "container has no CPU resources, skipping",
                    &[("container", &container.name)],
                );
                continue;
            }
            if container.cpu_resize_requires_restart() {
                log_debug(
                    COMPONENT,
                    "container resize policy requires restart, skipping",
                    &[("container", &container.name)],
                );
                continue;
            }
            let Some(mut new_resources) = policy.new_resources(pod, &container).await else {
                continue;
            };
            if new_resources == container.resources {
                continue;
            }

            let mut candidate = working.clone();
            candidate.spec.containers[index].resources = new_resources.clone();
            let qos_before = compute_pod_qos(&working, self.pod_level_resources);
            let qos_after = compute_pod_qos(&candidate, self.pod_level_resources);
            if qos_before != qos_after {
                log_debug(
                    COMPONENT,
                    "boost would change pod QoS class, skipping container",
                    &[("container", &container.name)],
                );
                continue;
            }

            if let Some(request) = container.resources.requests.get(RESOURCE_CPU) {
                annotation
                    .init_cpu_requests
                    .insert(container.name.clone(), request.to_string());
            }
            if let Some(limit) = container.resources.limits.get(RESOURCE_CPU) {
                annotation
                    .init_cpu_limits
                    .insert(container.name.clone(), limit.to_string());
            }
            if self.remove_limits {
                new_resources.limits.remove(RESOURCE_CPU);
            }
            working.spec.containers[index].resources = new_resources;
        }
        (working, annotation)
    }
}

/// RFC 6902 operations replacing the container list and the metadata maps.
fn build_patch_ops(mutated: &Pod) -> Result<Vec<Value>, String> {
    let containers =
        serde_json::to_value(&mutated.spec.containers).map_err(|e| e.to_string())?;
    let labels = serde_json::to_value(&mutated.metadata.labels).map_err(|e| e.to_string())?;
    let annotations =
        serde_json::to_value(&mutated.metadata.annotations).map_err(|e| e.to_string())?;
    Ok(vec![
        json!({"op": "replace", "path": "/spec/containers", "value": containers}),
        json!({"op": "add", "path": "/metadata/labels", "value": labels}),
        json!({"op": "add", "path": "/metadata/annotations", "value": annotations}),
    ])
}
