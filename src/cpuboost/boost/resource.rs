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
use std::time::Duration as StdDuration;

use serde::Deserialize;

use crate::cpuboost::k8s::pod::{Container, Pod, ResourceRequirements, RESOURCE_CPU};
use crate::cpuboost::k8s::quantity::Quantity;
use crate::cpuboost::logger::{log_debug, log_warn};
use crate::cpuboost::util::error::{new_error, with_context, BoxError};

const ORACLE_TIMEOUT: StdDuration = StdDuration::from_secs(10);
const COMPONENT: &str = "resource-policy";

/// Per-container CPU resource policy. `new_resources` yields the boosted
/// requirements, or `None` when the policy has nothing to change.
#[derive(Clone)]
pub enum ContainerPolicy {
    Percentage {
        value: i64,
    },
    Fixed {
        cpu_requests: Quantity,
        cpu_limits: Quantity,
    },
    Auto {
        oracle: ResourceOracle,
    },
}

impl ContainerPolicy {
    pub fn percentage(value: i64) -> Self {
        ContainerPolicy::Percentage { value }
    }

    pub fn fixed(cpu_requests: Quantity, cpu_limits: Quantity) -> Self {
        ContainerPolicy::Fixed {
            cpu_requests,
            cpu_limits,
        }
    }

    pub fn auto(api_endpoint: impl Into<String>) -> Self {
        ContainerPolicy::Auto {
            oracle: ResourceOracle::new(api_endpoint.into()),
        }
    }

    /// Computes the container's boosted resource requirements.
    pub async fn new_resources(
        &self,
        pod: &Pod,
        container: &Container,
    ) -> Option<ResourceRequirements> {
        match self {
            ContainerPolicy::Percentage { value } => {
                let mut result = container.resources.clone();
                increase_resource(&mut result.requests, *value);
                increase_resource(&mut result.limits, *value);
                Some(result)
            }
            ContainerPolicy::Fixed {
                cpu_requests,
                cpu_limits,
            } => {
                let mut result = container.resources.clone();
                set_resource(&mut result.requests, cpu_requests);
                set_resource(&mut result.limits, cpu_limits);
                Some(result)
            }
            ContainerPolicy::Auto { oracle } => {
                let prediction = match oracle.get_prediction(pod).await {
                    Ok(prediction) => prediction,
                    Err(err) => {
                        log_warn(
                            COMPONENT,
                            "resource oracle failed, leaving container unchanged",
                            &[
                                ("pod", &pod.metadata.name),
                                ("container", &container.name),
                                ("error", &err.to_string()),
                            ],
                        );
                        return None;
                    }
                };
                let mut result = container.resources.clone();
                set_resource(&mut result.requests, &prediction.cpu_requests);
                set_resource(&mut result.limits, &prediction.cpu_limits);
                Some(result)
            }
        }
    }
}

fn increase_resource(resources: &mut HashMap<String, Quantity>, percent: i64) {
    if let Some(quantity) = resources.get(RESOURCE_CPU) {
        let increased = quantity.increase_by_percent(percent);
        resources.insert(RESOURCE_CPU.to_string(), increased);
    }
}

/// Applies a fixed target to a present CPU entry. Zero targets and targets
/// below the container's current value leave the entry untouched.
fn set_resource(resources: &mut HashMap<String, Quantity>, target: &Quantity) {
    if target.is_zero() {
        return;
    }
    let Some(current) = resources.get(RESOURCE_CPU) else {
        return;
    };
    if target < current {
        log_debug(
            COMPONENT,
            "container has higher CPU resources than policy",
            &[("target", &target.to_string())],
        );
        return;
    }
    resources.insert(RESOURCE_CPU.to_string(), target.clone());
}

struct ResourcePredictionQuantities {
    cpu_requests: Quantity,
    cpu_limits: Quantity,
}

#[derive(Deserialize)]
struct ResourcePrediction {
    #[serde(rename = "cpuRequests")]
    cpu_requests: String,
    #[serde(rename = "cpuLimits")]
    cpu_limits: String,
}

/// HTTP client for the external resource prediction endpoint. The pod is
/// posted as JSON; the response carries `{cpuRequests, cpuLimits}`.
#[derive(Clone)]
pub struct ResourceOracle {
    api_endpoint: String,
    client: reqwest::Client,
}

impl ResourceOracle {
    pub fn new(api_endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ORACLE_TIMEOUT)
            .build()
            .unwrap_or_default();
        ResourceOracle {
            api_endpoint,
            client,
        }
    }

    pub fn api_endpoint(&self) -> &str {
        &self.api_endpoint
    }

    async fn get_prediction(&self, pod: &Pod) -> Result<ResourcePredictionQuantities, BoxError> {
        let response = self
            .client
            .post(&self.api_endpoint)
            .json(pod)
            .send()
            .await
            .map_err(|e| with_context(e, "resource oracle request failed"))?;
        if !response.status().is_success() {
            return Err(new_error(format!(
                "resource oracle returned status {}",
                response.status()
            )));
        }
        let prediction: ResourcePrediction = response
            .json()
            .await
            .map_err(|e| with_context(e, "failed to decode resource prediction"))?;
        let cpu_requests = Quantity::parse(&prediction.cpu_requests)
            .map_err(|e| with_context(e, "failed to parse predicted CPU requests"))?;
        let cpu_limits = Quantity::parse(&prediction.cpu_limits)
            .map_err(|e| with_context(e, "failed to parse predicted CPU limits"))?;
        Ok(ResourcePredictionQuantities {
            cpu_requests,
            cpu_limits,
        })
    }
}
