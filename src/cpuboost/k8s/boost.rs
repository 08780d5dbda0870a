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

use crate::cpuboost::k8s::pod::ObjectMeta;
use crate::cpuboost::k8s::quantity::Quantity;
use crate::cpuboost::k8s::selector::LabelSelector;

pub const BOOST_API_VERSION: &str = "autoscaling.x-k8s.io/v1alpha1";
pub const BOOST_KIND: &str = "StartupCPUBoost";

pub const FIXED_DURATION_UNIT_SECONDS: &str = "Seconds";
pub const FIXED_DURATION_UNIT_MINUTES: &str = "Minutes";

/// Fixed wall-clock duration policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixedDurationPolicySpec {
    /// `Seconds` or `Minutes`.
    pub unit: String,
    pub value: i64,
}

/// Boost terminates once the named pod condition reaches the given status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodConditionDurationPolicySpec {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

/// Duration determined by an external prediction endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoDurationPolicySpec {
    #[serde(rename = "apiEndpoint")]
    pub api_endpoint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DurationPolicySpec {
    #[serde(rename = "fixedDuration", skip_serializing_if = "Option::is_none")]
    pub fixed: Option<FixedDurationPolicySpec>,
    #[serde(rename = "podCondition", skip_serializing_if = "Option::is_none")]
    pub pod_condition: Option<PodConditionDurationPolicySpec>,
    #[serde(rename = "autoPolicy", skip_serializing_if = "Option::is_none")]
    pub auto_policy: Option<AutoDurationPolicySpec>,
}

/// CPU resource policy setting requests and limits to absolute values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixedResourcesSpec {
    pub requests: Quantity,
    #[serde(default)]
    pub limits: Quantity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PercentageIncreaseSpec {
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoResourcePolicySpec {
    #[serde(rename = "apiEndpoint")]
    pub api_endpoint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerPolicySpec {
    #[serde(rename = "containerName")]
    pub container_name: String,
    #[serde(rename = "percentageIncrease", skip_serializing_if = "Option::is_none")]
    pub percentage_increase: Option<PercentageIncreaseSpec>,
    #[serde(rename = "fixedResources", skip_serializing_if = "Option::is_none")]
    pub fixed_resources: Option<FixedResourcesSpec>,
    #[serde(rename = "autoPolicy", skip_serializing_if = "Option::is_none")]
    pub auto_policy: Option<AutoResourcePolicySpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourcePolicySpec {
    #[serde(
        rename = "containerPolicies",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub container_policies: Vec<ContainerPolicySpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StartupCPUBoostSpec {
    #[serde(rename = "resourcePolicy", default)]
    pub resource_policy: ResourcePolicySpec,
    #[serde(rename = "durationPolicy", default)]
    pub duration_policy: DurationPolicySpec,
}

/// Observed-state condition keyed by `condition_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StartupCPUBoostStatus {
    #[serde(rename = "activeContainerBoosts", default)]
    pub active_container_boosts: i32,
    #[serde(rename = "totalContainerBoosts", default)]
    pub total_container_boosts: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl StartupCPUBoostStatus {
    /// Inserts or updates the condition with the same type. The transition
    /// time only moves when the status value changes.
    pub fn set_condition(&mut self, mut condition: Condition) {
        if condition.last_transition_time.is_none() {
            condition.last_transition_time = Some(Utc::now());
        }
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// The StartupCPUBoost object (group `autoscaling.x-k8s.io`, `v1alpha1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupCPUBoost {
    #[serde(rename = "apiVersion", default = "boost_api_version")]
    pub api_version: String,
    #[serde(default = "boost_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub spec: StartupCPUBoostSpec,
    #[serde(default)]
    pub status: StartupCPUBoostStatus,
}

fn boost_api_version() -> String {
    BOOST_API_VERSION.to_string()
}

fn boost_kind() -> String {
    BOOST_KIND.to_string()
}

impl Default for StartupCPUBoost {
    fn default() -> Self {
        StartupCPUBoost {
            api_version: boost_api_version(),
            kind: boost_kind(),
            metadata: ObjectMeta::default(),
            selector: LabelSelector::default(),
            spec: StartupCPUBoostSpec::default(),
            status: StartupCPUBoostStatus::default(),
        }
    }
}

impl StartupCPUBoost {
    /// Programmatic validation on top of the declarative schema. Returns the
    /// list of field-path violations, empty when the object is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for (i, policy) in self.spec.resource_policy.container_policies.iter().enumerate() {
            let mut cnt = 0;
            if policy.percentage_increase.is_some() {
                cnt += 1;
            }
            if policy.fixed_resources.is_some() {
                cnt += 1;
            }
            if policy.auto_policy.is_some() {
                cnt += 1;
            }
            if cnt != 1 {
                violations.push(format!(
                    "spec.resourcePolicy.containerPolicies[{}]: one type of resource policy should be defined",
                    i
                ));
            }
            if let Some(percentage) = &policy.percentage_increase {
                if percentage.value < 1 {
                    violations.push(format!(
                        "spec.resourcePolicy.containerPolicies[{}].percentageIncrease.value: must be at least 1",
                        i
                    ));
                }
            }
        }
        let duration = &self.spec.duration_policy;
        let duration_cnt = duration.fixed.is_some() as usize
            + duration.pod_condition.is_some() as usize
            + duration.auto_policy.is_some() as usize;
        if duration_cnt == 0 {
            violations.push(
                "spec.durationPolicy: at least one type of duration policy should be defined"
                    .to_string(),
            );
        }
        if let Some(fixed) = &duration.fixed {
            if fixed.unit != FIXED_DURATION_UNIT_SECONDS && fixed.unit != FIXED_DURATION_UNIT_MINUTES
            {
                violations.push(format!(
                    "spec.durationPolicy.fixedDuration.unit: unsupported unit {}",
                    fixed.unit
                ));
            }
            if fixed.value < 1 {
                violations.push(
                    "spec.durationPolicy.fixedDuration.value: must be at least 1".to_string(),
                );
            }
        }
        violations
    }
}
