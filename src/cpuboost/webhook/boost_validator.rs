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

use crate::cpuboost::k8s::boost::StartupCPUBoost;
use crate::cpuboost::logger::log_debug;
use crate::cpuboost::webhook::AdmissionReview;

const COMPONENT: &str = "boost-validate-webhook";
const DELETE_OPERATION: &str = "DELETE";

/// Validating admission for StartupCPUBoost objects: programmatic checks on
/// top of the declarative schema. Create and update are validated, delete is
/// always allowed.
pub struct BoostValidator;

impl BoostValidator {
    pub fn validate(&self, review: AdmissionReview) -> AdmissionReview {
        let Some(request) = review.request else {
            return AdmissionReview::allowed("", vec!["admission request is missing".to_string()]);
        };
        let uid = request.uid.clone();
        if request.operation == DELETE_OPERATION {
            return AdmissionReview::allowed(&uid, vec![]);
        }
        let boost: StartupCPUBoost = match serde_json::from_value(request.object) {
            Ok(boost) => boost,
            Err(err) => {
                return AdmissionReview::denied(
                    &uid,
                    &format!("failed to decode StartupCPUBoost: {}", err),
                );
            }
        };
        log_debug(
            COMPONENT,
            "handling validation",
            &[
                ("name", &boost.metadata.name),
                ("namespace", &boost.metadata.namespace),
                ("operation", &request.operation),
            ],
        );
        let violations = boost.validate();
        if violations.is_empty() {
            AdmissionReview::allowed(&uid, vec![])
        } else {
            AdmissionReview::denied(&uid, &violations.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuboost::test_support::percentage_boost;
    use crate::cpuboost::webhook::AdmissionRequest;

    fn review_for(boost: &StartupCPUBoost, operation: &str) -> AdmissionReview {
        AdmissionReview {
            api_version: "admission.k8s.io/v1".to_string(),
            kind: "AdmissionReview".to_string(),
            request: Some(AdmissionRequest {
                uid: "uid-1".to_string(),
                operation: operation.to_string(),
                object: serde_json::to_value(boost).unwrap(),
                ..Default::default()
            }),
            response: None,
        }
    }

    #[test]
    fn valid_boost_is_allowed() {
        let boost = percentage_boost("demo", "b1", "app", "main", 120, 60);
        let review = BoostValidator.validate(review_for(&boost, "CREATE"));
        assert!(review.response.unwrap().allowed);
    }

    #[test]
    fn ambiguous_container_policy_is_denied() {
        let mut boost = percentage_boost("demo", "b1", "app", "main", 120, 60);
        boost.spec.resource_policy.container_policies[0].auto_policy = Some(
            crate::cpuboost::k8s::boost::AutoResourcePolicySpec {
                api_endpoint: "http://oracle".to_string(),
            },
        );
        let review = BoostValidator.validate(review_for(&boost, "UPDATE"));
        let response = review.response.unwrap();
        assert!(!response.allowed);
        assert!(response
            .status
            .unwrap()
            .message
            .contains("containerPolicies[0]"));
    }

    #[test]
    fn missing_duration_policy_is_denied() {
        let mut boost = percentage_boost("demo", "b1", "app", "main", 120, 60);
        boost.spec.duration_policy = Default::default();
        let review = BoostValidator.validate(review_for(&boost, "CREATE"));
        assert!(!review.response.unwrap().allowed);
    }

    #[test]
    fn delete_is_always_allowed() {
        let mut boost = percentage_boost("demo", "b1", "app", "main", 120, 60);
        boost.spec.duration_policy = Default::default();
        let review = BoostValidator.validate(review_for(&boost, "DELETE"));
        assert!(review.response.unwrap().allowed);
    }
}
