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

//! Admission endpoints exercised over HTTP against the real router.

use std::sync::Arc;

use serde_json::json;
use serial_test::serial;
use tokio::net::TcpListener;

use cpuboost::cpuboost::boost::manager::BoostManager;
use cpuboost::cpuboost::boost::pod::BOOST_LABEL_KEY;
use cpuboost::cpuboost::boost::record::BoostRecord;
use cpuboost::cpuboost::k8s::boost::{ContainerPolicySpec, FixedResourcesSpec};
use cpuboost::cpuboost::k8s::pod::RESOURCE_CPU;
use cpuboost::cpuboost::k8s::quantity::Quantity;
use cpuboost::cpuboost::observability::metrics;
use cpuboost::cpuboost::server::{webhook_router, MUTATE_POD_PATH, VALIDATE_BOOST_PATH};
use cpuboost::cpuboost::test_support::{percentage_boost, FakeClusterClient, PodBuilder};
use cpuboost::cpuboost::webhook::boost_validator::BoostValidator;
use cpuboost::cpuboost::webhook::pod_mutator::PodMutator;
use cpuboost::cpuboost::webhook::AdmissionReview;

use crate::support::apply_admission_patch;

async fn spawn_webhook_server(manager: Arc<BoostManager>, remove_limits: bool) -> String {
    let mutator = Arc::new(PodMutator::new(manager, remove_limits, false));
    let router = webhook_router(mutator, Arc::new(BoostValidator));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn manager_with(boost: &cpuboost::cpuboost::k8s::boost::StartupCPUBoost) -> Arc<BoostManager> {
    let client = Arc::new(FakeClusterClient::new());
    let manager = Arc::new(BoostManager::new());
    let record = Arc::new(BoostRecord::from_spec(client, boost, false).unwrap());
    manager.add_regular_boost(record).await.unwrap();
    manager
}

fn review_payload(object: serde_json::Value) -> serde_json::Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "uid-http",
            "operation": "CREATE",
            "object": object,
        }
    })
}

#[tokio::test]
#[serial]
async fn mutate_endpoint_boosts_matching_pod() {
    metrics::clear_all_metrics();
    let boost = percentage_boost("default", "b1", "foo", "container-one", 120, 60);
    let manager = manager_with(&boost).await;
    let base = spawn_webhook_server(manager, false).await;

    let pod = PodBuilder::new("default", "p1")
        .label("app", "foo")
        .container("container-one", Some("500m"), Some("1"))
        .build();
    let response = reqwest::Client::new()
        .post(format!("{}{}", base, MUTATE_POD_PATH))
        .json(&review_payload(serde_json::to_value(&pod).unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let review: AdmissionReview = response.json().await.unwrap();
    let body = review.response.as_ref().unwrap();
    assert!(body.allowed);
    assert_eq!(body.uid, "uid-http");
    let ops = review.decoded_patch().expect("patch present");

    let admitted = apply_admission_patch(&pod, &ops);
    let container = admitted.container("container-one").unwrap();
    assert_eq!(container.resources.requests[RESOURCE_CPU].to_string(), "1100m");
    assert_eq!(container.resources.limits[RESOURCE_CPU].to_string(), "2200m");
    assert_eq!(admitted.metadata.labels[BOOST_LABEL_KEY], "b1");
}

#[tokio::test]
#[serial]
async fn mutate_endpoint_ignores_unmatched_pod() {
    metrics::clear_all_metrics();
    let boost = percentage_boost("default", "b1", "foo", "container-one", 120, 60);
    let manager = manager_with(&boost).await;
    let base = spawn_webhook_server(manager, false).await;

    let pod = PodBuilder::new("default", "p1")
        .label("app", "bar")
        .container("container-one", Some("500m"), None)
        .build();
    let review: AdmissionReview = reqwest::Client::new()
        .post(format!("{}{}", base, MUTATE_POD_PATH))
        .json(&review_payload(serde_json::to_value(&pod).unwrap()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let body = review.response.as_ref().unwrap();
    assert!(body.allowed);
    assert!(body.patch.is_none());
}

/// Guaranteed pod plus a QoS-changing fixed policy: the webhook must emit no
/// patch at all.
#[tokio::test]
#[serial]
async fn mutate_endpoint_preserves_qos_class() {
    metrics::clear_all_metrics();
    let mut boost = percentage_boost("default", "b1", "foo", "container-one", 120, 60);
    boost.spec.resource_policy.container_policies = vec![ContainerPolicySpec {
        container_name: "container-one".to_string(),
        fixed_resources: Some(FixedResourcesSpec {
            requests: Quantity::parse("1").unwrap(),
            limits: Quantity::parse("2").unwrap(),
        }),
        ..Default::default()
    }];
    let manager = manager_with(&boost).await;
    let base = spawn_webhook_server(manager, false).await;

    let mut pod = PodBuilder::new("default", "p1")
        .label("app", "foo")
        .container("container-one", Some("1"), Some("1"))
        .build();
    let memory = Quantity::parse("128Mi").unwrap();
    pod.spec.containers[0]
        .resources
        .requests
        .insert("memory".to_string(), memory.clone());
    pod.spec.containers[0]
        .resources
        .limits
        .insert("memory".to_string(), memory);

    let review: AdmissionReview = reqwest::Client::new()
        .post(format!("{}{}", base, MUTATE_POD_PATH))
        .json(&review_payload(serde_json::to_value(&pod).unwrap()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(review.response.as_ref().unwrap().patch.is_none());
}

#[tokio::test]
#[serial]
async fn validate_endpoint_rejects_ambiguous_policy() {
    metrics::clear_all_metrics();
    let manager = Arc::new(BoostManager::new());
    let base = spawn_webhook_server(manager, false).await;

    let mut boost = percentage_boost("default", "b1", "foo", "container-one", 120, 60);
    boost.spec.resource_policy.container_policies[0].auto_policy = Some(
        cpuboost::cpuboost::k8s::boost::AutoResourcePolicySpec {
            api_endpoint: "http://oracle".to_string(),
        },
    );
    let review: AdmissionReview = reqwest::Client::new()
        .post(format!("{}{}", base, VALIDATE_BOOST_PATH))
        .json(&review_payload(serde_json::to_value(&boost).unwrap()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let body = review.response.as_ref().unwrap();
    assert!(!body.allowed);
    assert!(body
        .status
        .as_ref()
        .unwrap()
        .message
        .contains("one type of resource policy"));
}

#[tokio::test]
#[serial]
async fn validate_endpoint_accepts_valid_boost() {
    metrics::clear_all_metrics();
    let manager = Arc::new(BoostManager::new());
    let base = spawn_webhook_server(manager, false).await;

    let boost = percentage_boost("default", "b1", "foo", "container-one", 120, 60);
    let review: AdmissionReview = reqwest::Client::new()
        .post(format!("{}{}", base, VALIDATE_BOOST_PATH))
        .json(&review_payload(serde_json::to_value(&boost).unwrap()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(review.response.as_ref().unwrap().allowed);
}
