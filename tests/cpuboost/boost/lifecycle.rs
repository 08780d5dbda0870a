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

//! End-to-end boost lifecycle scenarios: admission, expiry, revert, status.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serial_test::serial;
use tokio_util::sync::CancellationToken;

use cpuboost::cpuboost::boost::manager::BoostManager;
use cpuboost::cpuboost::boost::pod::{
    BoostAnnotation, BOOST_ANNOTATION_KEY, BOOST_LABEL_KEY,
};
use cpuboost::cpuboost::boost::record::BoostRecord;
use cpuboost::cpuboost::controller::boost_controller::{
    BoostController, BOOST_ACTIVE_CONDITION,
};
use cpuboost::cpuboost::controller::pod_handler::PodHandler;
use cpuboost::cpuboost::k8s::boost::{
    DurationPolicySpec, PodConditionDurationPolicySpec,
};
use cpuboost::cpuboost::k8s::pod::{PodCondition, RESOURCE_CPU};
use cpuboost::cpuboost::observability::metrics;
use cpuboost::cpuboost::test_support::{percentage_boost, FakeClusterClient, PodBuilder};
use cpuboost::cpuboost::util::cluster_info::should_use_legacy_revert_mode;
use cpuboost::cpuboost::webhook::pod_mutator::PodMutator;
use cpuboost::cpuboost::webhook::{AdmissionRequest, AdmissionReview};

use crate::support::{apply_admission_patch, TestClock};

fn admission_review_for(pod: &cpuboost::cpuboost::k8s::pod::Pod) -> AdmissionReview {
    AdmissionReview {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        request: Some(AdmissionRequest {
            uid: "uid-1".to_string(),
            operation: "CREATE".to_string(),
            object: serde_json::to_value(pod).unwrap(),
            ..Default::default()
        }),
        response: None,
    }
}

/// Percentage boost with a fixed 60 s duration: admit, advance the clock
/// past the window, tick, observe the revert and the final counters.
#[tokio::test]
#[serial]
async fn percentage_boost_expires_and_reverts() {
    metrics::clear_all_metrics();
    let clock = TestClock::new(Utc::now());
    let client = Arc::new(FakeClusterClient::new());
    let manager = Arc::new(BoostManager::new());

    let boost = percentage_boost("default", "b1", "foo", "container-one", 120, 60);
    let record = Arc::new(
        BoostRecord::from_spec_with_time_source(
            client.clone(),
            &boost,
            false,
            clock.time_source(),
        )
        .unwrap(),
    );
    manager.add_regular_boost(record.clone()).await.unwrap();

    // Admission: the webhook rewrites resources and stamps metadata.
    let mutator =
        PodMutator::with_time_source(manager.clone(), false, false, clock.time_source());
    let pod = PodBuilder::new("default", "p1")
        .created_at((clock.time_source())())
        .label("app", "foo")
        .container("container-one", Some("500m"), Some("1"))
        .build();
    let review = mutator.mutate(admission_review_for(&pod)).await;
    let ops = review.decoded_patch().expect("admission patch");
    let admitted = apply_admission_patch(&pod, &ops);

    let container = admitted.container("container-one").unwrap();
    assert_eq!(container.resources.requests[RESOURCE_CPU].to_string(), "1100m");
    assert_eq!(container.resources.limits[RESOURCE_CPU].to_string(), "2200m");
    assert_eq!(admitted.metadata.labels[BOOST_LABEL_KEY], "b1");
    let annotation: BoostAnnotation =
        serde_json::from_str(&admitted.metadata.annotations[BOOST_ANNOTATION_KEY]).unwrap();
    assert_eq!(annotation.init_cpu_requests["container-one"], "500m");
    assert_eq!(annotation.init_cpu_limits["container-one"], "1");

    // The watch stream delivers the admitted pod.
    let handler = PodHandler::new(manager.clone());
    handler.handle_create(&admitted).await.unwrap();
    let stats = record.stats().await;
    assert_eq!(stats.active_container_boosts, 1);
    assert_eq!(stats.total_container_boosts, 1);

    // Inside the window nothing happens.
    let token = CancellationToken::new();
    manager.revert_expired_boosts(&token).await;
    assert!(client.resize_patches().is_empty());

    // 61 seconds later the boost expires.
    clock.advance(Duration::seconds(61));
    manager.revert_expired_boosts(&token).await;

    let resize = client.resize_patches();
    assert_eq!(resize.len(), 1);
    assert_eq!(
        resize[0].2["spec"]["containers"][0]["resources"]["requests"]["cpu"],
        serde_json::json!("500m")
    );
    assert_eq!(
        resize[0].2["spec"]["containers"][0]["resources"]["limits"]["cpu"],
        serde_json::json!("1")
    );
    let meta = client.pod_patches();
    assert_eq!(meta.len(), 1);
    assert_eq!(meta[0].2["metadata"]["labels"][BOOST_LABEL_KEY], serde_json::json!(null));

    let stats = record.stats().await;
    assert_eq!(stats.total_container_boosts, 1);
    assert_eq!(stats.active_container_boosts, 0);
}

/// Pod-condition termination: the revert happens inline on the pod-update
/// event that carries the matching condition.
#[tokio::test]
#[serial]
async fn pod_condition_terminates_boost_on_update_event() {
    metrics::clear_all_metrics();
    let client = Arc::new(FakeClusterClient::new());
    let manager = Arc::new(BoostManager::new());

    let mut boost = percentage_boost("default", "b2", "foo", "container-one", 120, 60);
    boost.spec.duration_policy = DurationPolicySpec {
        pod_condition: Some(PodConditionDurationPolicySpec {
            condition_type: "Ready".to_string(),
            status: "True".to_string(),
        }),
        ..Default::default()
    };
    let record = Arc::new(BoostRecord::from_spec(client.clone(), &boost, false).unwrap());
    manager.add_regular_boost(record.clone()).await.unwrap();

    let mut annotation = BoostAnnotation::new(Utc::now());
    annotation
        .init_cpu_requests
        .insert("container-one".to_string(), "500m".to_string());
    let pod = PodBuilder::new("default", "p1")
        .label("app", "foo")
        .label(BOOST_LABEL_KEY, "b2")
        .annotation(BOOST_ANNOTATION_KEY, &annotation.to_json())
        .container("container-one", Some("1100m"), None)
        .build();

    let handler = PodHandler::new(manager.clone());
    handler.handle_create(&pod).await.unwrap();
    assert_eq!(record.stats().await.active_container_boosts, 1);
    assert!(client.resize_patches().is_empty());

    let mut ready = pod.clone();
    ready
        .status
        .get_or_insert_with(Default::default)
        .conditions
        .push(PodCondition {
            condition_type: "Ready".to_string(),
            status: "True".to_string(),
            last_transition_time: None,
        });
    handler.handle_update(&pod, &ready).await;

    assert_eq!(client.resize_patches().len(), 1, "revert ran inline");
    assert_eq!(record.stats().await.active_container_boosts, 0);
    assert!(record.pod("p1").await.is_none());
}

/// Orphan promotion: a pod seen before its boost exists is parked, then
/// adopted the moment the boost registers.
#[tokio::test]
#[serial]
async fn orphan_pod_is_promoted_when_boost_arrives() {
    metrics::clear_all_metrics();
    let client = Arc::new(FakeClusterClient::new());
    let manager = Arc::new(BoostManager::new());
    let controller = BoostController::new(client.clone(), manager.clone(), false);
    let handler = PodHandler::new(manager.clone());

    let mut annotation = BoostAnnotation::new(Utc::now());
    annotation
        .init_cpu_requests
        .insert("container-one".to_string(), "250m".to_string());
    let pod = PodBuilder::new("default", "p2")
        .label("app", "foo")
        .label(BOOST_LABEL_KEY, "b3")
        .annotation(BOOST_ANNOTATION_KEY, &annotation.to_json())
        .container("container-one", Some("550m"), None)
        .build();
    assert!(handler.handle_create(&pod).await.is_none());
    assert_eq!(manager.orphaned_pod_count("default").await, 1);

    let boost = percentage_boost("default", "b3", "foo", "container-one", 120, 60);
    client.put_boost(boost.clone());
    controller.handle_create(&boost).await;

    assert_eq!(manager.orphaned_pod_count("default").await, 0);
    let record = manager.get_regular_boost("default", "b3").await.unwrap();
    assert!(record.pod("p2").await.is_some());
    assert_eq!(record.stats().await.active_container_boosts, 1);

    // Deleting the boost discards its pods entirely.
    controller.handle_delete(&boost).await;
    assert!(manager.get_regular_boost("default", "b3").await.is_none());
    assert_eq!(manager.orphaned_pod_count("default").await, 0);
}

/// Ten pods expire in one tick; two patches fail transiently. Eight reverts
/// land, one deduplicated reconciliation request updates the status, and the
/// next tick cleans up the stragglers.
#[tokio::test]
#[serial]
async fn revert_batch_with_transient_failures_converges() {
    metrics::clear_all_metrics();
    let client = Arc::new(FakeClusterClient::new());
    let manager = Arc::new(BoostManager::new());
    let controller = Arc::new(BoostController::new(client.clone(), manager.clone(), false));
    manager.set_reconciler(controller.clone()).await;

    let boost = percentage_boost("default", "b4", "foo", "container-one", 120, 60);
    client.put_boost(boost.clone());
    controller.handle_create(&boost).await;

    let handler = PodHandler::new(manager.clone());
    for i in 0..10 {
        let mut annotation = BoostAnnotation::new(Utc::now());
        annotation
            .init_cpu_requests
            .insert("container-one".to_string(), "500m".to_string());
        let pod = PodBuilder::new("default", &format!("p{}", i))
            .created_at(Utc::now() - Duration::seconds(120))
            .label("app", "foo")
            .label(BOOST_LABEL_KEY, "b4")
            .annotation(BOOST_ANNOTATION_KEY, &annotation.to_json())
            .container("container-one", Some("1100m"), None)
            .build();
        handler.handle_create(&pod).await.unwrap();
    }
    client.fail_pod_writes("p2");
    client.fail_pod_writes("p6");

    let token = CancellationToken::new();
    manager.revert_expired_boosts(&token).await;

    assert_eq!(client.resize_patches().len(), 8);
    let record = manager.get_regular_boost("default", "b4").await.unwrap();
    assert_eq!(record.stats().await.active_container_boosts, 2);

    let status_updates = client.status_updates();
    assert_eq!(status_updates.len(), 1, "one deduplicated reconciliation");
    assert_eq!(status_updates[0].status.active_container_boosts, 2);
    assert_eq!(status_updates[0].status.total_container_boosts, 10);

    client.heal_pod("p2");
    client.heal_pod("p6");
    manager.revert_expired_boosts(&token).await;
    assert_eq!(client.resize_patches().len(), 10);
    assert_eq!(record.stats().await.active_container_boosts, 0);
}

/// Server-version discovery selects the revert transport: one full update on
/// old servers, resize-plus-metadata patches on new ones.
#[tokio::test]
#[serial]
async fn revert_mode_follows_server_version() {
    metrics::clear_all_metrics();
    for (version, legacy) in [("v1.29.2", true), ("v1.32.0", false)] {
        assert_eq!(should_use_legacy_revert_mode(version), legacy);

        let client = Arc::new(FakeClusterClient::new());
        let boost = percentage_boost("default", "b5", "foo", "container-one", 120, 60);
        let record = Arc::new(BoostRecord::from_spec(client.clone(), &boost, legacy).unwrap());

        let mut annotation = BoostAnnotation::new(Utc::now());
        annotation
            .init_cpu_requests
            .insert("container-one".to_string(), "500m".to_string());
        let pod = PodBuilder::new("default", "p1")
            .label("app", "foo")
            .label(BOOST_LABEL_KEY, "b5")
            .annotation(BOOST_ANNOTATION_KEY, &annotation.to_json())
            .container("container-one", Some("1100m"), None)
            .build();
        client.put_pod(pod.clone());
        record.upsert_pod(&pod).await.unwrap();
        record.revert_resources(&pod).await.unwrap();

        if legacy {
            assert_eq!(client.pod_updates().len(), 1);
            assert!(client.resize_patches().is_empty());
        } else {
            assert!(client.pod_updates().is_empty());
            assert_eq!(client.resize_patches().len(), 1);
            assert_eq!(client.pod_patches().len(), 1);
        }
    }
}

/// The Active condition reflects whether the manager knows the boost.
#[tokio::test]
#[serial]
async fn status_condition_tracks_registration() {
    metrics::clear_all_metrics();
    let client = Arc::new(FakeClusterClient::new());
    let manager = Arc::new(BoostManager::new());
    let controller = BoostController::new(client.clone(), manager.clone(), false);

    let boost = percentage_boost("default", "b6", "foo", "container-one", 120, 60);
    client.put_boost(boost.clone());

    controller.reconcile("default", "b6").await.unwrap();
    let condition = client.status_updates()[0]
        .status
        .condition(BOOST_ACTIVE_CONDITION)
        .cloned()
        .unwrap();
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason, "NotFound");

    controller.handle_create(&boost).await;
    controller.reconcile("default", "b6").await.unwrap();
    let condition = client.status_updates()[1]
        .status
        .condition(BOOST_ACTIVE_CONDITION)
        .cloned()
        .unwrap();
    assert_eq!(condition.status, "True");
    assert_eq!(condition.reason, "Ready");
}
