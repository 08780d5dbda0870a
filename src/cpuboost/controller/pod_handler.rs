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

use crate::cpuboost::boost::manager::{BoostManager, ReconcileRequest};
use crate::cpuboost::boost::pod::BOOST_LABEL_KEY;
use crate::cpuboost::k8s::pod::Pod;
use crate::cpuboost::k8s::selector::{
    LabelSelector, LabelSelectorRequirement, SELECTOR_OP_EXISTS,
};
use crate::cpuboost::logger::{log_debug, log_error};

const COMPONENT: &str = "pod-handler";

/// Routes pod watch events into the boost manager. Each handled event
/// returns the governing boost's identity so the caller can enqueue a
/// status reconciliation.
pub struct PodHandler {
    manager: Arc<BoostManager>,
}

impl PodHandler {
    pub fn new(manager: Arc<BoostManager>) -> Self {
        PodHandler { manager }
    }

    /// Watch-stream predicate: only pods carrying the boost label are of
    /// interest to the controller.
    pub fn watch_selector() -> LabelSelector {
        LabelSelector {
            match_expressions: vec![LabelSelectorRequirement {
                key: BOOST_LABEL_KEY.to_string(),
                operator: SELECTOR_OP_EXISTS.to_string(),
                values: vec![],
            }],
            ..Default::default()
        }
    }

    pub async fn handle_create(&self, pod: &Pod) -> Option<ReconcileRequest> {
        log_debug(
            COMPONENT,
            "handling pod create",
            &[
                ("pod", &pod.metadata.name),
                ("namespace", &pod.metadata.namespace),
            ],
        );
        match self.manager.upsert_pod(pod).await {
            Ok(request) => request,
            Err(err) => {
                log_error(
                    COMPONENT,
                    "failed to handle pod create",
                    &[("pod", &pod.metadata.name), ("error", &err.to_string())],
                );
                None
            }
        }
    }

    /// Condition transitions are the only pod changes the boost engine acts
    /// on; everything else is noise from the watch stream.
    pub async fn handle_update(&self, old_pod: &Pod, new_pod: &Pod) -> Option<ReconcileRequest> {
        log_debug(
            COMPONENT,
            "handling pod update",
            &[("pod", &new_pod.metadata.name)],
        );
        if old_pod.conditions() == new_pod.conditions() {
            log_debug(
                COMPONENT,
                "pod update skipped: conditions did not change",
                &[("pod", &new_pod.metadata.name)],
            );
            return None;
        }
        match self.manager.upsert_pod(new_pod).await {
            Ok(request) => request,
            Err(err) => {
                log_error(
                    COMPONENT,
                    "failed to handle pod update",
                    &[("pod", &new_pod.metadata.name), ("error", &err.to_string())],
                );
                None
            }
        }
    }

    pub async fn handle_delete(&self, pod: &Pod) -> Option<ReconcileRequest> {
        log_debug(
            COMPONENT,
            "handling pod delete",
            &[("pod", &pod.metadata.name)],
        );
        self.manager.delete_pod(pod).await
    }
}
