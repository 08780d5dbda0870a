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

use async_trait::async_trait;

use crate::cpuboost::boost::manager::{BoostManager, ReconcileRequest, StatusReconciler};
use crate::cpuboost::boost::record::BoostRecord;
use crate::cpuboost::k8s::boost::{Condition, StartupCPUBoost};
use crate::cpuboost::k8s::client::{ApiError, ClusterClient};
use crate::cpuboost::k8s::pod::{CONDITION_FALSE, CONDITION_TRUE};
use crate::cpuboost::logger::{log_debug, log_error};
use crate::cpuboost::util::error::{with_context, BoxError};

pub const BOOST_ACTIVE_CONDITION: &str = "Active";
pub const BOOST_ACTIVE_TRUE_REASON: &str = "Ready";
pub const BOOST_ACTIVE_TRUE_MESSAGE: &str = "Can boost new containers";
pub const BOOST_ACTIVE_FALSE_REASON: &str = "NotFound";
pub const BOOST_ACTIVE_FALSE_MESSAGE: &str = "StartupCPUBoost not found";

const COMPONENT: &str = "boost-controller";
const STATUS_CONFLICT_RETRIES: u32 = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconcileOutcome {
    Done,
    Requeue,
}

/// Dispatches StartupCPUBoost lifecycle events into the manager and
/// converges the object's status subresource with the observed record state.
pub struct BoostController {
    client: Arc<dyn ClusterClient>,
    manager: Arc<BoostManager>,
    legacy_revert: bool,
}

impl BoostController {
    pub fn new(client: Arc<dyn ClusterClient>, manager: Arc<BoostManager>, legacy_revert: bool) -> Self {
        BoostController {
            client,
            manager,
            legacy_revert,
        }
    }

    /// Compiles and registers a record for a freshly created boost object.
    /// Invalid objects that slipped past validation are logged and dropped.
    pub async fn handle_create(&self, boost: &StartupCPUBoost) {
        log_debug(
            COMPONENT,
            "handling boost create event",
            &[
                ("name", &boost.metadata.name),
                ("namespace", &boost.metadata.namespace),
            ],
        );
        let record = match BoostRecord::from_spec(self.client.clone(), boost, self.legacy_revert) {
            Ok(record) => Arc::new(record),
            Err(err) => {
                log_error(
                    COMPONENT,
                    "boost creation error",
                    &[
                        ("name", &boost.metadata.name),
                        ("error", &err.to_string()),
                    ],
                );
                return;
            }
        };
        if let Err(err) = self.manager.add_regular_boost(record).await {
            log_error(
                COMPONENT,
                "boost registration error",
                &[("name", &boost.metadata.name), ("error", &err.to_string())],
            );
        }
    }

    pub async fn handle_update(&self, boost: &StartupCPUBoost) {
        log_debug(
            COMPONENT,
            "handling boost update event",
            &[("name", &boost.metadata.name)],
        );
        if let Err(err) = self.manager.update_regular_boost(boost).await {
            log_error(
                COMPONENT,
                "boost update error",
                &[("name", &boost.metadata.name), ("error", &err.to_string())],
            );
        }
    }

    pub async fn handle_delete(&self, boost: &StartupCPUBoost) {
        log_debug(
            COMPONENT,
            "handling boost delete event",
            &[("name", &boost.metadata.name)],
        );
        self.manager
            .delete_regular_boost(&boost.metadata.namespace, &boost.metadata.name)
            .await;
    }

    /// Converges the boost's status with the manager's view. Conflicting
    /// status writes request a requeue; a vanished object is a no-op.
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileOutcome, BoxError> {
        let boost = match self.client.get_boost(namespace, name).await {
            Ok(boost) => boost,
            Err(err) if err.is_not_found() => return Ok(ReconcileOutcome::Done),
            Err(err) => return Err(with_context(err, "failed to fetch boost object")),
        };

        let mut updated = boost.clone();
        let mut condition = Condition {
            condition_type: BOOST_ACTIVE_CONDITION.to_string(),
            status: CONDITION_FALSE.to_string(),
            reason: BOOST_ACTIVE_FALSE_REASON.to_string(),
            message: BOOST_ACTIVE_FALSE_MESSAGE.to_string(),
            last_transition_time: None,
        };
        if let Some(record) = self.manager.get_regular_boost(namespace, name).await {
            log_debug(COMPONENT, "found boost in a manager", &[("name", name)]);
            let stats = record.stats().await;
            condition.status = CONDITION_TRUE.to_string();
            condition.reason = BOOST_ACTIVE_TRUE_REASON.to_string();
            condition.message = BOOST_ACTIVE_TRUE_MESSAGE.to_string();
            updated.status.active_container_boosts = stats.active_container_boosts as i32;
            updated.status.total_container_boosts = stats.total_container_boosts as i32;
        }
        updated.status.set_condition(condition);

        if updated.status == boost.status {
            return Ok(ReconcileOutcome::Done);
        }
        log_debug(COMPONENT, "updating boost status", &[("name", name)]);
        match self.client.update_boost_status(&updated).await {
            Ok(()) => Ok(ReconcileOutcome::Done),
            Err(ApiError::Conflict(_)) => {
                log_debug(
                    COMPONENT,
                    "boost status update conflict, requeueing",
                    &[("name", name)],
                );
                Ok(ReconcileOutcome::Requeue)
            }
            Err(err) if err.is_not_found() => Ok(ReconcileOutcome::Done),
            Err(err) => Err(with_context(err, "boost status update error")),
        }
    }
}

#[async_trait]
impl StatusReconciler for BoostController {
    /// Post-revert convergence entry point: retries a bounded number of
    /// times on write conflicts, then gives up until the next trigger.
    async fn reconcile(&self, request: &ReconcileRequest) {
        for _ in 0..=STATUS_CONFLICT_RETRIES {
            match BoostController::reconcile(self, &request.namespace, &request.name).await {
                Ok(ReconcileOutcome::Done) => return,
                Ok(ReconcileOutcome::Requeue) => continue,
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "boost status reconciliation failed",
                        &[
                            ("name", request.name.as_str()),
                            ("namespace", request.namespace.as_str()),
                            ("error", &err.to_string()),
                        ],
                    );
                    return;
                }
            }
        }
    }
}
