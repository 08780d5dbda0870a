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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::cpuboost::boost::manager::BoostManager;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

/// Tracks whether controller wiring finished; flipped once by the entry
/// point after all handlers are registered.
#[derive(Default)]
pub struct ReadinessState {
    setup_complete: AtomicBool,
}

impl ReadinessState {
    pub fn new() -> Arc<Self> {
        Arc::new(ReadinessState::default())
    }

    pub fn mark_setup_complete(&self) {
        self.setup_complete.store(true, Ordering::Release);
    }

    pub fn setup_complete(&self) -> bool {
        self.setup_complete.load(Ordering::Acquire)
    }
}

/// Liveness is a static OK: the process answering at all is the signal.
pub fn liveness_report() -> HealthReport {
    HealthReport {
        status: HealthStatus::Ready,
        components: vec![ComponentHealth {
            name: "process",
            healthy: true,
        }],
    }
}

/// Readiness holds until controller setup completed and the boost manager's
/// tick loop is running.
pub async fn readiness_report(state: &ReadinessState, manager: &BoostManager) -> HealthReport {
    let setup = state.setup_complete();
    let running = manager.is_running().await;
    let status = if setup && running {
        HealthStatus::Ready
    } else {
        HealthStatus::Degraded
    };
    HealthReport {
        status,
        components: vec![
            ComponentHealth {
                name: "controller_setup",
                healthy: setup,
            },
            ComponentHealth {
                name: "boost_manager",
                healthy: running,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn readiness_requires_setup_and_running_manager() {
        let state = ReadinessState::new();
        let manager = Arc::new(BoostManager::new());
        let report = readiness_report(&state, &manager).await;
        assert!(!report.is_ready());

        state.mark_setup_complete();
        let report = readiness_report(&state, &manager).await;
        assert!(!report.is_ready(), "manager is not running yet");

        let token = CancellationToken::new();
        let (tick_tx, ticker) = crate::cpuboost::boost::manager::ManualTicker::new();
        let handle = {
            let manager = manager.clone();
            let token = token.clone();
            tokio::spawn(async move { manager.start(token, ticker).await })
        };
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !manager.is_running().await {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let report = readiness_report(&state, &manager).await;
        assert!(report.is_ready());

        token.cancel();
        handle.await.unwrap();
        drop(tick_tx);
        let report = readiness_report(&state, &manager).await;
        assert!(!report.is_ready(), "stopped manager fails readiness");
    }

    #[test]
    fn liveness_is_static_ok() {
        assert!(liveness_report().is_ready());
    }
}
