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
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::cpuboost::k8s::pod::Pod;
use crate::cpuboost::logger::log_debug;
use crate::cpuboost::util::error::{new_error, with_context, BoxError};

pub const FIXED_DURATION_POLICY_NAME: &str = "FixedDuration";
pub const POD_CONDITION_POLICY_NAME: &str = "PodCondition";
pub const AUTO_DURATION_POLICY_NAME: &str = "AutoDuration";

const ORACLE_TIMEOUT: StdDuration = StdDuration::from_secs(10);
const COMPONENT: &str = "duration-policy";

/// Injectable clock so fixed-duration expiry is testable.
pub type TimeSource = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_time_source() -> TimeSource {
    Arc::new(Utc::now)
}

/// Termination criterion for a boost. `valid` answers whether a pod is still
/// inside its boost window.
#[derive(Clone)]
pub enum DurationPolicy {
    Fixed {
        duration: Duration,
        now: TimeSource,
    },
    PodCondition {
        condition_type: String,
        status: String,
    },
    Auto {
        oracle: DurationOracle,
        now: TimeSource,
    },
}

impl DurationPolicy {
    pub fn fixed(duration: Duration) -> Self {
        Self::fixed_with_time_source(duration, system_time_source())
    }

    pub fn fixed_with_time_source(duration: Duration, now: TimeSource) -> Self {
        DurationPolicy::Fixed { duration, now }
    }

    pub fn pod_condition(condition_type: impl Into<String>, status: impl Into<String>) -> Self {
        DurationPolicy::PodCondition {
            condition_type: condition_type.into(),
            status: status.into(),
        }
    }

    pub fn auto(api_endpoint: impl Into<String>) -> Self {
        Self::auto_with_time_source(api_endpoint, system_time_source())
    }

    pub fn auto_with_time_source(api_endpoint: impl Into<String>, now: TimeSource) -> Self {
        DurationPolicy::Auto {
            oracle: DurationOracle::new(api_endpoint.into()),
            now,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DurationPolicy::Fixed { .. } => FIXED_DURATION_POLICY_NAME,
            DurationPolicy::PodCondition { .. } => POD_CONDITION_POLICY_NAME,
            DurationPolicy::Auto { .. } => AUTO_DURATION_POLICY_NAME,
        }
    }

    /// Returns true while the pod is still within the boost window.
    ///
    /// An unreachable or malformed duration oracle evaluates as not valid so
    /// a broken endpoint cannot extend boosts indefinitely.
    pub async fn valid(&self, pod: &Pod) -> bool {
        match self {
            DurationPolicy::Fixed { duration, now } => {
                creation_timestamp(pod) + *duration > now()
            }
            DurationPolicy::PodCondition {
                condition_type,
                status,
            } => !pod
                .conditions()
                .iter()
                .any(|c| &c.condition_type == condition_type && &c.status == status),
            DurationPolicy::Auto { oracle, now } => match oracle.get_duration(pod).await {
                Ok(duration) => creation_timestamp(pod) + duration > now(),
                Err(err) => {
                    log_debug(
                        COMPONENT,
                        "duration oracle failed, treating boost window as expired",
                        &[
                            ("pod", &pod.metadata.name),
                            ("namespace", &pod.metadata.namespace),
                            ("error", &err.to_string()),
                        ],
                    );
                    false
                }
            },
        }
    }
}

fn creation_timestamp(pod: &Pod) -> DateTime<Utc> {
    pod.metadata
        .creation_timestamp
        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
}

#[derive(Deserialize)]
struct DurationPrediction {
    duration: String,
}

/// HTTP client for the external duration prediction endpoint. The contract
/// is a GET returning `{"duration": "5m"}`.
#[derive(Clone)]
pub struct DurationOracle {
    api_endpoint: String,
    client: reqwest::Client,
}

impl DurationOracle {
    pub fn new(api_endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ORACLE_TIMEOUT)
            .build()
            .unwrap_or_default();
        DurationOracle {
            api_endpoint,
            client,
        }
    }

    pub fn api_endpoint(&self) -> &str {
        &self.api_endpoint
    }

    pub async fn get_duration(&self, pod: &Pod) -> Result<Duration, BoxError> {
        let response = self
            .client
            .get(&self.api_endpoint)
            .query(&[
                ("namespace", pod.metadata.namespace.as_str()),
                ("pod", pod.metadata.name.as_str()),
            ])
            .send()
            .await
            .map_err(|e| with_context(e, "duration oracle request failed"))?;
        if !response.status().is_success() {
            return Err(new_error(format!(
                "duration oracle returned status {}",
                response.status()
            )));
        }
        let prediction: DurationPrediction = response
            .json()
            .await
            .map_err(|e| with_context(e, "failed to decode duration prediction"))?;
        let duration = humantime::parse_duration(&prediction.duration)
            .map_err(|e| with_context(e, "failed to parse predicted duration"))?;
        Duration::from_std(duration)
            .map_err(|e| with_context(e, "predicted duration out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuboost::k8s::pod::{ObjectMeta, PodCondition, PodStatus};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    fn pod_created_at(created: DateTime<Utc>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "demo-1".to_string(),
                namespace: "default".to_string(),
                creation_timestamp: Some(created),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn fixed_time_source(at: DateTime<Utc>) -> TimeSource {
        Arc::new(move || at)
    }

    #[tokio::test]
    async fn fixed_policy_is_valid_inside_the_window() {
        let created = Utc::now();
        let policy = DurationPolicy::fixed_with_time_source(
            Duration::seconds(60),
            fixed_time_source(created + Duration::seconds(59)),
        );
        assert!(policy.valid(&pod_created_at(created)).await);
    }

    #[tokio::test]
    async fn fixed_policy_expires_after_the_window() {
        let created = Utc::now();
        let policy = DurationPolicy::fixed_with_time_source(
            Duration::seconds(60),
            fixed_time_source(created + Duration::seconds(61)),
        );
        assert!(!policy.valid(&pod_created_at(created)).await);
    }

    #[tokio::test]
    async fn pod_condition_policy_holds_until_condition_matches() {
        let policy = DurationPolicy::pod_condition("Ready", "True");
        let mut pod = pod_created_at(Utc::now());
        assert!(policy.valid(&pod).await, "no conditions yet");

        pod.status = Some(PodStatus {
            conditions: vec![PodCondition {
                condition_type: "Ready".to_string(),
                status: "False".to_string(),
                last_transition_time: None,
            }],
            ..Default::default()
        });
        assert!(policy.valid(&pod).await, "condition has wrong status");

        pod.status.as_mut().unwrap().conditions[0].status = "True".to_string();
        assert!(!policy.valid(&pod).await, "condition matched");
    }

    async fn spawn_oracle(response: serde_json::Value) -> String {
        let app = Router::new().route(
            "/",
            get(move || {
                let body = response.clone();
                async move { Json(body) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn auto_policy_follows_predicted_duration() {
        let endpoint = spawn_oracle(json!({"duration": "5m"})).await;
        let created = Utc::now();
        let policy = DurationPolicy::Auto {
            oracle: DurationOracle::new(endpoint),
            now: fixed_time_source(created + Duration::seconds(60)),
        };
        assert!(policy.valid(&pod_created_at(created)).await);

        let endpoint = spawn_oracle(json!({"duration": "30s"})).await;
        let policy = DurationPolicy::Auto {
            oracle: DurationOracle::new(endpoint),
            now: fixed_time_source(created + Duration::seconds(60)),
        };
        assert!(!policy.valid(&pod_created_at(created)).await);
    }

    #[tokio::test]
    async fn auto_policy_treats_oracle_failure_as_expired() {
        let endpoint = spawn_oracle(json!({"unexpected": "shape"})).await;
        let created = Utc::now();
        let policy = DurationPolicy::Auto {
            oracle: DurationOracle::new(endpoint),
            now: fixed_time_source(created),
        };
        assert!(!policy.valid(&pod_created_at(created)).await);

        let unreachable = DurationPolicy::Auto {
            oracle: DurationOracle::new("http://127.0.0.1:1/predict".to_string()),
            now: fixed_time_source(created),
        };
        assert!(!unreachable.valid(&pod_created_at(created)).await);
    }

    #[test]
    fn policy_names_are_stable() {
        assert_eq!(
            DurationPolicy::fixed(Duration::seconds(1)).name(),
            FIXED_DURATION_POLICY_NAME
        );
        assert_eq!(
            DurationPolicy::pod_condition("Ready", "True").name(),
            POD_CONDITION_POLICY_NAME
        );
        assert_eq!(
            DurationPolicy::auto("http://oracle").name(),
            AUTO_DURATION_POLICY_NAME
        );
    }
}
