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

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::cpuboost::k8s::client::ClusterClient;
use crate::cpuboost::util::error::{with_context, BoxError};

pub const IN_PLACE_POD_VERTICAL_SCALING_FEATURE: &str = "InPlacePodVerticalScaling";
pub const POD_LEVEL_RESOURCES_FEATURE: &str = "PodLevelResources";
/// Server version from which the `/resize` subresource revert is used.
pub const WANTED_SERVER_VERSION_FOR_NEW_REVERT: &str = "v1.32.0";

const FEATURE_ENABLED_METRIC_NAME: &str = "kubernetes_feature_enabled";
const FEATURE_NAME_LABEL: &str = "name";
const FEATURE_STAGE_LABEL: &str = "stage";

/// Feature-gate states keyed by gate name, then stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureGates(HashMap<String, HashMap<String, bool>>);

impl FeatureGates {
    pub fn is_enabled(&self, feature_gate: &str, stage: &str) -> bool {
        let Some(stages) = self.0.get(feature_gate) else {
            return false;
        };
        stages
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(stage))
            .map(|(_, enabled)| *enabled)
            .unwrap_or(false)
    }

    pub fn is_enabled_any_stage(&self, feature_gate: &str) -> bool {
        self.0
            .get(feature_gate)
            .map(|stages| stages.values().any(|enabled| *enabled))
            .unwrap_or(false)
    }
}

/// Parses `kubernetes_feature_enabled{name="...",stage="..."}` gauges out of
/// the API server's Prometheus text exposition.
pub fn parse_feature_gates(metrics_text: &str) -> FeatureGates {
    let mut gates: HashMap<String, HashMap<String, bool>> = HashMap::new();
    for line in metrics_text.lines() {
        let line = line.trim();
        if !line.starts_with(FEATURE_ENABLED_METRIC_NAME) {
            continue;
        }
        let Some(open) = line.find('{') else { continue };
        let Some(close) = line.rfind('}') else { continue };
        if close <= open {
            continue;
        }
        let labels = parse_labels(&line[open + 1..close]);
        let (Some(name), Some(stage)) =
            (labels.get(FEATURE_NAME_LABEL), labels.get(FEATURE_STAGE_LABEL))
        else {
            continue;
        };
        let value = line[close + 1..].trim();
        let enabled = value.parse::<f64>().map(|v| v == 1.0).unwrap_or(false);
        gates
            .entry(name.clone())
            .or_default()
            .insert(stage.clone(), enabled);
    }
    FeatureGates(gates)
}

fn parse_labels(raw: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    for part in raw.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        labels.insert(key.trim().to_string(), value.to_string());
    }
    labels
}

/// Compares kube version strings (`v1.32.0`, `v1.33.1-gke.100`) by their
/// numeric components; trailing build metadata is ignored.
pub fn compare_kube_versions(a: &str, b: &str) -> Ordering {
    let a_parts = version_components(a);
    let b_parts = version_components(b);
    let len = a_parts.len().max(b_parts.len());
    for i in 0..len {
        let av = a_parts.get(i).copied().unwrap_or(0);
        let bv = b_parts.get(i).copied().unwrap_or(0);
        match av.cmp(&bv) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn version_components(version: &str) -> Vec<u64> {
    let trimmed = version.trim().trim_start_matches(['v', 'V']);
    let core = trimmed
        .split(['-', '+'])
        .next()
        .unwrap_or(trimmed);
    core.split('.')
        .map(|part| {
            part.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .collect()
}

/// True when the server predates the `/resize` subresource and reverts must
/// fall back to full pod updates.
pub fn should_use_legacy_revert_mode(server_version: &str) -> bool {
    compare_kube_versions(WANTED_SERVER_VERSION_FOR_NEW_REVERT, server_version) == Ordering::Greater
}

/// Cluster discovery facts: build version (fetched once) and feature gates.
pub struct ClusterInfo {
    client: Arc<dyn ClusterClient>,
    version_cache: Mutex<Option<String>>,
}

impl ClusterInfo {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        ClusterInfo {
            client,
            version_cache: Mutex::new(None),
        }
    }

    pub async fn get_cluster_version(&self) -> Result<String, BoxError> {
        let mut cache = self.version_cache.lock().await;
        if let Some(version) = cache.as_ref() {
            return Ok(version.clone());
        }
        let version = self
            .client
            .server_version()
            .await
            .map_err(|e| with_context(e, "failed to discover server version"))?;
        *cache = Some(version.clone());
        Ok(version)
    }

    pub async fn get_feature_gates(&self) -> Result<FeatureGates, BoxError> {
        let text = self
            .client
            .raw_metrics()
            .await
            .map_err(|e| with_context(e, "failed to scrape server metrics"))?;
        Ok(parse_feature_gates(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuboost::test_support::FakeClusterClient;

    const METRICS_FIXTURE: &str = r#"
# HELP kubernetes_feature_enabled [BETA] This metric records the data about the stage and enablement of a k8s feature.
# TYPE kubernetes_feature_enabled gauge
kubernetes_feature_enabled{name="InPlacePodVerticalScaling",stage="BETA"} 1
kubernetes_feature_enabled{name="PodLevelResources",stage="ALPHA"} 0
kubernetes_feature_enabled{name="SidecarContainers",stage=""} 1
some_other_metric{name="InPlacePodVerticalScaling"} 1
"#;

    #[test]
    fn parses_feature_gate_gauges() {
        let gates = parse_feature_gates(METRICS_FIXTURE);
        assert!(gates.is_enabled(IN_PLACE_POD_VERTICAL_SCALING_FEATURE, "BETA"));
        assert!(gates.is_enabled(IN_PLACE_POD_VERTICAL_SCALING_FEATURE, "beta"));
        assert!(gates.is_enabled_any_stage(IN_PLACE_POD_VERTICAL_SCALING_FEATURE));
        assert!(!gates.is_enabled_any_stage(POD_LEVEL_RESOURCES_FEATURE));
        assert!(!gates.is_enabled("NoSuchGate", "BETA"));
        assert!(gates.is_enabled("SidecarContainers", ""));
    }

    #[test]
    fn version_comparison_handles_suffixes() {
        assert_eq!(compare_kube_versions("v1.32.0", "v1.32.0"), Ordering::Equal);
        assert_eq!(compare_kube_versions("v1.32.0", "v1.29.2"), Ordering::Greater);
        assert_eq!(compare_kube_versions("v1.29.2", "v1.32.0"), Ordering::Less);
        assert_eq!(
            compare_kube_versions("v1.32.0", "v1.33.1-gke.100"),
            Ordering::Less
        );
    }

    #[test]
    fn legacy_mode_selected_for_old_servers() {
        assert!(should_use_legacy_revert_mode("v1.29.2"));
        assert!(should_use_legacy_revert_mode("v1.31.9"));
        assert!(!should_use_legacy_revert_mode("v1.32.0"));
        assert!(!should_use_legacy_revert_mode("v1.33.1-gke.100"));
    }

    #[tokio::test]
    async fn cluster_version_is_fetched_once() {
        let client = Arc::new(FakeClusterClient::new());
        client.set_server_version("v1.30.1");
        let info = ClusterInfo::new(client.clone());
        assert_eq!(info.get_cluster_version().await.unwrap(), "v1.30.1");
        client.set_server_version("v1.99.0");
        assert_eq!(
            info.get_cluster_version().await.unwrap(),
            "v1.30.1",
            "cached value wins"
        );
    }

    #[tokio::test]
    async fn feature_gates_come_from_server_metrics() {
        let client = Arc::new(FakeClusterClient::new());
        client.set_metrics_text(METRICS_FIXTURE);
        let info = ClusterInfo::new(client);
        let gates = info.get_feature_gates().await.unwrap();
        assert!(gates.is_enabled_any_stage(IN_PLACE_POD_VERTICAL_SCALING_FEATURE));
    }
}
