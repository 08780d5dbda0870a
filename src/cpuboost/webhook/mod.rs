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

pub mod boost_validator;
pub mod pod_mutator;
pub mod qos;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSON_PATCH_TYPE: &str = "JSONPatch";

/// AdmissionReview envelope as delivered by the API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionReview {
    #[serde(rename = "apiVersion", default = "admission_api_version")]
    pub api_version: String,
    #[serde(default = "admission_kind")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

fn admission_api_version() -> String {
    "admission.k8s.io/v1".to_string()
}

fn admission_kind() -> String {
    "AdmissionReview".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionRequest {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub object: Value,
    #[serde(rename = "oldObject", default)]
    pub old_object: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
    /// Base64-encoded RFC 6902 patch document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(rename = "patchType", skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionStatus {
    #[serde(default)]
    pub message: String,
}

impl AdmissionReview {
    /// Admits the object unchanged, optionally surfacing warnings.
    pub fn allowed(uid: &str, warnings: Vec<String>) -> AdmissionReview {
        AdmissionReview {
            api_version: admission_api_version(),
            kind: admission_kind(),
            request: None,
            response: Some(AdmissionResponse {
                uid: uid.to_string(),
                allowed: true,
                warnings,
                ..Default::default()
            }),
        }
    }

    /// Admits the object with an RFC 6902 patch.
    pub fn patched(uid: &str, patch_ops: &[Value]) -> AdmissionReview {
        let encoded = BASE64.encode(
            serde_json::to_vec(patch_ops).expect("patch operations serialize to JSON"),
        );
        AdmissionReview {
            api_version: admission_api_version(),
            kind: admission_kind(),
            request: None,
            response: Some(AdmissionResponse {
                uid: uid.to_string(),
                allowed: true,
                patch: Some(encoded),
                patch_type: Some(JSON_PATCH_TYPE.to_string()),
                ..Default::default()
            }),
        }
    }

    /// Rejects the object with a message.
    pub fn denied(uid: &str, message: &str) -> AdmissionReview {
        AdmissionReview {
            api_version: admission_api_version(),
            kind: admission_kind(),
            request: None,
            response: Some(AdmissionResponse {
                uid: uid.to_string(),
                allowed: false,
                status: Some(AdmissionStatus {
                    message: message.to_string(),
                }),
                ..Default::default()
            }),
        }
    }

    /// Decodes the base64 patch on the response, when one is present.
    pub fn decoded_patch(&self) -> Option<Vec<Value>> {
        let encoded = self.response.as_ref()?.patch.as_ref()?;
        let raw = BASE64.decode(encoded).ok()?;
        serde_json::from_slice(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patched_review_encodes_operations() {
        let ops = vec![json!({"op": "add", "path": "/metadata/labels", "value": {}})];
        let review = AdmissionReview::patched("uid-1", &ops);
        let response = review.response.as_ref().unwrap();
        assert!(response.allowed);
        assert_eq!(response.patch_type.as_deref(), Some(JSON_PATCH_TYPE));
        assert_eq!(review.decoded_patch().unwrap(), ops);
    }

    #[test]
    fn denied_review_carries_message() {
        let review = AdmissionReview::denied("uid-2", "invalid spec");
        let response = review.response.as_ref().unwrap();
        assert!(!response.allowed);
        assert_eq!(response.status.as_ref().unwrap().message, "invalid spec");
    }
}
