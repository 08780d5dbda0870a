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

use std::error::Error;
use std::fmt;
use std::fs;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::cpuboost::k8s::boost::StartupCPUBoost;
use crate::cpuboost::k8s::pod::Pod;
use crate::cpuboost::util::error::with_context;

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_ENV: &str = "KUBERNETES_API_SERVER";
const DEFAULT_API_SERVER: &str = "https://kubernetes.default.svc";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";
const BOOST_API_PREFIX: &str = "/apis/autoscaling.x-k8s.io/v1alpha1";

/// Cluster API failures, split so callers can branch on the benign kinds.
#[derive(Debug)]
pub enum ApiError {
    NotFound,
    Conflict(String),
    Api { status: u16, message: String },
    Transport(Box<dyn Error + Send + Sync>),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::NotFound => write!(f, "object not found"),
            ApiError::Conflict(message) => write!(f, "conflict: {}", message),
            ApiError::Api { status, message } => {
                write!(f, "api error (status {}): {}", status, message)
            }
            ApiError::Transport(err) => write!(f, "transport error: {}", err),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::Transport(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// The cluster API plane as consumed by the boost engine. Patch transport,
/// watch streams, and object storage stay behind this seam.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> ApiResult<Pod>;
    async fn update_pod(&self, pod: &Pod) -> ApiResult<()>;
    /// Merge patch against the pod object.
    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> ApiResult<()>;
    /// Merge patch against the pod's `/resize` subresource.
    async fn patch_pod_resize(&self, namespace: &str, name: &str, patch: &Value) -> ApiResult<()>;
    async fn get_boost(&self, namespace: &str, name: &str) -> ApiResult<StartupCPUBoost>;
    async fn update_boost_status(&self, boost: &StartupCPUBoost) -> ApiResult<()>;
    /// Server build version string, e.g. `v1.32.0`.
    async fn server_version(&self) -> ApiResult<String>;
    /// Raw Prometheus text from the API server `/metrics` endpoint.
    async fn raw_metrics(&self) -> ApiResult<String>;
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "gitVersion")]
    git_version: String,
}

/// `ClusterClient` over the API server REST interface with in-cluster
/// service-account credentials.
pub struct HttpClusterClient {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpClusterClient {
    /// Builds a client from the in-cluster environment: the service-account
    /// token and CA when present, the API server address from
    /// `KUBERNETES_API_SERVER` or the cluster-internal default.
    pub fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let base_url = std::env::var(API_SERVER_ENV)
            .unwrap_or_else(|_| DEFAULT_API_SERVER.to_string());
        let token = fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)
            .ok()
            .map(|t| t.trim().to_string());
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Ok(ca_pem) = fs::read(SERVICE_ACCOUNT_CA_PATH) {
            let ca = Certificate::from_pem(&ca_pem)
                .map_err(|e| with_context(e, "failed to parse cluster CA certificate"))?;
            builder = builder.add_root_certificate(ca);
        }
        let client = builder
            .build()
            .map_err(|e| with_context(e, "failed to build cluster API client"))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token,
        })
    }

    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn pod_path(namespace: &str, name: &str) -> String {
        format!("/api/v1/namespaces/{}/pods/{}", namespace, name)
    }

    fn boost_path(namespace: &str, name: &str) -> String {
        format!(
            "{}/namespaces/{}/startupcpuboosts/{}",
            BOOST_API_PREFIX, namespace, name
        )
    }

    async fn check(response: reqwest::Response) -> ApiResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            StatusCode::CONFLICT => Err(ApiError::Conflict(message)),
            _ => Err(ApiError::Api {
                status: status.as_u16(),
                message,
            }),
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> ApiResult<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Transport(Box::new(e)))?;
        Self::check(response).await
    }
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> ApiResult<Pod> {
        let response = self
            .send(self.request(reqwest::Method::GET, &Self::pod_path(namespace, name)))
            .await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::Transport(Box::new(e)))
    }

    async fn update_pod(&self, pod: &Pod) -> ApiResult<()> {
        let path = Self::pod_path(&pod.metadata.namespace, &pod.metadata.name);
        self.send(self.request(reqwest::Method::PUT, &path).json(pod))
            .await?;
        Ok(())
    }

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> ApiResult<()> {
        let path = Self::pod_path(namespace, name);
        self.send(
            self.request(reqwest::Method::PATCH, &path)
                .header(reqwest::header::CONTENT_TYPE, MERGE_PATCH_CONTENT_TYPE)
                .json(patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_pod_resize(&self, namespace: &str, name: &str, patch: &Value) -> ApiResult<()> {
        let path = format!("{}/resize", Self::pod_path(namespace, name));
        self.send(
            self.request(reqwest::Method::PATCH, &path)
                .header(reqwest::header::CONTENT_TYPE, MERGE_PATCH_CONTENT_TYPE)
                .json(patch),
        )
        .await?;
        Ok(())
    }

    async fn get_boost(&self, namespace: &str, name: &str) -> ApiResult<StartupCPUBoost> {
        let response = self
            .send(self.request(reqwest::Method::GET, &Self::boost_path(namespace, name)))
            .await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::Transport(Box::new(e)))
    }

    async fn update_boost_status(&self, boost: &StartupCPUBoost) -> ApiResult<()> {
        let path = format!(
            "{}/status",
            Self::boost_path(&boost.metadata.namespace, &boost.metadata.name)
        );
        self.send(self.request(reqwest::Method::PUT, &path).json(boost))
            .await?;
        Ok(())
    }

    async fn server_version(&self) -> ApiResult<String> {
        let response = self
            .send(self.request(reqwest::Method::GET, "/version"))
            .await?;
        let info: VersionInfo = response
            .json()
            .await
            .map_err(|e| ApiError::Transport(Box::new(e)))?;
        Ok(info.git_version)
    }

    async fn raw_metrics(&self) -> ApiResult<String> {
        let response = self
            .send(self.request(reqwest::Method::GET, "/metrics"))
            .await?;
        response
            .text()
            .await
            .map_err(|e| ApiError::Transport(Box::new(e)))
    }
}
