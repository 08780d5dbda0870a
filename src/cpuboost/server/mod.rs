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

pub mod tls;

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperAcceptor;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cpuboost::boost::manager::BoostManager;
use crate::cpuboost::logger::{log_info, log_warn};
use crate::cpuboost::observability::health::{liveness_report, readiness_report, ReadinessState};
use crate::cpuboost::observability::metrics;
use crate::cpuboost::util::error::{new_error, with_context, BoxError};
use crate::cpuboost::webhook::boost_validator::BoostValidator;
use crate::cpuboost::webhook::pod_mutator::PodMutator;
use crate::cpuboost::webhook::AdmissionReview;

pub const MUTATE_POD_PATH: &str = "/mutate-v1-pod";
pub const VALIDATE_BOOST_PATH: &str = "/validate-autoscaling-x-k8s-io-v1alpha1-startupcpuboost";
pub const DEFAULT_WEBHOOK_BIND_ADDR: &str = ":9443";

const COMPONENT: &str = "server";

#[derive(Clone)]
struct WebhookState {
    mutator: Arc<PodMutator>,
    validator: Arc<BoostValidator>,
}

#[derive(Clone)]
struct OpsState {
    manager: Arc<BoostManager>,
    readiness: Arc<ReadinessState>,
}

/// Router for the TLS admission listener.
pub fn webhook_router(mutator: Arc<PodMutator>, validator: Arc<BoostValidator>) -> Router {
    Router::new()
        .route(MUTATE_POD_PATH, post(mutate_pod))
        .route(VALIDATE_BOOST_PATH, post(validate_boost))
        .with_state(WebhookState { mutator, validator })
}

/// Router for the plaintext health and metrics listener.
pub fn ops_router(manager: Arc<BoostManager>, readiness: Arc<ReadinessState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_text))
        .with_state(OpsState { manager, readiness })
}

async fn mutate_pod(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview>,
) -> Json<AdmissionReview> {
    Json(state.mutator.mutate(review).await)
}

async fn validate_boost(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview>,
) -> Json<AdmissionReview> {
    Json(state.validator.validate(review))
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(liveness_report()))
}

async fn readyz(State(state): State<OpsState>) -> impl IntoResponse {
    let report = readiness_report(&state.readiness, &state.manager).await;
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn metrics_text() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

/// Turns a `:8080`-style bind spec into a socket address.
pub fn parse_bind_addr(addr: &str) -> Result<SocketAddr, BoxError> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .map_err(|_| new_error(format!("invalid bind address {}", addr)))
}

/// Serves the admission webhook over TLS until cancellation. Connection
/// failures are logged and the accept loop carries on.
pub async fn serve_webhook(
    addr: SocketAddr,
    acceptor: openssl::ssl::SslAcceptor,
    router: Router,
    token: CancellationToken,
) -> Result<(), BoxError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| with_context(e, "failed to bind webhook listener"))?;
    log_info(
        COMPONENT,
        "webhook server listening",
        &[("addr", &addr.to_string())],
    );
    let service = TowerToHyperService::new(router);
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    log_warn(COMPONENT, "webhook accept failed", &[("error", &err.to_string())]);
                    continue;
                }
            }
        };
        let acceptor = acceptor.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let tls_stream = match tls::accept_with_tls(&acceptor, stream).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    log_warn(
                        COMPONENT,
                        "webhook TLS handshake failed",
                        &[("error", &err.to_string())],
                    );
                    return;
                }
            };
            let acceptor = HyperAcceptor::new(TokioExecutor::new());
            let connection = acceptor.serve_connection(TokioIo::new(tls_stream), service);
            if let Err(err) = connection.await {
                log_warn(
                    COMPONENT,
                    "webhook connection error",
                    &[("error", &err.to_string())],
                );
            }
        });
    }
    log_info(COMPONENT, "webhook server stopped", &[]);
    Ok(())
}

/// Serves health and metrics over plain HTTP until cancellation.
pub async fn serve_ops(
    addr: SocketAddr,
    router: Router,
    token: CancellationToken,
) -> Result<(), BoxError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| with_context(e, "failed to bind health/metrics listener"))?;
    log_info(
        COMPONENT,
        "health and metrics server listening",
        &[("addr", &addr.to_string())],
    );
    axum::serve(listener, router)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(|e| -> Box<dyn Error + Send + Sync> {
            with_context(e, "health/metrics server failed")
        })?;
    Ok(())
}
