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

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use cpuboost::cpuboost::boost::manager::{BoostManager, IntervalTicker};
use cpuboost::cpuboost::config::{Config, EnvConfigProvider};
use cpuboost::cpuboost::controller::boost_controller::BoostController;
use cpuboost::cpuboost::k8s::client::{ClusterClient, HttpClusterClient};
use cpuboost::cpuboost::logger::{
    log_error, log_info, log_warn, set_log_format, set_min_level, LogFormat, LogLevel,
};
use cpuboost::cpuboost::observability::health::ReadinessState;
use cpuboost::cpuboost::server::{
    ops_router, parse_bind_addr, serve_ops, serve_webhook, tls, webhook_router,
    DEFAULT_WEBHOOK_BIND_ADDR,
};
use cpuboost::cpuboost::util::cluster_info::{
    should_use_legacy_revert_mode, ClusterInfo, IN_PLACE_POD_VERTICAL_SCALING_FEATURE,
    POD_LEVEL_RESOURCES_FEATURE,
};
use cpuboost::cpuboost::webhook::boost_validator::BoostValidator;
use cpuboost::cpuboost::webhook::pod_mutator::PodMutator;

const COMPONENT: &str = "main";

fn configure_logging(config: &Config) {
    if config.zap_development {
        set_log_format(LogFormat::Text);
        set_min_level(LogLevel::Debug);
        return;
    }
    set_log_format(LogFormat::Json);
    set_min_level(match config.zap_log_level {
        level if level <= -1 => LogLevel::Debug,
        0 => LogLevel::Info,
        1 => LogLevel::Warn,
        _ => LogLevel::Error,
    });
}

fn fatal(message: &str, error: &str) -> ! {
    log_error(COMPONENT, message, &[("error", error)]);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let (config, config_result) = EnvConfigProvider::new().load_config();
    configure_logging(&config);
    if let Err(err) = config_result {
        log_warn(
            COMPONENT,
            "configuration errors, defaults apply for affected values",
            &[("error", &err.to_string())],
        );
    }
    log_info(
        COMPONENT,
        "starting operator",
        &[
            ("namespace", config.namespace.as_str()),
            (
                "checkIntervalSec",
                &config.mgr_check_interval_sec.to_string(),
            ),
            ("removeLimits", &config.remove_limits.to_string()),
            ("leaderElection", &config.leader_election.to_string()),
        ],
    );

    let client: Arc<dyn ClusterClient> = match HttpClusterClient::from_env() {
        Ok(client) => Arc::new(client),
        Err(err) => fatal("failed to build cluster API client", &err.to_string()),
    };

    let cluster_info = ClusterInfo::new(client.clone());
    let server_version = match cluster_info.get_cluster_version().await {
        Ok(version) => version,
        Err(err) => fatal("failed to discover server version", &err.to_string()),
    };
    let legacy_revert = should_use_legacy_revert_mode(&server_version);
    log_info(
        COMPONENT,
        "discovered server version",
        &[
            ("version", server_version.as_str()),
            ("legacyRevertMode", &legacy_revert.to_string()),
        ],
    );

    let mut pod_level_resources = false;
    if config.validate_feature_enabled {
        let gates = match cluster_info.get_feature_gates().await {
            Ok(gates) => gates,
            Err(err) => fatal("failed to validate cluster feature gates", &err.to_string()),
        };
        if !gates.is_enabled_any_stage(IN_PLACE_POD_VERTICAL_SCALING_FEATURE) {
            fatal(
                "required feature gate is disabled on the cluster",
                IN_PLACE_POD_VERTICAL_SCALING_FEATURE,
            );
        }
        pod_level_resources = gates.is_enabled_any_stage(POD_LEVEL_RESOURCES_FEATURE);
        log_info(
            COMPONENT,
            "validated cluster feature gates",
            &[("podLevelResources", &pod_level_resources.to_string())],
        );
    }

    let manager = Arc::new(BoostManager::new());
    let controller = Arc::new(BoostController::new(
        client.clone(),
        manager.clone(),
        legacy_revert,
    ));
    manager.set_reconciler(controller.clone()).await;

    let mutator = Arc::new(PodMutator::new(
        manager.clone(),
        config.remove_limits,
        pod_level_resources,
    ));
    let validator = Arc::new(BoostValidator);
    let readiness = ReadinessState::new();

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "failed to install SIGTERM handler",
                        &[("error", &err.to_string())],
                    );
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
            log_info(COMPONENT, "shutdown signal received", &[]);
            token.cancel();
        });
    }

    let acceptor = match tls::build_tls_acceptor(Path::new(tls::DEFAULT_CERT_DIR), config.http2) {
        Ok(acceptor) => acceptor,
        Err(err) => fatal("failed to load webhook TLS material", &err.to_string()),
    };
    let webhook_addr = match parse_bind_addr(DEFAULT_WEBHOOK_BIND_ADDR) {
        Ok(addr) => addr,
        Err(err) => fatal("invalid webhook bind address", &err.to_string()),
    };
    let ops_addr = match parse_bind_addr(&config.health_probe_bind_addr) {
        Ok(addr) => addr,
        Err(err) => fatal("invalid health probe bind address", &err.to_string()),
    };

    {
        let router = webhook_router(mutator, validator);
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_webhook(webhook_addr, acceptor, router, token.clone()).await {
                log_error(
                    COMPONENT,
                    "webhook server failed",
                    &[("error", &err.to_string())],
                );
                token.cancel();
            }
        });
    }
    {
        let router = ops_router(manager.clone(), readiness.clone());
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_ops(ops_addr, router, token.clone()).await {
                log_error(
                    COMPONENT,
                    "health/metrics server failed",
                    &[("error", &err.to_string())],
                );
                token.cancel();
            }
        });
    }

    readiness.mark_setup_complete();
    let ticker = IntervalTicker::new(Duration::from_secs(config.mgr_check_interval_sec.max(1)));
    manager.start(token, ticker).await;
    log_info(COMPONENT, "operator stopped", &[]);
}
