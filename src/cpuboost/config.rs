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

use std::env;

use crate::cpuboost::util::error::{join_errors, new_error, BoxError};

pub const POD_NAMESPACE_ENV_VAR: &str = "POD_NAMESPACE";
pub const MGR_CHECK_INTERVAL_ENV_VAR: &str = "MGR_CHECK_INTERVAL";
pub const LEADER_ELECTION_ENV_VAR: &str = "LEADER_ELECTION";
pub const METRICS_PROBE_BIND_ADDR_ENV_VAR: &str = "METRICS_PROBE_BIND_ADDR";
pub const HEALTH_PROBE_BIND_ADDR_ENV_VAR: &str = "HEALTH_PROBE_BIND_ADDR";
pub const SECURE_METRICS_ENV_VAR: &str = "SECURE_METRICS";
pub const ZAP_LOG_LEVEL_ENV_VAR: &str = "ZAP_LOG_LEVEL";
pub const ZAP_DEVELOPMENT_ENV_VAR: &str = "ZAP_DEVELOPMENT";
pub const HTTP2_ENV_VAR: &str = "HTTP2";
pub const REMOVE_LIMITS_ENV_VAR: &str = "REMOVE_LIMITS";
pub const VALIDATE_FEATURE_ENABLED_ENV_VAR: &str = "VALIDATE_FEATURE_ENABLED";

pub const POD_NAMESPACE_DEFAULT: &str = "kube-startup-cpu-boost-system";
pub const MGR_CHECK_INTERVAL_SEC_DEFAULT: u64 = 5;
pub const LEADER_ELECTION_DEFAULT: bool = false;
pub const METRICS_PROBE_BIND_ADDR_DEFAULT: &str = ":8080";
pub const HEALTH_PROBE_BIND_ADDR_DEFAULT: &str = ":8081";
pub const SECURE_METRICS_DEFAULT: bool = false;
pub const ZAP_LOG_LEVEL_DEFAULT: i32 = 0;
pub const ZAP_DEVELOPMENT_DEFAULT: bool = false;
pub const HTTP2_DEFAULT: bool = false;
pub const REMOVE_LIMITS_DEFAULT: bool = true;
pub const VALIDATE_FEATURE_ENABLED_DEFAULT: bool = true;

/// Operator configuration assembled from environment variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Namespace the operator runs in.
    pub namespace: String,
    /// Seconds between boost manager checks for time based duration policies.
    pub mgr_check_interval_sec: u64,
    /// Enables leader election for the controller manager.
    pub leader_election: bool,
    /// Bind address for the metrics endpoint.
    pub metrics_probe_bind_addr: String,
    /// Bind address for the health probe endpoint.
    pub health_probe_bind_addr: String,
    /// Serve the metrics endpoint over TLS.
    pub secure_metrics: bool,
    /// Log verbosity; values below zero enable debug output.
    pub zap_log_level: i32,
    /// Development mode logging (text format, debug level).
    pub zap_development: bool,
    /// Allow HTTP/2 on the webhook and metrics servers.
    pub http2: bool,
    /// Remove CPU limits from containers for the duration of the boost.
    pub remove_limits: bool,
    /// Validate required cluster feature gates at startup.
    pub validate_feature_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: POD_NAMESPACE_DEFAULT.to_string(),
            mgr_check_interval_sec: MGR_CHECK_INTERVAL_SEC_DEFAULT,
            leader_election: LEADER_ELECTION_DEFAULT,
            metrics_probe_bind_addr: METRICS_PROBE_BIND_ADDR_DEFAULT.to_string(),
            health_probe_bind_addr: HEALTH_PROBE_BIND_ADDR_DEFAULT.to_string(),
            secure_metrics: SECURE_METRICS_DEFAULT,
            zap_log_level: ZAP_LOG_LEVEL_DEFAULT,
            zap_development: ZAP_DEVELOPMENT_DEFAULT,
            http2: HTTP2_DEFAULT,
            remove_limits: REMOVE_LIMITS_DEFAULT,
            validate_feature_enabled: VALIDATE_FEATURE_ENABLED_DEFAULT,
        }
    }
}

pub type LookupEnvFn = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Loads `Config` from environment variables with an injectable lookup
/// function so tests do not have to mutate the process environment.
pub struct EnvConfigProvider {
    lookup: Box<LookupEnvFn>,
}

impl EnvConfigProvider {
    pub fn new() -> Self {
        Self::with_lookup(Box::new(|key| env::var(key).ok()))
    }

    pub fn with_lookup(lookup: Box<LookupEnvFn>) -> Self {
        Self { lookup }
    }

    /// Loads configuration, applying defaults for absent variables. Parse
    /// failures are collected and returned together; the affected fields keep
    /// their defaults.
    pub fn load_config(&self) -> (Config, Result<(), BoxError>) {
        let mut config = Config::default();
        let mut errs: Vec<BoxError> = Vec::new();

        if let Some(v) = (self.lookup)(POD_NAMESPACE_ENV_VAR) {
            config.namespace = v;
        }
        self.load_u64(
            MGR_CHECK_INTERVAL_ENV_VAR,
            &mut config.mgr_check_interval_sec,
            &mut errs,
        );
        self.load_bool(LEADER_ELECTION_ENV_VAR, &mut config.leader_election, &mut errs);
        if let Some(v) = (self.lookup)(METRICS_PROBE_BIND_ADDR_ENV_VAR) {
            config.metrics_probe_bind_addr = v;
        }
        if let Some(v) = (self.lookup)(HEALTH_PROBE_BIND_ADDR_ENV_VAR) {
            config.health_probe_bind_addr = v;
        }
        self.load_bool(SECURE_METRICS_ENV_VAR, &mut config.secure_metrics, &mut errs);
        self.load_i32(ZAP_LOG_LEVEL_ENV_VAR, &mut config.zap_log_level, &mut errs);
        self.load_bool(ZAP_DEVELOPMENT_ENV_VAR, &mut config.zap_development, &mut errs);
        self.load_bool(HTTP2_ENV_VAR, &mut config.http2, &mut errs);
        self.load_bool(REMOVE_LIMITS_ENV_VAR, &mut config.remove_limits, &mut errs);
        self.load_bool(
            VALIDATE_FEATURE_ENABLED_ENV_VAR,
            &mut config.validate_feature_enabled,
            &mut errs,
        );

        (config, join_errors(errs))
    }

    fn load_u64(&self, key: &str, target: &mut u64, errs: &mut Vec<BoxError>) {
        if let Some(v) = (self.lookup)(key) {
            match v.trim().parse::<u64>() {
                Ok(parsed) => *target = parsed,
                Err(e) => errs.push(new_error(format!("{} value is not an int: {}", key, e))),
            }
        }
    }

    fn load_i32(&self, key: &str, target: &mut i32, errs: &mut Vec<BoxError>) {
        if let Some(v) = (self.lookup)(key) {
            match v.trim().parse::<i32>() {
                Ok(parsed) => *target = parsed,
                Err(e) => errs.push(new_error(format!("{} value is not an int: {}", key, e))),
            }
        }
    }

    fn load_bool(&self, key: &str, target: &mut bool, errs: &mut Vec<BoxError>) {
        if let Some(v) = (self.lookup)(key) {
            match parse_bool(&v) {
                Some(parsed) => *target = parsed,
                None => errs.push(new_error(format!("{} value is not a bool: {}", key, v))),
            }
        }
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
