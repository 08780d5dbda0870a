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

use std::sync::OnceLock;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

const SUBSYSTEM: &str = "boost";

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static BOOST_CONFIGURATIONS: OnceLock<IntGaugeVec> = OnceLock::new();
static BOOST_CONTAINERS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static BOOST_CONTAINERS_ACTIVE: OnceLock<IntGaugeVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry::new_custom(None, None).expect("metrics registry"))
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register boost metric collector");
    collector
}

fn boost_configurations() -> &'static IntGaugeVec {
    BOOST_CONFIGURATIONS.get_or_init(|| {
        let opts = Opts::new(
            "configurations",
            "Number of registered startup CPU boost configurations",
        )
        .subsystem(SUBSYSTEM);
        let gauge =
            IntGaugeVec::new(opts, &["namespace"]).expect("failed to build configurations gauge");
        register_collector(gauge)
    })
}

fn boost_containers_total() -> &'static IntCounterVec {
    BOOST_CONTAINERS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "containers_total",
            "Number of containers which CPU resources were increased",
        )
        .subsystem(SUBSYSTEM);
        let counter = IntCounterVec::new(opts, &["namespace", "boost"])
            .expect("failed to build containers total counter");
        register_collector(counter)
    })
}

fn boost_containers_active() -> &'static IntGaugeVec {
    BOOST_CONTAINERS_ACTIVE.get_or_init(|| {
        let opts = Opts::new(
            "containers_active",
            "Number of containers which CPU resources were increased and not yet reverted",
        )
        .subsystem(SUBSYSTEM);
        let gauge = IntGaugeVec::new(opts, &["namespace", "boost"])
            .expect("failed to build containers active gauge");
        register_collector(gauge)
    })
}

/// Records a newly registered boost configuration.
pub fn new_boost_configuration(namespace: &str) {
    boost_configurations().with_label_values(&[namespace]).inc();
}

/// Records the removal of a boost configuration.
pub fn delete_boost_configuration(namespace: &str) {
    boost_configurations().with_label_values(&[namespace]).dec();
}

pub fn set_boost_containers_active(namespace: &str, boost: &str, value: i64) {
    boost_containers_active()
        .with_label_values(&[namespace, boost])
        .set(value);
}

pub fn add_boost_containers_total(namespace: &str, boost: &str, value: u64) {
    boost_containers_total()
        .with_label_values(&[namespace, boost])
        .inc_by(value);
}

/// Drops the per-boost series when a configuration goes away.
pub fn clear_boost_metrics(namespace: &str, boost: &str) {
    let labels = [namespace, boost];
    let _ = boost_containers_total().remove_label_values(&labels);
    let _ = boost_containers_active().remove_label_values(&labels);
}

/// Renders the process registry in Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry().gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Test helpers reading back collector values.
pub fn boost_configurations_value(namespace: &str) -> i64 {
    boost_configurations().with_label_values(&[namespace]).get()
}

pub fn boost_containers_total_value(namespace: &str, boost: &str) -> u64 {
    boost_containers_total()
        .with_label_values(&[namespace, boost])
        .get()
}

pub fn boost_containers_active_value(namespace: &str, boost: &str) -> i64 {
    boost_containers_active()
        .with_label_values(&[namespace, boost])
        .get()
}

/// Resets every collector. Only tests call this.
pub fn clear_all_metrics() {
    boost_configurations().reset();
    boost_containers_total().reset();
    boost_containers_active().reset();
}
