// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

/// Operational counters and gauges, registered once at bootstrap.
#[derive(Clone)]
pub struct BridgeMetrics {
    pub inbound_queue_size: IntGauge,
    pub outbound_queue_size: IntGauge,
    pub pending_outbound_size: IntGauge,
    pub app_chain_height: IntGauge,
    pub pub_chain_height: IntGauge,
    pub inbound_submitted: IntCounter,
    pub inbound_confirmed: IntCounter,
    pub outbound_submitted: IntCounter,
    pub outbound_confirmed: IntCounter,
    pub move_fund_attempts: IntCounter,
    pub pipeline_paused: IntCounterVec,
    pub errors: IntCounterVec,
}

impl BridgeMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            inbound_queue_size: register_int_gauge_with_registry!(
                "bridge_inbound_queue_size",
                "Requests waiting in the inbound queue",
                registry,
            )
            .unwrap(),
            outbound_queue_size: register_int_gauge_with_registry!(
                "bridge_outbound_queue_size",
                "Requests waiting in the outbound queue",
                registry,
            )
            .unwrap(),
            pending_outbound_size: register_int_gauge_with_registry!(
                "bridge_pending_outbound_size",
                "Outbound requests awaiting destination verification",
                registry,
            )
            .unwrap(),
            app_chain_height: register_int_gauge_with_registry!(
                "bridge_app_chain_height",
                "Latest observed app-chain block height",
                registry,
            )
            .unwrap(),
            pub_chain_height: register_int_gauge_with_registry!(
                "bridge_pub_chain_height",
                "Latest observed pub-chain block height",
                registry,
            )
            .unwrap(),
            inbound_submitted: register_int_counter_with_registry!(
                "bridge_inbound_submitted_total",
                "Inbound issue transactions broadcast to the app chain",
                registry,
            )
            .unwrap(),
            inbound_confirmed: register_int_counter_with_registry!(
                "bridge_inbound_confirmed_total",
                "Inbound requests confirmed on the app chain",
                registry,
            )
            .unwrap(),
            outbound_submitted: register_int_counter_with_registry!(
                "bridge_outbound_submitted_total",
                "Outbound transfers broadcast to the pub chain",
                registry,
            )
            .unwrap(),
            outbound_confirmed: register_int_counter_with_registry!(
                "bridge_outbound_confirmed_total",
                "Outbound transfers confirmed on the pub chain",
                registry,
            )
            .unwrap(),
            move_fund_attempts: register_int_counter_with_registry!(
                "bridge_move_fund_attempts_total",
                "Attempts to drain a retired pool",
                registry,
            )
            .unwrap(),
            pipeline_paused: register_int_counter_vec_with_registry!(
                "bridge_pipeline_paused_total",
                "Backpressure pauses entered, by direction",
                &["direction"],
                registry,
            )
            .unwrap(),
            errors: register_int_counter_vec_with_registry!(
                "bridge_errors_total",
                "Errors by type",
                &["error_type"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        Self::new(&Registry::new())
    }

    pub fn record_error(&self, error: &crate::error::BridgeError) {
        self.errors.with_label_values(&[error.error_type()]).inc();
    }
}
