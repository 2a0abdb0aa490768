// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Optional monitoring endpoint: prometheus exposition plus a liveness
//! probe, served only when `enable-monitor` is set.

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

async fn metrics_handler(State(registry): State<Registry>) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        error!("cannot encode metrics: {}", err);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn health_handler() -> &'static str {
    "ok"
}

pub fn start_monitor_server(
    port: u16,
    registry: Registry,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(registry);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("monitor server listening on {}", addr);
    tokio::spawn(async move {
        let server = axum::Server::bind(&addr)
            .serve(router.into_make_service())
            .with_graceful_shutdown(async move { cancel.cancelled().await });
        if let Err(err) = server.await {
            error!("monitor server failed: {}", err);
        }
    })
}
