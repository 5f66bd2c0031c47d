use std::sync::Arc;

use anyhow::Context;
use metrics::Unit;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const TUNNELS_ACTIVE: &str = "ferry_tunnels_active";
pub const SOCKETS_CONNECTED: &str = "ferry_tunnel_sockets_connected";
pub const SOCKETS_ADMITTED: &str = "ferry_tunnel_sockets_admitted_total";
pub const SOCKETS_REJECTED: &str = "ferry_tunnel_sockets_rejected_total";
pub const PROXY_REQUESTS: &str = "ferry_proxy_requests_total";
pub const PROXY_UPGRADES: &str = "ferry_proxy_upgrades_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_gauge!(TUNNELS_ACTIVE, Unit::Count, "Registered tunnels.");
    metrics::describe_gauge!(
        SOCKETS_CONNECTED,
        Unit::Count,
        "Tunnel sockets currently admitted, idle or leased."
    );
    metrics::describe_counter!(
        SOCKETS_ADMITTED,
        Unit::Count,
        "Tunnel sockets admitted into a pool."
    );
    metrics::describe_counter!(
        SOCKETS_REJECTED,
        Unit::Count,
        "Tunnel sockets refused because the pool was full or closed."
    );
    metrics::describe_counter!(
        PROXY_REQUESTS,
        Unit::Count,
        "Public HTTP requests forwarded through a tunnel."
    );
    metrics::describe_counter!(
        PROXY_UPGRADES,
        Unit::Count,
        "Public upgrade requests spliced onto a tunnel."
    );
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
