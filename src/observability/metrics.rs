//! Prometheus metrics.

use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;

/// Default port of the scrape endpoint.
const DEFAULT_METRICS_PORT: u16 = 9090;

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Whether metrics are recorded at all.
    pub enabled: bool,
    /// Whether to serve `/metrics` over HTTP.
    pub expose: bool,
    /// Address of the scrape endpoint.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            expose: false,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_METRICS_PORT),
        }
    }
}

impl MetricsConfig {
    /// Builds metrics configuration from environment variables.
    ///
    /// Reads `POOLKEEPER_METRICS_ENABLED` and `POOLKEEPER_METRICS_PORT`;
    /// setting a port also turns on the HTTP listener.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(enabled) = parse_bool_env("POOLKEEPER_METRICS_ENABLED") {
            config.enabled = enabled;
        }
        if let Some(port) = parse_port_env("POOLKEEPER_METRICS_PORT") {
            config.listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
            config.expose = true;
        }
        config
    }
}

/// Registers descriptions for the metrics this crate emits.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "registry_constructions_total",
        "Backend construction attempts by backend and outcome"
    );
    metrics::describe_gauge!("registry_entries", "Ready aliases per backend");
    metrics::describe_counter!(
        "cache_aside_requests_total",
        "Cache-aside lookups by outcome (hit, miss, refresh)"
    );
    metrics::describe_counter!(
        "singleflight_shared_total",
        "Callers served by another caller's in-flight work"
    );
    metrics::describe_counter!(
        "url_cache_derivations_total",
        "URL derivations, split by whether the result was cacheable"
    );
    metrics::describe_counter!(
        "pool_connections_opened_total",
        "Connections opened by blocking pools"
    );
    metrics::describe_counter!(
        "pool_acquire_timeouts_total",
        "Pool checkouts that gave up waiting"
    );
    metrics::describe_counter!(
        "lock_poison_recovery_total",
        "Poisoned locks recovered"
    );
}

/// Installs the Prometheus recorder, and its HTTP listener when exposed.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if a recorder is already installed or
/// the listener cannot start.
pub fn install_prometheus(config: &MetricsConfig) -> Result<Option<PrometheusHandle>> {
    if !config.enabled {
        return Ok(None);
    }

    let builder = PrometheusBuilder::new();
    let handle = if config.expose {
        install_listener(builder.with_http_listener(config.listen_addr))?
    } else {
        builder
            .install_recorder()
            .map_err(|e| Error::operation_failed("metrics_recorder_install", e))?
    };
    describe_metrics();
    Ok(Some(handle))
}

fn install_listener(builder: PrometheusBuilder) -> Result<PrometheusHandle> {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        return install_with_runtime(builder, &handle);
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::operation_failed("metrics_runtime_init", e))?;
    let handle = runtime.handle().clone();
    let prometheus = install_with_runtime(builder, &handle)?;
    thread::Builder::new()
        .name("poolkeeper-metrics-http".to_string())
        .spawn(move || runtime.block_on(std::future::pending::<()>()))
        .map_err(|e| Error::operation_failed("metrics_runtime_thread", e))?;
    Ok(prometheus)
}

fn install_with_runtime(
    builder: PrometheusBuilder,
    runtime_handle: &tokio::runtime::Handle,
) -> Result<PrometheusHandle> {
    let (recorder, exporter) = {
        let _guard = runtime_handle.enter();
        builder
            .build()
            .map_err(|e| Error::operation_failed("metrics_exporter_build", e))?
    };
    let handle = recorder.handle();
    set_global_recorder(recorder)?;
    runtime_handle.spawn(exporter);
    Ok(handle)
}

fn set_global_recorder(recorder: PrometheusRecorder) -> Result<()> {
    metrics::set_global_recorder(recorder)
        .map_err(|e| Error::operation_failed("metrics_recorder_install", e))
}

fn parse_bool_env(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|value| {
        let value = value.to_lowercase();
        value == "true" || value == "1" || value == "yes"
    })
}

fn parse_port_env(key: &str) -> Option<u16> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
}
