use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::trace;

/// Port of the Prometheus listener when no address is configured.
pub const DEFAULT_METRICS_PORT: u16 = 9000;

/// Interval between histogram upkeep runs of the cached handle.
const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

// A recorder can be installed only once per process, while tests ask for a handle many times.
// The fallible initialization rules out `OnceLock`.
static PROMETHEUS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Installs the Prometheus recorder once and returns a handle for rendering metrics.
///
/// Must be called from within a tokio runtime since upkeep runs on a spawned task.
pub fn init_metrics_handle() -> Result<PrometheusHandle, BuildError> {
    let mut prometheus_handle = PROMETHEUS_HANDLE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(handle) = &*prometheus_handle {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    *prometheus_handle = Some(handle.clone());

    let upkeep_handle = handle.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(UPKEEP_INTERVAL).await;
            trace!("running metrics upkeep");
            upkeep_handle.run_upkeep();
        }
    });

    Ok(handle)
}

/// Installs the Prometheus recorder with an HTTP listener serving `/metrics`.
///
/// Listens on `[::]:9000` unless `address` is given. Every metric carries a `pipeline_id`
/// label when `pipeline_id` is set.
pub fn init_metrics(address: Option<SocketAddr>, pipeline_id: Option<&str>) -> Result<(), BuildError> {
    let address = address.unwrap_or_else(|| {
        SocketAddr::new(
            std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            DEFAULT_METRICS_PORT,
        )
    });
    let mut builder = PrometheusBuilder::new().with_http_listener(address);

    if let Some(pipeline_id) = pipeline_id {
        builder = builder.add_global_label("pipeline_id", pipeline_id);
    }

    builder.install()?;

    Ok(())
}
