use std::sync::OnceLock;

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static FILTER_RELOAD: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
    let _ = FILTER_RELOAD.set(handle);
}

/// Apply the `log_level` setting at runtime. Unknown levels fall back to info.
pub fn set_log_level(level: &str) {
    let directive = match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    };
    if let Some(handle) = FILTER_RELOAD.get() {
        let _ = handle.reload(EnvFilter::new(directive));
    }
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

pub fn metrics_handle() -> Option<PrometheusHandle> {
    METRICS_HANDLE.get().cloned()
}

pub fn record_handshake(result: &str) {
    counter!(
        "porpulsion_handshake_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// Trust failures: bad invite token, fingerprint mismatch, unknown CA.
pub fn record_trust_error(kind: &str) {
    counter!(
        "porpulsion_trust_errors_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_channel_connect(direction: &str) {
    counter!(
        "porpulsion_channel_connects_total",
        "direction" => direction.to_string()
    )
    .increment(1);
}

pub fn record_channel_reconnect(peer: &str) {
    counter!(
        "porpulsion_channel_reconnects_total",
        "peer" => peer.to_string()
    )
    .increment(1);
}

pub fn record_admission(result: &str) {
    counter!(
        "porpulsion_admission_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_executor_apply(result: &str) {
    counter!(
        "porpulsion_executor_apply_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_tunnel_request(result: &str) {
    counter!(
        "porpulsion_tunnel_requests_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_push_dropped(peer: &str) {
    counter!(
        "porpulsion_channel_push_dropped_total",
        "peer" => peer.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_after_recording() {
        let handle = init_metrics_recorder();
        record_trust_error("fingerprint_mismatch");
        record_admission("image_blocked");

        let rendered = handle.render();
        assert!(
            rendered.contains("porpulsion_trust_errors_total"),
            "trust error counter missing: {rendered}"
        );
        assert!(
            rendered.contains("porpulsion_admission_total"),
            "admission counter missing: {rendered}"
        );
    }
}
