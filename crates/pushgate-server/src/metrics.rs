//! Push outcome counters, exposed via `/metrics` in Prometheus text
//! exposition format.

use std::sync::OnceLock;

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const SUCCESS_METRIC: &str = "push_success_total";
const ERROR_METRIC: &str = "push_error_total";

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder on first call and returns its
/// handle; subsequent calls (tests building multiple `AppState`s in one
/// process) return the same handle rather than re-installing.
pub fn install() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("prometheus recorder installs exactly once per process")
        })
        .clone()
}

/// Records one push outcome for `service`, incrementing either
/// `push_success_total{service}` or `push_error_total{service}`.
pub fn count_push(service: &str, success: bool) {
    let service = service.to_string();
    if success {
        counter!(SUCCESS_METRIC, "service" => service).increment(1);
    } else {
        counter!(ERROR_METRIC, "service" => service).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_push_does_not_panic_without_recorder() {
        // metrics-rs no-ops silently when no recorder is installed, which
        // is exactly what a unit test (outside the server's main()) wants.
        count_push("apns", true);
        count_push("apns", false);
    }
}
