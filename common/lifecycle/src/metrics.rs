pub(crate) const METRIC_SHUTDOWN_INITIATED: &str = "lifecycle_shutdown_initiated_total";
pub(crate) const METRIC_SHUTDOWN_COMPLETED: &str = "lifecycle_shutdown_completed_total";
pub(crate) const METRIC_SHUTDOWN_DURATION: &str = "lifecycle_shutdown_duration_seconds";

pub(crate) fn emit_shutdown_initiated(service_name: &str, trigger_reason: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_INITIATED,
        "service_name" => service_name.to_string(),
        "trigger_reason" => trigger_reason.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_completed(service_name: &str, clean: bool) {
    metrics::counter!(
        METRIC_SHUTDOWN_COMPLETED,
        "service_name" => service_name.to_string(),
        "clean" => clean.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_duration(service_name: &str, result: &str, duration_secs: f64) {
    metrics::histogram!(
        METRIC_SHUTDOWN_DURATION,
        "service_name" => service_name.to_string(),
        "result" => result.to_string()
    )
    .record(duration_secs);
}
