use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!(
            "notifications_received_total",
            "Number of notification pokes received"
        );
        metrics::describe_counter!(
            "notification_devices_received_total",
            "Number of devices been asked to push"
        );
        metrics::describe_counter!(
            "dispatches_total",
            "Number of pushes sent via each backend"
        );
        metrics::describe_counter!(
            "pushgateway_status_codes_total",
            "HTTP response codes given on the Push Gateway API"
        );
        metrics::describe_counter!(
            "inflight_limit_drop_total",
            "Number of notifications dropped because the number of in-flight \
             requests exceeded the configured inflight_request_limit"
        );
        metrics::describe_counter!(
            "apns_status_codes_total",
            "Number of HTTP response status codes received from APNs"
        );
        metrics::describe_counter!(
            "fcm_status_codes_total",
            "Number of HTTP response status codes received from FCM"
        );
        metrics::describe_counter!(
            "webpush_status_codes_total",
            "Number of HTTP response status codes received from Web Push endpoints"
        );
        metrics::describe_gauge!(
            "client_cert_expiry_seconds",
            "Expiry date of the APNs client certificate in seconds since the epoch"
        );
        metrics::describe_histogram!(
            "dispatch_duration_seconds",
            "Time taken to dispatch a notification to a backend"
        );

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

/// Handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    handle: axum::extract::State<PrometheusHandle>,
) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}
