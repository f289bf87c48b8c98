//! The Push Gateway API surface: `POST /_matrix/push/v1/notify`.
//!
//! Parses one notification, fans it out over its devices in input order,
//! and answers with the union of permanently-rejected pushkeys. Devices
//! are dispatched sequentially within a request; concurrency lives across
//! requests, bounded per backend.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{warn, Instrument};

use crate::backends::BackendHandle;
use crate::error::DispatchError;
use crate::health;
use crate::metrics::metrics_handler;
use crate::notifications::{Device, Notification, NotificationContext};
use crate::router::{AppIdRouter, Resolution};

/// Inbound bodies over this size are refused.
pub const MAX_BODY_SIZE: usize = 512 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<AppIdRouter<Arc<BackendHandle>>>,
}

/// Assemble the full application router. The metrics endpoint is only
/// mounted when a recorder handle is supplied.
pub fn build_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let metrics_router = match metrics_handle {
        Some(handle) => Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(handle),
        None => Router::new(),
    };

    Router::new()
        .route("/_matrix/push/v1/notify", post(notify_v1))
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(metrics_router)
}

async fn notify_v1(State(state): State<AppState>, body: Bytes) -> Response {
    metrics::counter!("notifications_received_total", 1);

    let context = NotificationContext::new();
    let span = tracing::info_span!(
        "pushgateway_v1_notify",
        request_id = %context.request_id
    );

    let response = handle_notify(&state, &context, &body).instrument(span).await;

    metrics::counter!(
        "pushgateway_status_codes_total",
        1,
        "code" => response.status().as_u16().to_string()
    );
    response
}

async fn handle_notify(
    state: &AppState,
    context: &NotificationContext,
    body: &[u8],
) -> Response {
    let parsed: serde_json::Value = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Expected JSON request body");
            return (StatusCode::BAD_REQUEST, "Expected JSON request body").into_response();
        }
    };

    let Some(raw_notification) = parsed.get("notification").filter(|n| n.is_object()) else {
        let msg = "Invalid notification: expecting object in 'notification' key";
        warn!("{msg}");
        return (StatusCode::BAD_REQUEST, msg).into_response();
    };

    let notification: Notification = match serde_json::from_value(raw_notification.clone()) {
        Ok(notification) => notification,
        Err(e) => {
            warn!(error = %e, "Invalid notification");
            return (StatusCode::BAD_REQUEST, format!("Invalid notification: {e}"))
                .into_response();
        }
    };

    if notification.devices.is_empty() {
        let msg = "No devices in notification";
        warn!("{msg}");
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    match dispatch_notification(state, &notification, context).await {
        Ok(rejected) => {
            tracing::info!(
                num_rejected = rejected.len(),
                elapsed_ms = context.start_time.elapsed().as_millis() as u64,
                "Delivered notification"
            );
            (StatusCode::OK, Json(json!({ "rejected": rejected }))).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to dispatch notification");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Fan a notification out over its devices, preserving input order in the
/// rejection list.
///
/// Batching backends receive all their matching devices in one dispatch;
/// the returned rejections are slotted back to each device's position so
/// the response order stays a subsequence of the request order.
async fn dispatch_notification(
    state: &AppState,
    notification: &Notification,
    context: &NotificationContext,
) -> Result<Vec<String>, DispatchError> {
    let devices = &notification.devices;
    metrics::counter!("notification_devices_received_total", devices.len() as u64);

    let resolutions: Vec<Resolution<Arc<BackendHandle>>> = devices
        .iter()
        .map(|device| state.router.resolve(&device.app_id))
        .collect();

    let mut rejected_per_device: Vec<Vec<String>> = vec![Vec::new(); devices.len()];
    let mut handled = vec![false; devices.len()];

    for i in 0..devices.len() {
        if handled[i] {
            continue;
        }
        handled[i] = true;

        let backend = match &resolutions[i] {
            Resolution::NoMatch => {
                warn!(app_id = %devices[i].app_id, "Notification for unknown app ID");
                rejected_per_device[i].push(devices[i].pushkey.clone());
                continue;
            }
            Resolution::Ambiguous => {
                warn!(
                    app_id = %devices[i].app_id,
                    "App ID matches multiple configured backends, rejecting"
                );
                rejected_per_device[i].push(devices[i].pushkey.clone());
                continue;
            }
            Resolution::Unique(backend) => backend,
        };

        if backend.batches() {
            let mut group = vec![i];
            for (j, handled_j) in handled.iter_mut().enumerate().skip(i + 1) {
                if *handled_j {
                    continue;
                }
                if let Resolution::Unique(other) = &resolutions[j] {
                    if Arc::ptr_eq(backend, other) {
                        *handled_j = true;
                        group.push(j);
                    }
                }
            }

            metrics::counter!(
                "dispatches_total",
                group.len() as u64,
                "backend" => backend.name().to_string()
            );

            let group_devices: Vec<&Device> = group.iter().map(|&j| &devices[j]).collect();
            let rejected = backend
                .dispatch(notification, &group_devices, context)
                .await?;

            // slot each rejection back to the device that owns it
            let mut claimed = vec![false; group.len()];
            for pushkey in rejected {
                let slot = group
                    .iter()
                    .enumerate()
                    .find(|&(gi, &j)| !claimed[gi] && devices[j].pushkey == pushkey);
                match slot {
                    Some((gi, &j)) => {
                        claimed[gi] = true;
                        rejected_per_device[j].push(pushkey);
                    }
                    None => rejected_per_device[group[0]].push(pushkey),
                }
            }
        } else {
            metrics::counter!(
                "dispatches_total",
                1,
                "backend" => backend.name().to_string()
            );
            let rejected = backend
                .dispatch(notification, &[&devices[i]], context)
                .await?;
            rejected_per_device[i].extend(rejected);
        }
    }

    Ok(rejected_per_device.concat())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Backend;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records which pushkeys it was asked to dispatch and rejects a
    /// configured subset.
    struct ScriptedBackend {
        name: String,
        batches: bool,
        reject: Vec<String>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn batches(&self) -> bool {
            self.batches
        }

        async fn dispatch(
            &self,
            _notification: &Notification,
            devices: &[&Device],
            _context: &NotificationContext,
        ) -> Result<Vec<String>, DispatchError> {
            self.calls
                .lock()
                .push(devices.iter().map(|d| d.pushkey.clone()).collect());
            Ok(devices
                .iter()
                .filter(|d| self.reject.contains(&d.pushkey))
                .map(|d| d.pushkey.clone())
                .collect())
        }
    }

    fn state(backends: Vec<(&str, Arc<ScriptedBackend>)>) -> AppState {
        let mut router = AppIdRouter::new();
        for (app_id, backend) in backends {
            router
                .insert(app_id, Arc::new(BackendHandle::new(backend, 512)))
                .unwrap();
        }
        AppState {
            router: Arc::new(router),
        }
    }

    fn scripted(name: &str, batches: bool, reject: &[&str]) -> Arc<ScriptedBackend> {
        Arc::new(ScriptedBackend {
            name: name.to_string(),
            batches,
            reject: reject.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn notification(devices: serde_json::Value) -> Notification {
        serde_json::from_value(json!({ "devices": devices })).unwrap()
    }

    #[tokio::test]
    async fn test_rejections_preserve_device_order() {
        let fcm = scripted("com.example.gcm", true, &["gcm2"]);
        let apns = scripted("com.example.apns", false, &["apns1"]);
        let state = state(vec![
            ("com.example.gcm", fcm.clone()),
            ("com.example.apns", apns),
        ]);

        // fcm devices straddle the apns device; the batch dispatch runs at
        // the first fcm device but its rejection surfaces at gcm2's slot
        let n = notification(json!([
            {"app_id": "com.example.gcm", "pushkey": "gcm1"},
            {"app_id": "com.example.apns", "pushkey": "apns1"},
            {"app_id": "com.example.gcm", "pushkey": "gcm2"},
        ]));

        let rejected = dispatch_notification(&state, &n, &NotificationContext::new())
            .await
            .unwrap();
        assert_eq!(rejected, vec!["apns1", "gcm2"]);

        // exactly one upstream batch for both fcm devices
        let calls = fcm.calls.lock();
        assert_eq!(*calls, vec![vec!["gcm1".to_string(), "gcm2".to_string()]]);
    }

    #[tokio::test]
    async fn test_unknown_app_id_rejected_without_dispatch() {
        let apns = scripted("com.example.apns", false, &[]);
        let state = state(vec![("com.example.apns", apns.clone())]);

        let n = notification(json!([
            {"app_id": "org.unknown", "pushkey": "mystery"},
            {"app_id": "com.example.apns", "pushkey": "ok"},
        ]));

        let rejected = dispatch_notification(&state, &n, &NotificationContext::new())
            .await
            .unwrap();
        assert_eq!(rejected, vec!["mystery"]);
        assert_eq!(apns.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_app_id_rejected_without_dispatch() {
        let one = scripted("one", false, &[]);
        let two = scripted("two", false, &[]);
        let state = state(vec![("*.example.*", one.clone()), ("com.example.a*", two.clone())]);

        let n = notification(json!([
            {"app_id": "com.example.apns2", "pushkey": "spqr"},
        ]));

        let rejected = dispatch_notification(&state, &n, &NotificationContext::new())
            .await
            .unwrap();
        assert_eq!(rejected, vec!["spqr"]);
        assert!(one.calls.lock().is_empty());
        assert!(two.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_separate_batching_backends_not_merged() {
        let a = scripted("a", true, &[]);
        let b = scripted("b", true, &[]);
        let state = state(vec![("com.a", a.clone()), ("com.b", b.clone())]);

        let n = notification(json!([
            {"app_id": "com.a", "pushkey": "a1"},
            {"app_id": "com.b", "pushkey": "b1"},
            {"app_id": "com.a", "pushkey": "a2"},
        ]));

        dispatch_notification(&state, &n, &NotificationContext::new())
            .await
            .unwrap();
        assert_eq!(*a.calls.lock(), vec![vec!["a1".to_string(), "a2".to_string()]]);
        assert_eq!(*b.calls.lock(), vec![vec!["b1".to_string()]]);
    }
}
