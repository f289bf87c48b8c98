//! The backend contract shared by every push provider, plus the registry
//! that turns `apps` config entries into live backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::Config;
use crate::error::{DispatchError, SetupError};
use crate::notifications::{Device, Notification, NotificationContext};
use crate::proxy::Dialer;
use crate::router::AppIdRouter;

pub mod apns;
pub mod fcm;
pub mod webpush;

/// Maximum upstream attempts per dispatch.
pub const MAX_TRIES: u32 = 3;
/// Base backoff delay; attempt `i` (0-indexed) waits `base * 2^i` unless
/// the provider supplied its own `Retry-After`.
pub const RETRY_DELAY_BASE: Duration = Duration::from_secs(10);

/// Maximum in-flight dispatches per backend unless configured otherwise.
/// Past the limit, requests are shed rather than queued.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 512;

pub fn retry_delay(retry_number: u32, retry_after: Option<Duration>) -> Duration {
    retry_after.unwrap_or(RETRY_DELAY_BASE * 2u32.pow(retry_number))
}

/// A handler relaying notifications to one upstream push provider.
///
/// `dispatch` returns the pushkeys the provider has permanently rejected
/// (empty on success). Transient upstream trouble is retried internally;
/// anything else surfaces as a [`DispatchError`].
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Backends that batch (legacy FCM) receive every matching device of a
    /// notification in a single call; all others are called per device.
    fn batches(&self) -> bool {
        false
    }

    async fn dispatch(
        &self,
        notification: &Notification,
        devices: &[&Device],
        context: &NotificationContext,
    ) -> Result<Vec<String>, DispatchError>;
}

/// Wraps a backend with its in-flight admission counter so one slow
/// provider cannot starve the rest of the gateway.
pub struct BackendHandle {
    backend: Arc<dyn Backend>,
    inflight_limit: usize,
    inflight_current: AtomicUsize,
}

impl BackendHandle {
    pub fn new(backend: Arc<dyn Backend>, inflight_limit: usize) -> Self {
        Self {
            backend,
            inflight_limit,
            inflight_current: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn batches(&self) -> bool {
        self.backend.batches()
    }

    pub fn inflight_current(&self) -> usize {
        self.inflight_current.load(Ordering::Acquire)
    }

    pub async fn dispatch(
        &self,
        notification: &Notification,
        devices: &[&Device],
        context: &NotificationContext,
    ) -> Result<Vec<String>, DispatchError> {
        let _guard = self.admit()?;
        let start = std::time::Instant::now();
        let result = self.backend.dispatch(notification, devices, context).await;
        metrics::histogram!(
            "dispatch_duration_seconds",
            start.elapsed().as_secs_f64(),
            "backend" => self.name().to_string()
        );
        result
    }

    /// Fast-fail admission: a counter, not a queue. The guard decrements on
    /// every exit path, including cancellation.
    fn admit(&self) -> Result<InflightGuard<'_>, DispatchError> {
        let admitted = self
            .inflight_current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |now| {
                (now < self.inflight_limit).then_some(now + 1)
            })
            .is_ok();

        if !admitted {
            metrics::counter!(
                "inflight_limit_drop_total",
                1,
                "backend" => self.name().to_string()
            );
            return Err(DispatchError::TooManyInFlight {
                backend: self.name().to_string(),
            });
        }

        Ok(InflightGuard {
            counter: &self.inflight_current,
        })
    }
}

struct InflightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-backend keys shared by every kind.
#[derive(Debug, serde::Deserialize)]
struct CommonOptions {
    inflight_request_limit: Option<usize>,
}

/// Construct every configured backend and index them by app id.
///
/// The registry of kinds is closed: `apns`, `gcm`, `webpush`.
pub async fn build_backends(
    config: &Config,
    dialer: &Dialer,
) -> Result<AppIdRouter<Arc<BackendHandle>>, SetupError> {
    let mut router = AppIdRouter::new();

    for (app_id, app) in &config.apps {
        debug!(%app_id, kind = %app.kind, "Creating backend");

        let backend: Arc<dyn Backend> = match app.kind.as_str() {
            "apns" => Arc::new(apns::ApnsBackend::create(app_id, app, dialer)?),
            "gcm" => Arc::new(fcm::FcmBackend::create(app_id, app, dialer)?),
            "webpush" => Arc::new(webpush::WebPushBackend::create(app_id, app, dialer)?),
            other => {
                return Err(SetupError::backend(
                    app_id,
                    format!("unknown backend type '{other}'"),
                ))
            }
        };

        let common: CommonOptions = app.parse_options(app_id)?;
        let limit = common
            .inflight_request_limit
            .unwrap_or(DEFAULT_CONCURRENCY_LIMIT);

        router.insert(app_id, Arc::new(BackendHandle::new(backend, limit)))?;
    }

    if router.is_empty() {
        return Err(SetupError::Config(
            "No app IDs are configured. Edit the config file to define some.".to_string(),
        ));
    }

    Ok(router)
}
