//! Relays notifications to the Apple Push Notification service over
//! HTTP/2.
//!
//! Authenticates with either a PEM client certificate or an ES256 provider
//! token, localizes the alert from the notification's event type, shrinks
//! the payload to Apple's 4 KiB limit and classifies responses into
//! token rejections, transient failures and permanent failures.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::apns_truncate;
use crate::config::AppConfig;
use crate::error::{DispatchError, SetupError};
use crate::notifications::{
    mask_pushkey, truncate_str, Device, Notification, NotificationContext,
};
use crate::proxy::Dialer;

use super::{retry_delay, Backend, MAX_TRIES};

/// Display-field byte cap applied before payload truncation.
const MAX_FIELD_LENGTH: usize = 1024;
/// Apple rejects JSON bodies over this size on the HTTP/2 interface.
const MAX_JSON_BODY_SIZE: usize = 4096;

const PRODUCTION_HOST: &str = "api.push.apple.com";
const SANDBOX_HOST: &str = "api.development.push.apple.com";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider tokens are valid for an hour; regenerate comfortably before
/// that.
const PROVIDER_TOKEN_LIFETIME: Duration = Duration::from_secs(50 * 60);

/// Response (status, reason) pairs after which the token must never be
/// used again. Everything else is either transient or a permanent
/// non-token failure.
const TOKEN_ERRORS: [(u16, &str); 4] = [
    (400, "BadDeviceToken"),
    (400, "DeviceTokenNotForTopic"),
    (400, "TopicDisallowed"),
    (410, "Unregistered"),
];

const UNDERSTOOD_CONFIG_FIELDS: &[&str] = &[
    "type",
    "platform",
    "certfile",
    "team_id",
    "key_id",
    "keyfile",
    "topic",
    "push_type",
    "convert_device_token_to_hex",
    "request_timeout_secs",
    "inflight_request_limit",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushType {
    Alert,
    Background,
    Voip,
    Complication,
    Fileprovider,
    Mdm,
}

impl PushType {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "alert" => Some(Self::Alert),
            "background" => Some(Self::Background),
            "voip" => Some(Self::Voip),
            "complication" => Some(Self::Complication),
            "fileprovider" => Some(Self::Fileprovider),
            "mdm" => Some(Self::Mdm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Background => "background",
            Self::Voip => "voip",
            Self::Complication => "complication",
            Self::Fileprovider => "fileprovider",
            Self::Mdm => "mdm",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApnsOptions {
    platform: Option<String>,
    certfile: Option<String>,
    keyfile: Option<String>,
    key_id: Option<String>,
    team_id: Option<String>,
    topic: Option<String>,
    push_type: Option<String>,
    convert_device_token_to_hex: Option<bool>,
    request_timeout_secs: Option<u64>,
}

/// One APNs send attempt, as handed to the transport.
#[derive(Debug, Clone)]
pub struct ApnsRequest {
    pub device_token: String,
    pub payload: Map<String, Value>,
    pub priority: u8,
    pub notification_id: String,
    pub push_type: Option<PushType>,
}

/// What came back from Apple: the HTTP status and the `reason` field of
/// the error body, if any.
#[derive(Debug, Clone)]
pub struct ApnsResponse {
    pub status: u16,
    pub reason: Option<String>,
}

impl ApnsResponse {
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The wire half of the backend. Connection failures map to
/// `DispatchError::Temporary`; the retry driver sits above this.
#[async_trait]
pub trait ApnsTransport: Send + Sync {
    async fn send(&self, request: ApnsRequest) -> Result<ApnsResponse, DispatchError>;
}

pub struct ApnsBackend {
    name: String,
    push_type: Option<PushType>,
    convert_device_token_to_hex: bool,
    transport: Arc<dyn ApnsTransport>,
}

impl ApnsBackend {
    pub fn create(name: &str, app: &AppConfig, dialer: &Dialer) -> Result<Self, SetupError> {
        app.warn_unknown_keys(name, UNDERSTOOD_CONFIG_FIELDS);
        let options: ApnsOptions = app.parse_options(name)?;

        let use_sandbox = match options.platform.as_deref() {
            None | Some("") | Some("production") | Some("prod") => false,
            Some("sandbox") => true,
            Some(other) => {
                return Err(SetupError::backend(name, format!("Invalid platform: {other}")))
            }
        };
        let host = if use_sandbox {
            SANDBOX_HOST
        } else {
            PRODUCTION_HOST
        };

        let push_type = match options.push_type.as_deref() {
            None => None,
            Some(value) => Some(PushType::parse(value).ok_or_else(|| {
                SetupError::backend(name, format!("Invalid value for push_type: {value}"))
            })?),
        };

        let auth = match (&options.certfile, &options.keyfile) {
            (None, None) => {
                return Err(SetupError::backend(
                    name,
                    "You must provide a path to an APNs certificate, or an APNs token.",
                ))
            }
            (Some(certfile), _) => {
                if !Path::new(certfile).exists() {
                    return Err(SetupError::backend(
                        name,
                        format!("The APNs certificate '{certfile}' does not exist."),
                    ));
                }
                report_certificate_expiration(name, certfile)?;
                transport::Auth::Certificate {
                    certfile: certfile.clone(),
                }
            }
            (None, Some(keyfile)) => {
                if !Path::new(keyfile).exists() {
                    return Err(SetupError::backend(
                        name,
                        format!("The APNs key file '{keyfile}' does not exist."),
                    ));
                }
                let missing = |field: &str| {
                    SetupError::backend(name, format!("You must supply {field}."))
                };
                transport::Auth::ProviderToken {
                    keyfile: keyfile.clone(),
                    key_id: options.key_id.clone().ok_or_else(|| missing("key_id"))?,
                    team_id: options.team_id.clone().ok_or_else(|| missing("team_id"))?,
                    topic: options.topic.clone().ok_or_else(|| missing("topic"))?,
                }
            }
        };

        let timeout = options
            .request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let transport = transport::Http2Transport::new(name, host, auth, dialer.clone(), timeout)?;

        Ok(Self::new(
            name,
            push_type,
            options.convert_device_token_to_hex.unwrap_or(true),
            Arc::new(transport),
        ))
    }

    /// Assemble a backend around an explicit transport. The production path
    /// goes through [`ApnsBackend::create`].
    pub fn new(
        name: &str,
        push_type: Option<PushType>,
        convert_device_token_to_hex: bool,
        transport: Arc<dyn ApnsTransport>,
    ) -> Self {
        Self {
            name: name.to_string(),
            push_type,
            convert_device_token_to_hex,
            transport,
        }
    }

    async fn send_once(
        &self,
        request: ApnsRequest,
        device: &Device,
    ) -> Result<Vec<String>, DispatchError> {
        let response = self.transport.send(request).await?;

        metrics::counter!(
            "apns_status_codes_total",
            1,
            "backend" => self.name.clone(),
            "code" => response.status.to_string()
        );

        if response.is_successful() {
            return Ok(vec![]);
        }

        let reason = response.reason.as_deref().unwrap_or("");
        if TOKEN_ERRORS.contains(&(response.status, reason)) {
            info!(
                backend = %self.name,
                pushkey = %mask_pushkey(&device.pushkey),
                status = response.status,
                reason,
                "APNs rejected the device token"
            );
            return Ok(vec![device.pushkey.clone()]);
        }

        if (500..600).contains(&response.status) {
            Err(DispatchError::temporary(format!(
                "{} {reason}",
                response.status
            )))
        } else {
            Err(DispatchError::permanent(format!(
                "{} {reason}",
                response.status
            )))
        }
    }

    fn device_token(&self, device: &Device) -> Result<String, DispatchError> {
        if !self.convert_device_token_to_hex {
            return Ok(device.pushkey.clone());
        }
        // Some client libraries provide the token in hex already and set
        // convert_device_token_to_hex: false; the default is base64.
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&device.pushkey)
            .map_err(|e| {
                DispatchError::permanent(format!("pushkey is not valid base64: {e}"))
            })?;
        Ok(hex::encode(raw))
    }
}

#[async_trait]
impl Backend for ApnsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(
        &self,
        notification: &Notification,
        devices: &[&Device],
        context: &NotificationContext,
    ) -> Result<Vec<String>, DispatchError> {
        let device = devices[0];

        let default_payload = match device.default_payload() {
            Ok(payload) => payload.cloned().unwrap_or_default(),
            Err(()) => {
                warn!(
                    backend = %self.name,
                    request_id = %context.request_id,
                    "Rejecting pushkey due to misconfigured default_payload, \
                     please ensure that default_payload is a map"
                );
                return Ok(vec![device.pushkey.clone()]);
            }
        };

        let payload = if notification.event_id.is_some() && notification.event_type.is_none() {
            Some(payload_event_id_only(notification, &default_payload))
        } else {
            payload_full(notification, &default_payload)
        };

        let Some(payload) = payload else {
            debug!(
                backend = %self.name,
                request_id = %context.request_id,
                event_type = ?notification.event_type,
                "Nothing to do for this notification"
            );
            return Ok(vec![]);
        };

        let priority = if notification.is_low_priority() { 5 } else { 10 };

        let shaved_payload = apns_truncate::truncate(&payload, MAX_JSON_BODY_SIZE)
            .map_err(|e| DispatchError::permanent(e.to_string()))?;

        let device_token = self.device_token(device)?;

        for retry_number in 0..MAX_TRIES {
            // Apple wants ids in its own format, so each attempt gets a
            // fresh one rather than deriving from the request id.
            let notification_id = Uuid::new_v4().to_string();

            info!(
                backend = %self.name,
                request_id = %context.request_id,
                attempt = retry_number,
                apns_id = %notification_id,
                room_id = ?notification.room_id,
                event_id = ?notification.event_id,
                "Sending notification to APNs"
            );

            let request = ApnsRequest {
                device_token: device_token.clone(),
                payload: shaved_payload.clone(),
                priority,
                notification_id,
                push_type: self.push_type,
            };

            match self.send_once(request, device).await {
                Err(DispatchError::Temporary {
                    reason,
                    retry_after,
                }) => {
                    let delay = retry_delay(retry_number, retry_after);
                    warn!(
                        backend = %self.name,
                        request_id = %context.request_id,
                        reason = %reason,
                        delay_secs = delay.as_secs(),
                        "Temporary failure, will retry"
                    );
                    if retry_number + 1 < MAX_TRIES {
                        tokio::time::sleep(delay).await;
                    }
                }
                other => return other,
            }
        }

        Err(DispatchError::permanent("Retried too many times"))
    }
}

/// Export the epoch time the client certificate expires as a gauge.
fn report_certificate_expiration(name: &str, certfile: &str) -> Result<(), SetupError> {
    let bytes = std::fs::read(certfile).map_err(|source| SetupError::Io {
        path: certfile.to_string(),
        source,
    })?;

    for pem in x509_parser::pem::Pem::iter_from_buffer(&bytes) {
        let pem = pem.map_err(|e| SetupError::backend(name, format!("bad PEM: {e}")))?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        let cert = pem
            .parse_x509()
            .map_err(|e| SetupError::backend(name, format!("bad certificate: {e}")))?;
        metrics::gauge!(
            "client_cert_expiry_seconds",
            cert.validity().not_after.timestamp() as f64,
            "backend" => name.to_string()
        );
        return Ok(());
    }

    Err(SetupError::backend(
        name,
        format!("no certificate found in '{certfile}'"),
    ))
}

/// Payload for a notification where only the event id is known: the app
/// wakes up and fetches the event itself.
fn payload_event_id_only(
    n: &Notification,
    default_payload: &Map<String, Value>,
) -> Map<String, Value> {
    let mut payload = default_payload.clone();

    if let Some(room_id) = &n.room_id {
        payload.insert("room_id".to_string(), Value::from(room_id.clone()));
    }
    if let Some(event_id) = &n.event_id {
        payload.insert("event_id".to_string(), Value::from(event_id.clone()));
    }

    if let Some(unread) = n.counts.unread {
        payload.insert("unread_count".to_string(), Value::from(unread));
    }
    if let Some(missed_calls) = n.counts.missed_calls {
        payload.insert("missed_calls".to_string(), Value::from(missed_calls));
    }

    payload
}

/// Full payload with a localized alert chosen from the event type.
/// `None` means there is nothing worth waking the device for.
fn payload_full(n: &Notification, default_payload: &Map<String, Value>) -> Option<Map<String, Value>> {
    let from_display = match (&n.sender_display_name, &n.sender) {
        (Some(name), _) => name.as_str(),
        (None, Some(sender)) => sender.as_str(),
        (None, None) => " ",
    };
    let from_display = truncate_str(from_display, MAX_FIELD_LENGTH);

    let mut loc_key = None;
    let mut loc_args: Option<Vec<String>> = None;

    let event_type = n.event_type.as_deref();
    if event_type == Some("m.room.message") || event_type == Some("m.room.encrypted") {
        let room_display = n
            .room_name
            .as_deref()
            .or(n.room_alias.as_deref())
            .map(|room| truncate_str(room, MAX_FIELD_LENGTH));

        let msgtype = n
            .content
            .as_ref()
            .and_then(|c| c.get("msgtype"))
            .and_then(Value::as_str);
        let body = n
            .content
            .as_ref()
            .and_then(|c| c.get("body"))
            .and_then(Value::as_str);

        let mut content_display = None;
        let mut action_display = None;
        let mut is_image = false;
        if let (Some(msgtype), Some(body)) = (msgtype, body) {
            match msgtype {
                "m.emote" => action_display = Some(body),
                // 'body' should always be user-visible text in an
                // m.room.message, so fall back to showing it
                _ => content_display = Some(body),
            }
            if msgtype == "m.image" {
                is_image = true;
            }
        }

        if let Some(room_display) = room_display {
            if is_image {
                loc_key = Some("IMAGE_FROM_USER_IN_ROOM");
                loc_args = Some(vec![
                    from_display.to_string(),
                    content_display.unwrap_or_default().to_string(),
                    room_display.to_string(),
                ]);
            } else if let Some(content) = content_display {
                loc_key = Some("MSG_FROM_USER_IN_ROOM_WITH_CONTENT");
                loc_args = Some(vec![
                    from_display.to_string(),
                    room_display.to_string(),
                    content.to_string(),
                ]);
            } else if let Some(action) = action_display {
                loc_key = Some("ACTION_FROM_USER_IN_ROOM");
                loc_args = Some(vec![
                    room_display.to_string(),
                    from_display.to_string(),
                    action.to_string(),
                ]);
            } else {
                loc_key = Some("MSG_FROM_USER_IN_ROOM");
                loc_args = Some(vec![from_display.to_string(), room_display.to_string()]);
            }
        } else if is_image {
            loc_key = Some("IMAGE_FROM_USER");
            loc_args = Some(vec![
                from_display.to_string(),
                content_display.unwrap_or_default().to_string(),
            ]);
        } else if let Some(content) = content_display {
            loc_key = Some("MSG_FROM_USER_WITH_CONTENT");
            loc_args = Some(vec![from_display.to_string(), content.to_string()]);
        } else if let Some(action) = action_display {
            loc_key = Some("ACTION_FROM_USER");
            loc_args = Some(vec![from_display.to_string(), action.to_string()]);
        } else {
            loc_key = Some("MSG_FROM_USER");
            loc_args = Some(vec![from_display.to_string()]);
        }
    } else if event_type == Some("m.call.invite") {
        // works only for homeservers that use WebRTC for calls
        let sdp = n
            .content
            .as_ref()
            .and_then(|c| c.get("offer"))
            .and_then(Value::as_object)
            .and_then(|offer| offer.get("sdp"))
            .and_then(Value::as_str);
        let is_video_call = sdp.is_some_and(|sdp| sdp.contains("m=video"));

        loc_key = Some(if is_video_call {
            "VIDEO_CALL_FROM_USER"
        } else {
            "VOICE_CALL_FROM_USER"
        });
        loc_args = Some(vec![from_display.to_string()]);
    } else if event_type == Some("m.room.member") {
        if n.user_is_target == Some(true) && n.membership.as_deref() == Some("invite") {
            if let Some(room) = n.room_name.as_deref().or(n.room_alias.as_deref()) {
                loc_key = Some("USER_INVITE_TO_NAMED_ROOM");
                loc_args = Some(vec![
                    from_display.to_string(),
                    truncate_str(room, MAX_FIELD_LENGTH).to_string(),
                ]);
            } else {
                loc_key = Some("USER_INVITE_TO_CHAT");
                loc_args = Some(vec![from_display.to_string()]);
            }
        }
    } else if event_type.is_some() {
        // A type of event we don't know about, but important enough that a
        // push got all the way to us
        loc_key = Some("MSG_FROM_USER");
        loc_args = Some(vec![from_display.to_string()]);
    }

    let mut badge = n.counts.unread;
    if let Some(missed_calls) = n.counts.missed_calls {
        badge = Some(badge.unwrap_or(0) + missed_calls);
    }

    if loc_key.is_none() && badge.is_none() {
        return None;
    }

    let mut payload = if n.event_type.is_some() {
        default_payload.clone()
    } else {
        Map::new()
    };

    let aps = payload
        .entry("aps".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !aps.is_object() {
        *aps = Value::Object(Map::new());
    }
    let aps = aps.as_object_mut().expect("aps was just made an object");

    if loc_key.is_some() || loc_args.is_some() {
        let alert = aps
            .entry("alert".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !alert.is_object() {
            *alert = Value::Object(Map::new());
        }
        let alert = alert.as_object_mut().expect("alert was just made an object");

        if let Some(loc_key) = loc_key {
            alert.insert("loc-key".to_string(), Value::from(loc_key));
        }
        if let Some(loc_args) = loc_args {
            alert.insert("loc-args".to_string(), Value::from(loc_args));
        }
    }

    if let Some(badge) = badge {
        aps.insert("badge".to_string(), Value::from(badge));
    }

    if loc_key.is_some() {
        if let Some(room_id) = &n.room_id {
            payload.insert("room_id".to_string(), Value::from(room_id.clone()));
        }
        if let Some(event_id) = &n.event_id {
            payload.insert("event_id".to_string(), Value::from(event_id.clone()));
        }
    }

    Some(payload)
}

mod transport {
    //! The production HTTP/2 transport: a pooled connection to Apple,
    //! dialed through the configured [`Dialer`] and authenticated with
    //! either a client certificate at the TLS layer or a cached ES256
    //! provider token per request.

    use super::*;
    use h2::client::SendRequest;
    use rustls::pki_types::ServerName;
    use tokio_rustls::TlsConnector;

    pub enum Auth {
        Certificate {
            certfile: String,
        },
        ProviderToken {
            keyfile: String,
            key_id: String,
            team_id: String,
            topic: String,
        },
    }

    #[derive(serde::Serialize)]
    struct ProviderTokenClaims {
        iss: String,
        iat: u64,
    }

    struct ProviderTokenAuthenticator {
        encoding_key: jsonwebtoken::EncodingKey,
        key_id: String,
        team_id: String,
        cached: Mutex<Option<(String, std::time::Instant)>>,
    }

    impl ProviderTokenAuthenticator {
        fn token(&self) -> Result<String, DispatchError> {
            let mut cached = self.cached.lock();
            if let Some((token, minted_at)) = &*cached {
                if minted_at.elapsed() < PROVIDER_TOKEN_LIFETIME {
                    return Ok(token.clone());
                }
            }

            let claims = ProviderTokenClaims {
                iss: self.team_id.clone(),
                iat: std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            };
            let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::ES256);
            header.kid = Some(self.key_id.clone());

            let token = jsonwebtoken::encode(&header, &claims, &self.encoding_key)
                .map_err(|e| DispatchError::permanent(format!("cannot sign provider token: {e}")))?;
            *cached = Some((token.clone(), std::time::Instant::now()));
            Ok(token)
        }
    }

    pub struct Http2Transport {
        backend_name: String,
        host: String,
        tls: Arc<rustls::ClientConfig>,
        dialer: Dialer,
        timeout: Duration,
        topic: Option<String>,
        authenticator: Option<ProviderTokenAuthenticator>,
        connection: Mutex<Option<SendRequest<Bytes>>>,
    }

    impl Http2Transport {
        pub fn new(
            backend_name: &str,
            host: &str,
            auth: Auth,
            dialer: Dialer,
            timeout: Duration,
        ) -> Result<Self, SetupError> {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

            let (mut tls, topic, authenticator) = match auth {
                Auth::Certificate { certfile } => {
                    let (certs, key) = load_identity(backend_name, &certfile)?;
                    let tls = builder.with_client_auth_cert(certs, key).map_err(|e| {
                        SetupError::backend(backend_name, format!("bad client certificate: {e}"))
                    })?;
                    (tls, None, None)
                }
                Auth::ProviderToken {
                    keyfile,
                    key_id,
                    team_id,
                    topic,
                } => {
                    let pem = std::fs::read(&keyfile).map_err(|source| SetupError::Io {
                        path: keyfile.clone(),
                        source,
                    })?;
                    let encoding_key =
                        jsonwebtoken::EncodingKey::from_ec_pem(&pem).map_err(|e| {
                            SetupError::backend(backend_name, format!("bad APNs key: {e}"))
                        })?;
                    let authenticator = ProviderTokenAuthenticator {
                        encoding_key,
                        key_id,
                        team_id,
                        cached: Mutex::new(None),
                    };
                    (builder.with_no_client_auth(), Some(topic), Some(authenticator))
                }
            };
            tls.alpn_protocols = vec![b"h2".to_vec()];

            Ok(Self {
                backend_name: backend_name.to_string(),
                host: host.to_string(),
                tls: Arc::new(tls),
                dialer,
                timeout,
                topic,
                authenticator,
                connection: Mutex::new(None),
            })
        }

        async fn connection(&self) -> Result<SendRequest<Bytes>, DispatchError> {
            if let Some(existing) = self.connection.lock().clone() {
                return Ok(existing);
            }

            let stream = self.dialer.dial(&self.host, 443).await?;
            let connector = TlsConnector::from(self.tls.clone());
            let server_name = ServerName::try_from(self.host.clone())
                .map_err(|e| DispatchError::permanent(format!("bad APNs host: {e}")))?;
            let stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| DispatchError::temporary(format!("TLS handshake failed: {e}")))?;

            let (send_request, connection) = h2::client::handshake(stream)
                .await
                .map_err(|e| DispatchError::temporary(format!("HTTP/2 handshake failed: {e}")))?;

            let backend_name = self.backend_name.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!(backend = %backend_name, error = %e, "APNs connection closed");
                }
            });

            *self.connection.lock() = Some(send_request.clone());
            Ok(send_request)
        }

        fn drop_connection(&self) {
            *self.connection.lock() = None;
        }

        async fn send_inner(&self, request: &ApnsRequest) -> Result<ApnsResponse, DispatchError> {
            let mut send_request = self
                .connection()
                .await?
                .ready()
                .await
                .map_err(|e| DispatchError::temporary(format!("APNs connection failure: {e}")))?;

            let uri = format!("https://{}/3/device/{}", self.host, request.device_token);
            let mut builder = http::Request::builder()
                .method(http::Method::POST)
                .uri(uri)
                .header("apns-id", request.notification_id.as_str())
                .header("apns-priority", request.priority.to_string());
            if let Some(topic) = &self.topic {
                builder = builder.header("apns-topic", topic.as_str());
            }
            if let Some(push_type) = request.push_type {
                builder = builder.header("apns-push-type", push_type.as_str());
            }
            if let Some(authenticator) = &self.authenticator {
                builder = builder.header(
                    "authorization",
                    format!("bearer {}", authenticator.token()?),
                );
            }
            let http_request = builder
                .body(())
                .map_err(|e| DispatchError::permanent(format!("bad APNs request: {e}")))?;

            let body = serde_json::to_vec(&Value::Object(request.payload.clone()))
                .map_err(|e| DispatchError::permanent(format!("unencodable payload: {e}")))?;

            let conn_err =
                |e: h2::Error| DispatchError::temporary(format!("APNs connection failure: {e}"));

            let (response, mut stream) = send_request
                .send_request(http_request, false)
                .map_err(conn_err)?;
            stream.send_data(Bytes::from(body), true).map_err(conn_err)?;

            let response = response.await.map_err(conn_err)?;
            let status = response.status().as_u16();

            let mut body = response.into_body();
            let mut buf = Vec::new();
            while let Some(chunk) = body.data().await {
                let chunk = chunk.map_err(conn_err)?;
                let _ = body.flow_control().release_capacity(chunk.len());
                buf.extend_from_slice(&chunk);
            }

            #[derive(Deserialize)]
            struct ErrorBody {
                reason: Option<String>,
            }
            let reason = serde_json::from_slice::<ErrorBody>(&buf)
                .ok()
                .and_then(|b| b.reason);

            Ok(ApnsResponse { status, reason })
        }
    }

    #[async_trait]
    impl ApnsTransport for Http2Transport {
        async fn send(&self, request: ApnsRequest) -> Result<ApnsResponse, DispatchError> {
            let result = tokio::time::timeout(self.timeout, self.send_inner(&request))
                .await
                .unwrap_or_else(|_| {
                    Err(DispatchError::temporary("APNs request timed out"))
                });
            if result.is_err() {
                // a fresh connection on the next attempt
                self.drop_connection();
            }
            result
        }
    }

    fn load_identity(
        backend_name: &str,
        certfile: &str,
    ) -> Result<
        (
            Vec<rustls::pki_types::CertificateDer<'static>>,
            rustls::pki_types::PrivateKeyDer<'static>,
        ),
        SetupError,
    > {
        let bytes = std::fs::read(certfile).map_err(|source| SetupError::Io {
            path: certfile.to_string(),
            source,
        })?;

        let certs = rustls_pemfile::certs(&mut &bytes[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                SetupError::backend(backend_name, format!("bad certificate in '{certfile}': {e}"))
            })?;
        if certs.is_empty() {
            return Err(SetupError::backend(
                backend_name,
                format!("no certificate found in '{certfile}'"),
            ));
        }

        let key = rustls_pemfile::private_key(&mut &bytes[..])
            .map_err(|e| {
                SetupError::backend(backend_name, format!("bad private key in '{certfile}': {e}"))
            })?
            .ok_or_else(|| {
                SetupError::backend(
                    backend_name,
                    format!("no private key found in '{certfile}'"),
                )
            })?;

        Ok((certs, key))
    }
}
