//! Relays notifications to Firebase Cloud Messaging.
//!
//! Speaks both wire formats: the legacy HTTP API (`api_key` auth, batched
//! `registration_ids`, positionally-aligned `results`) and the v1 API
//! (OAuth2 service-account bearer tokens, one `token` per request).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{DispatchError, SetupError};
use crate::notifications::{
    mask_pushkey, truncate_str, Device, Notification, NotificationContext,
};
use crate::proxy::Dialer;

use super::{retry_delay, Backend, MAX_TRIES};

const DEFAULT_API_BASE: &str = "https://fcm.googleapis.com";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// String fields copied into `data` are capped at this many bytes; FCM
/// rejects oversized bodies outright.
const MAX_BYTES_PER_FIELD: usize = 1024;

/// The legacy API takes at most this many registration ids per request.
const MAX_REGISTRATIONS_PER_REQUEST: usize = 1000;

const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
/// Refresh OAuth tokens this long before the provider-reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Error codes after which a registration id will never succeed and must
/// be rejected upstream.
const BAD_PUSHKEY_FAILURE_CODES: [&str; 5] = [
    "MissingRegistration",
    "InvalidRegistration",
    "NotRegistered",
    "InvalidPackageName",
    "MismatchSenderId",
];

/// Error codes fatal to this message only; the registration id stays
/// valid, so neither retry nor reject.
const BAD_MESSAGE_FAILURE_CODES: [&str; 3] = ["MessageTooBig", "InvalidDataKey", "InvalidTtl"];

const UNDERSTOOD_CONFIG_FIELDS: &[&str] = &[
    "type",
    "api_version",
    "api_key",
    "fcm_options",
    "project_id",
    "service_account_file",
    "api_base",
    "request_timeout_secs",
    "inflight_request_limit",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiVersion {
    Legacy,
    V1,
}

#[derive(Debug, Deserialize)]
struct FcmConfig {
    api_version: Option<String>,
    api_key: Option<String>,
    fcm_options: Option<Map<String, Value>>,
    project_id: Option<String>,
    service_account_file: Option<String>,
    api_base: Option<String>,
    request_timeout_secs: Option<u64>,
}

pub struct FcmBackend {
    name: String,
    api_version: ApiVersion,
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    base_request_body: Map<String, Value>,
    oauth: Option<OauthTokenProvider>,
}

impl FcmBackend {
    pub fn create(name: &str, app: &AppConfig, dialer: &Dialer) -> Result<Self, SetupError> {
        app.warn_unknown_keys(name, UNDERSTOOD_CONFIG_FIELDS);
        let options: FcmConfig = app.parse_options(name)?;

        let api_version = match options.api_version.as_deref() {
            None | Some("legacy") => ApiVersion::Legacy,
            Some("v1") => ApiVersion::V1,
            Some(other) => {
                return Err(SetupError::backend(
                    name,
                    format!("Invalid api_version: {other}"),
                ))
            }
        };

        let timeout = options
            .request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = dialer.reqwest_proxy()? {
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| SetupError::backend(name, format!("cannot build HTTP client: {e}")))?;

        let api_base = options
            .api_base
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let (url, api_key, oauth) = match api_version {
            ApiVersion::Legacy => {
                let api_key = options
                    .api_key
                    .ok_or_else(|| SetupError::backend(name, "No API key set in config"))?;
                (format!("{api_base}/fcm/send"), Some(api_key), None)
            }
            ApiVersion::V1 => {
                let project_id = options
                    .project_id
                    .ok_or_else(|| SetupError::backend(name, "No project_id set in config"))?;
                let account_file = options.service_account_file.ok_or_else(|| {
                    SetupError::backend(name, "No service_account_file set in config")
                })?;
                let oauth = OauthTokenProvider::from_file(name, &account_file, client.clone())?;
                (
                    format!("{api_base}/v1/projects/{project_id}/messages:send"),
                    None,
                    Some(oauth),
                )
            }
        };

        Ok(Self {
            name: name.to_string(),
            api_version,
            client,
            url,
            api_key,
            base_request_body: options.fcm_options.unwrap_or_default(),
            oauth,
        })
    }

    /// Build the `data` payload: `default_payload`, then a whitelist of
    /// notification attributes with string values capped, then priority
    /// and counters. `None` means the device's `default_payload` is
    /// misconfigured and its pushkey(s) must be rejected.
    fn build_data(n: &Notification, device: &Device) -> Option<Map<String, Value>> {
        let mut data = match device.default_payload() {
            Ok(payload) => payload.cloned().unwrap_or_default(),
            Err(()) => return None,
        };

        let attributes = [
            ("event_id", n.event_id.as_ref().map(|v| Value::from(v.clone()))),
            ("type", n.event_type.as_ref().map(|v| Value::from(v.clone()))),
            ("sender", n.sender.as_ref().map(|v| Value::from(v.clone()))),
            ("room_name", n.room_name.as_ref().map(|v| Value::from(v.clone()))),
            ("room_alias", n.room_alias.as_ref().map(|v| Value::from(v.clone()))),
            ("membership", n.membership.as_ref().map(|v| Value::from(v.clone()))),
            (
                "sender_display_name",
                n.sender_display_name.as_ref().map(|v| Value::from(v.clone())),
            ),
            ("content", n.content.as_ref().map(|v| Value::Object(v.clone()))),
            ("room_id", n.room_id.as_ref().map(|v| Value::from(v.clone()))),
        ];

        for (key, value) in attributes {
            let Some(mut value) = value else { continue };
            if let Value::String(s) = &value {
                if s.len() > MAX_BYTES_PER_FIELD {
                    value = Value::from(truncate_str(s, MAX_BYTES_PER_FIELD).to_string());
                }
            }
            data.insert(key.to_string(), value);
        }

        data.insert(
            "prio".to_string(),
            Value::from(if n.is_low_priority() { "normal" } else { "high" }),
        );

        if let Some(unread) = n.counts.unread {
            data.insert("unread".to_string(), Value::from(unread));
        }
        if let Some(missed_calls) = n.counts.missed_calls {
            data.insert("missed_calls".to_string(), Value::from(missed_calls));
        }

        Some(data)
    }

    /// The v1 API only accepts string values in `data`.
    fn stringify_data(data: &Map<String, Value>) -> Map<String, Value> {
        data.iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(_) => value.clone(),
                    other => Value::from(
                        serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
                    ),
                };
                (key.clone(), value)
            })
            .collect()
    }

    fn record_status(&self, status: u16) {
        metrics::counter!(
            "fcm_status_codes_total",
            1,
            "backend" => self.name.clone(),
            "code" => status.to_string()
        );
    }

    fn retry_after_of(response: &reqwest::Response) -> Option<Duration> {
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// One legacy API attempt for `pushkeys`. Returns the pushkeys now
    /// permanently failed and the pushkeys that should be retried.
    async fn request_dispatch_legacy(
        &self,
        body: &Map<String, Value>,
        pushkeys: &[String],
        context: &NotificationContext,
    ) -> Result<(Vec<String>, Vec<String>), DispatchError> {
        let api_key = self.api_key.as_deref().unwrap_or_default();
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, format!("key={api_key}"))
            .json(&Value::Object(body.clone()))
            .send()
            .await
            .map_err(|e| DispatchError::temporary(format!("FCM request failure: {e}")))?;

        let status = response.status().as_u16();
        self.record_status(status);

        if (500..600).contains(&status) {
            debug!(
                backend = %self.name,
                status, "Server error from FCM, waiting to try again"
            );
            return Err(DispatchError::Temporary {
                reason: format!("FCM server error {status}, hopefully temporary"),
                retry_after: Self::retry_after_of(&response),
            });
        }

        match status {
            400 => {
                let body_text = response.text().await.unwrap_or_default();
                warn!(
                    backend = %self.name,
                    request_id = %context.request_id,
                    body = %body_text,
                    "400 from FCM, we sent something invalid"
                );
                Err(DispatchError::permanent("Invalid request"))
            }
            401 => {
                warn!(
                    backend = %self.name,
                    request_id = %context.request_id,
                    "401 from FCM, our API key is invalid?"
                );
                Err(DispatchError::permanent("Not authorised to push"))
            }
            404 => {
                // assume they have all failed
                info!(
                    backend = %self.name,
                    request_id = %context.request_id,
                    num_pushkeys = pushkeys.len(),
                    "404 from FCM, assuming registration ids are unregistered"
                );
                Ok((pushkeys.to_vec(), vec![]))
            }
            200..=299 => {
                #[derive(Deserialize)]
                struct FcmResult {
                    error: Option<String>,
                }
                #[derive(Deserialize)]
                struct FcmResponse {
                    #[serde(default)]
                    results: Option<Vec<FcmResult>>,
                }

                let parsed: FcmResponse = response.json().await.map_err(|_| {
                    DispatchError::permanent("Invalid JSON response from FCM")
                })?;
                let results = parsed.results.unwrap_or_default();

                if results.len() < pushkeys.len() {
                    warn!(
                        backend = %self.name,
                        request_id = %context.request_id,
                        num_pushkeys = pushkeys.len(),
                        num_results = results.len(),
                        "Sent more notifications than we got responses for"
                    );
                }

                let mut failed = Vec::new();
                let mut new_pushkeys = Vec::new();
                for (i, pushkey) in pushkeys.iter().enumerate() {
                    let Some(result) = results.get(i) else {
                        // unaccounted for by the response: retry it
                        new_pushkeys.push(pushkey.clone());
                        continue;
                    };
                    let Some(error) = &result.error else {
                        continue;
                    };
                    warn!(
                        backend = %self.name,
                        request_id = %context.request_id,
                        pushkey = %mask_pushkey(pushkey),
                        error = %error,
                        "Error for registration id"
                    );
                    if BAD_PUSHKEY_FAILURE_CODES.contains(&error.as_str()) {
                        failed.push(pushkey.clone());
                    } else if BAD_MESSAGE_FAILURE_CODES.contains(&error.as_str()) {
                        // message is unsendable but the registration id is fine
                    } else {
                        new_pushkeys.push(pushkey.clone());
                    }
                }
                Ok((failed, new_pushkeys))
            }
            other => Err(DispatchError::permanent(format!(
                "Unknown FCM response code {other}"
            ))),
        }
    }

    async fn dispatch_legacy(
        &self,
        n: &Notification,
        devices: &[&Device],
        context: &NotificationContext,
    ) -> Result<Vec<String>, DispatchError> {
        let all_pushkeys: Vec<String> = devices.iter().map(|d| d.pushkey.clone()).collect();

        let Some(data) = Self::build_data(n, devices[0]) else {
            warn!(
                backend = %self.name,
                request_id = %context.request_id,
                "Rejecting pushkey(s) due to misconfigured default_payload, \
                 please ensure that default_payload is a map"
            );
            return Ok(all_pushkeys);
        };

        let mut body = self.base_request_body.clone();
        body.insert("data".to_string(), Value::Object(data));
        body.insert(
            "priority".to_string(),
            Value::from(if n.is_low_priority() { "normal" } else { "high" }),
        );

        let mut failed = Vec::new();

        for chunk in all_pushkeys.chunks(MAX_REGISTRATIONS_PER_REQUEST) {
            let mut pushkeys = chunk.to_vec();
            let mut body = body.clone();

            for retry_number in 0..MAX_TRIES {
                if pushkeys.len() == 1 {
                    body.insert("to".to_string(), Value::from(pushkeys[0].clone()));
                    body.remove("registration_ids");
                } else {
                    body.insert(
                        "registration_ids".to_string(),
                        Value::from(pushkeys.clone()),
                    );
                    body.remove("to");
                }

                info!(
                    backend = %self.name,
                    request_id = %context.request_id,
                    attempt = retry_number,
                    num_pushkeys = pushkeys.len(),
                    "Sending notification batch to FCM"
                );

                match self.request_dispatch_legacy(&body, &pushkeys, context).await {
                    Ok((new_failed, new_pushkeys)) => {
                        failed.extend(new_failed);
                        pushkeys = new_pushkeys;
                        if pushkeys.is_empty() {
                            break;
                        }
                    }
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
                    Err(other) => return Err(other),
                }
            }

            if !pushkeys.is_empty() {
                info!(
                    backend = %self.name,
                    request_id = %context.request_id,
                    num_pushkeys = pushkeys.len(),
                    "Gave up retrying registration ids"
                );
            }
        }

        Ok(failed)
    }

    async fn request_dispatch_v1(
        &self,
        body: &Value,
        pushkey: &str,
        context: &NotificationContext,
    ) -> Result<Vec<String>, DispatchError> {
        let bearer = self
            .oauth
            .as_ref()
            .expect("v1 backend always has an OAuth provider")
            .bearer()
            .await?;

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await
            .map_err(|e| DispatchError::temporary(format!("FCM request failure: {e}")))?;

        let status = response.status().as_u16();
        self.record_status(status);

        if (500..600).contains(&status) {
            return Err(DispatchError::Temporary {
                reason: format!("FCM server error {status}, hopefully temporary"),
                retry_after: Self::retry_after_of(&response),
            });
        }

        match status {
            200..=299 => Ok(vec![]),
            404 => {
                info!(
                    backend = %self.name,
                    request_id = %context.request_id,
                    pushkey = %mask_pushkey(pushkey),
                    "404 from FCM, assuming token is unregistered"
                );
                Ok(vec![pushkey.to_string()])
            }
            400 => {
                let body_text = response.text().await.unwrap_or_default();
                warn!(
                    backend = %self.name,
                    request_id = %context.request_id,
                    body = %body_text,
                    "400 from FCM, we sent something invalid"
                );
                Err(DispatchError::permanent("Invalid request"))
            }
            401 | 403 => Err(DispatchError::permanent("Not authorised to push")),
            other => Err(DispatchError::permanent(format!(
                "Unknown FCM response code {other}"
            ))),
        }
    }

    async fn dispatch_v1(
        &self,
        n: &Notification,
        device: &Device,
        context: &NotificationContext,
    ) -> Result<Vec<String>, DispatchError> {
        let Some(data) = Self::build_data(n, device) else {
            warn!(
                backend = %self.name,
                request_id = %context.request_id,
                "Rejecting pushkey due to misconfigured default_payload, \
                 please ensure that default_payload is a map"
            );
            return Ok(vec![device.pushkey.clone()]);
        };

        let body = json!({
            "message": {
                "token": device.pushkey,
                "data": Value::Object(Self::stringify_data(&data)),
                "android": {
                    "priority": if n.is_low_priority() { "normal" } else { "high" },
                },
            }
        });

        for retry_number in 0..MAX_TRIES {
            info!(
                backend = %self.name,
                request_id = %context.request_id,
                attempt = retry_number,
                pushkey = %mask_pushkey(&device.pushkey),
                "Sending notification to FCM"
            );

            match self.request_dispatch_v1(&body, &device.pushkey, context).await {
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

#[async_trait]
impl Backend for FcmBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn batches(&self) -> bool {
        self.api_version == ApiVersion::Legacy
    }

    async fn dispatch(
        &self,
        notification: &Notification,
        devices: &[&Device],
        context: &NotificationContext,
    ) -> Result<Vec<String>, DispatchError> {
        match self.api_version {
            ApiVersion::Legacy => self.dispatch_legacy(notification, devices, context).await,
            ApiVersion::V1 => self.dispatch_v1(notification, devices[0], context).await,
        }
    }
}

/// Exchanges a service-account JWT for a bearer token at the account's
/// token endpoint; tokens are cached until shortly before expiry.
struct OauthTokenProvider {
    client_email: String,
    token_uri: String,
    encoding_key: jsonwebtoken::EncodingKey,
    client: reqwest::Client,
    cached: tokio::sync::Mutex<Option<(String, Instant)>>,
}

#[derive(Deserialize)]
struct ServiceAccount {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(serde::Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

impl OauthTokenProvider {
    fn from_file(
        backend_name: &str,
        path: &str,
        client: reqwest::Client,
    ) -> Result<Self, SetupError> {
        let bytes = std::fs::read(path).map_err(|source| SetupError::Io {
            path: path.to_string(),
            source,
        })?;
        let account: ServiceAccount = serde_json::from_slice(&bytes).map_err(|e| {
            SetupError::backend(backend_name, format!("bad service account file: {e}"))
        })?;
        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| {
                SetupError::backend(backend_name, format!("bad service account key: {e}"))
            })?;

        Ok(Self {
            client_email: account.client_email,
            token_uri: account.token_uri,
            encoding_key,
            client,
            cached: tokio::sync::Mutex::new(None),
        })
    }

    async fn bearer(&self) -> Result<String, DispatchError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = &*cached {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        let iat = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: OAUTH_SCOPE,
            aud: &self.token_uri,
            iat,
            exp: iat + 3600,
        };
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &self.encoding_key,
        )
        .map_err(|e| DispatchError::permanent(format!("cannot sign OAuth assertion: {e}")))?;

        let response = self
            .client
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &assertion),
            ])
            .send()
            .await
            .map_err(|e| DispatchError::temporary(format!("OAuth token request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(DispatchError::temporary(format!(
                "OAuth token endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(DispatchError::permanent(format!(
                "OAuth token endpoint returned {status}"
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::temporary(format!("bad OAuth token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
        Ok(token.access_token)
    }
}
