//! Relays notifications to arbitrary Web Push endpoints (RFC 8030).
//!
//! Payloads are encrypted with the `aes128gcm` content encoding
//! (RFC 8291) against the subscription's P-256 key and auth secret, and
//! requests are authorized with a VAPID JWT (RFC 8292) signed by the
//! configured private key.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::error::{DispatchError, SetupError};
use crate::notifications::{mask_pushkey, Device, Notification, NotificationContext};
use crate::proxy::Dialer;

use super::{retry_delay, Backend, MAX_TRIES};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// VAPID tokens carry a fixed future expiry.
const VAPID_TOKEN_LIFETIME: Duration = Duration::from_secs(12 * 60 * 60);

const UNDERSTOOD_CONFIG_FIELDS: &[&str] = &[
    "type",
    "vapid_private_key",
    "vapid_contact_email",
    "ttl",
    "request_timeout_secs",
    "inflight_request_limit",
];

#[derive(Debug, serde::Deserialize)]
struct WebPushOptions {
    vapid_private_key: Option<String>,
    vapid_contact_email: Option<String>,
    ttl: Option<u64>,
    request_timeout_secs: Option<u64>,
}

pub struct WebPushBackend {
    name: String,
    client: reqwest::Client,
    ttl: u64,
    vapid: VapidSigner,
}

impl WebPushBackend {
    pub fn create(name: &str, app: &AppConfig, dialer: &Dialer) -> Result<Self, SetupError> {
        app.warn_unknown_keys(name, UNDERSTOOD_CONFIG_FIELDS);
        let options: WebPushOptions = app.parse_options(name)?;

        let privkey_filename = options
            .vapid_private_key
            .ok_or_else(|| SetupError::backend(name, "'vapid_private_key' not set in config"))?;
        if !Path::new(&privkey_filename).exists() {
            return Err(SetupError::backend(
                name,
                "path in 'vapid_private_key' does not exist",
            ));
        }
        let contact_email = options
            .vapid_contact_email
            .ok_or_else(|| SetupError::backend(name, "'vapid_contact_email' not set in config"))?;

        let vapid = VapidSigner::from_pem_file(name, &privkey_filename, &contact_email)?;

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

        Ok(Self {
            name: name.to_string(),
            client,
            ttl: options.ttl.unwrap_or(0),
            vapid,
        })
    }

    /// `default_payload`, then whitelisted notification attributes and
    /// counters when they carry a value.
    fn build_payload(n: &Notification, device: &Device) -> Option<Map<String, Value>> {
        let mut payload = match device.default_payload() {
            Ok(defaults) => defaults.cloned().unwrap_or_default(),
            Err(()) => return None,
        };

        let attributes = [
            ("room_id", n.room_id.as_deref()),
            ("room_name", n.room_name.as_deref()),
            ("room_alias", n.room_alias.as_deref()),
            ("membership", n.membership.as_deref()),
            ("event_id", n.event_id.as_deref()),
            ("sender", n.sender.as_deref()),
            ("sender_display_name", n.sender_display_name.as_deref()),
            ("type", n.event_type.as_deref()),
        ];
        for (key, value) in attributes {
            match value {
                Some(value) if !value.is_empty() => {
                    payload.insert(key.to_string(), Value::from(value));
                }
                _ => {}
            }
        }
        if n.user_is_target == Some(true) {
            payload.insert("user_is_target".to_string(), Value::from(true));
        }
        if let Some(content) = &n.content {
            if !content.is_empty() {
                payload.insert("content".to_string(), Value::Object(content.clone()));
            }
        }

        if let Some(unread) = n.counts.unread {
            payload.insert("unread".to_string(), Value::from(unread));
        }
        if let Some(missed_calls) = n.counts.missed_calls {
            payload.insert("missed_calls".to_string(), Value::from(missed_calls));
        }

        Some(payload)
    }

    async fn send_once(
        &self,
        endpoint: &str,
        ciphertext: Vec<u8>,
        device: &Device,
    ) -> Result<Vec<String>, DispatchError> {
        let origin = endpoint_origin(endpoint)
            .ok_or_else(|| DispatchError::permanent(format!("bad endpoint URL: {endpoint}")))?;
        let authorization = self.vapid.auth_header(&origin)?;

        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_ENCODING, "aes128gcm")
            .header("TTL", self.ttl.to_string())
            .header(reqwest::header::AUTHORIZATION, authorization)
            .body(ciphertext)
            .send()
            .await
            .map_err(|e| DispatchError::temporary(format!("Web Push request failure: {e}")))?;

        let status = response.status().as_u16();
        metrics::counter!(
            "webpush_status_codes_total",
            1,
            "backend" => self.name.clone(),
            "code" => status.to_string()
        );

        if (500..600).contains(&status) {
            return Err(DispatchError::temporary(format!(
                "Web Push endpoint returned {status}"
            )));
        }
        if (400..500).contains(&status) {
            // assume 4xx is permanent
            info!(
                backend = %self.name,
                pushkey = %mask_pushkey(&device.pushkey),
                status,
                "Web Push endpoint rejected the subscription"
            );
            return Ok(vec![device.pushkey.clone()]);
        }
        Ok(vec![])
    }
}

#[async_trait]
impl Backend for WebPushBackend {
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

        let reject = |why: &str| {
            warn!(
                backend = %self.name,
                request_id = %context.request_id,
                why,
                "Rejecting pushkey due to a malformed subscription"
            );
            Ok(vec![device.pushkey.clone()])
        };

        let Some(endpoint) = device.data_str("endpoint").map(str::to_string) else {
            return reject("no endpoint in device data");
        };
        let Some(auth) = device.data_str("auth") else {
            return reject("no auth secret in device data");
        };
        let Ok(auth_secret) = b64url_decode(auth) else {
            return reject("auth secret is not valid base64url");
        };
        let Ok(p256dh) = b64url_decode(&device.pushkey) else {
            return reject("p256dh key is not valid base64url");
        };

        let Some(payload) = Self::build_payload(notification, device) else {
            return reject("default_payload is not a map");
        };
        let plaintext = serde_json::to_vec(&Value::Object(payload))
            .map_err(|e| DispatchError::permanent(format!("unencodable payload: {e}")))?;

        let Ok(ciphertext) = ece::encrypt(&plaintext, &p256dh, &auth_secret) else {
            return reject("subscription key is not a valid P-256 point");
        };

        for retry_number in 0..MAX_TRIES {
            info!(
                backend = %self.name,
                request_id = %context.request_id,
                attempt = retry_number,
                pushkey = %mask_pushkey(&device.pushkey),
                "Sending notification to Web Push endpoint"
            );

            match self.send_once(&endpoint, ciphertext.clone(), device).await {
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

fn endpoint_origin(endpoint: &str) -> Option<String> {
    let url = Url::parse(endpoint).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

fn b64url_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input.trim_end_matches('='))
}

fn b64url_encode(input: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(input)
}

/// Signs `Authorization: vapid t=<jwt>, k=<public key>` headers addressed
/// to a push service origin.
struct VapidSigner {
    signing_key: SigningKey,
    public_key_b64: String,
    subject: String,
}

impl VapidSigner {
    fn from_pem_file(
        backend_name: &str,
        path: &str,
        contact_email: &str,
    ) -> Result<Self, SetupError> {
        let pem = std::fs::read_to_string(path).map_err(|source| SetupError::Io {
            path: path.to_string(),
            source,
        })?;

        let secret = if pem.contains("BEGIN EC PRIVATE KEY") {
            SecretKey::from_sec1_pem(&pem).map_err(|e| e.to_string())
        } else {
            SecretKey::from_pkcs8_pem(&pem).map_err(|e| e.to_string())
        }
        .map_err(|e| {
            SetupError::backend(backend_name, format!("bad VAPID private key: {e}"))
        })?;

        let public_key_b64 =
            b64url_encode(secret.public_key().to_encoded_point(false).as_bytes());

        Ok(Self {
            signing_key: SigningKey::from(&secret),
            public_key_b64,
            subject: format!("mailto:{contact_email}"),
        })
    }

    fn auth_header(&self, audience: &str) -> Result<String, DispatchError> {
        let exp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + VAPID_TOKEN_LIFETIME.as_secs();

        let header = b64url_encode(br#"{"typ":"JWT","alg":"ES256"}"#);
        let claims = b64url_encode(
            json!({"aud": audience, "exp": exp, "sub": self.subject})
                .to_string()
                .as_bytes(),
        );
        let signing_input = format!("{header}.{claims}");

        let signature: p256::ecdsa::Signature = self.signing_key.sign(signing_input.as_bytes());
        let token = format!("{signing_input}.{}", b64url_encode(&signature.to_bytes()));

        Ok(format!("vapid t={token}, k={}", self.public_key_b64))
    }
}

mod ece {
    //! RFC 8291 `aes128gcm` message encryption: ephemeral P-256 ECDH with
    //! the subscription key, two HKDF-SHA256 stages, one AES-128-GCM
    //! record carrying the whole payload.

    use aes_gcm::aead::Aead;
    use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
    use hkdf::Hkdf;
    use p256::ecdh::EphemeralSecret;
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use p256::PublicKey;
    use rand::rngs::OsRng;
    use rand::RngCore;
    use sha2::Sha256;

    /// All payloads fit one record; this is the advertised record size.
    const RECORD_SIZE: u32 = 4096;

    #[derive(Debug, thiserror::Error)]
    #[error("Web Push encryption failed: {0}")]
    pub struct EceError(pub &'static str);

    pub fn encrypt(
        plaintext: &[u8],
        ua_public_raw: &[u8],
        auth_secret: &[u8],
    ) -> Result<Vec<u8>, EceError> {
        let ua_public = PublicKey::from_sec1_bytes(ua_public_raw)
            .map_err(|_| EceError("subscription key is not a valid P-256 point"))?;

        let as_secret = EphemeralSecret::random(&mut OsRng);
        let as_public = as_secret.public_key().to_encoded_point(false);
        let shared = as_secret.diffie_hellman(&ua_public);

        // IKM = HKDF(auth_secret, ecdh, "WebPush: info" || 0x00 || ua || as)
        let mut info = Vec::with_capacity(14 + 65 + 65);
        info.extend_from_slice(b"WebPush: info\0");
        info.extend_from_slice(ua_public.to_encoded_point(false).as_bytes());
        info.extend_from_slice(as_public.as_bytes());
        let mut ikm = [0u8; 32];
        Hkdf::<Sha256>::new(Some(auth_secret), shared.raw_secret_bytes())
            .expand(&info, &mut ikm)
            .map_err(|_| EceError("HKDF expand failed"))?;

        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);

        let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
        let mut cek = [0u8; 16];
        hk.expand(b"Content-Encoding: aes128gcm\0", &mut cek)
            .map_err(|_| EceError("HKDF expand failed"))?;
        let mut nonce = [0u8; 12];
        hk.expand(b"Content-Encoding: nonce\0", &mut nonce)
            .map_err(|_| EceError("HKDF expand failed"))?;

        // single record: payload then the last-record delimiter
        let mut record = Vec::with_capacity(plaintext.len() + 1);
        record.extend_from_slice(plaintext);
        record.push(0x02);

        let ciphertext = Aes128Gcm::new_from_slice(&cek)
            .map_err(|_| EceError("bad AES key length"))?
            .encrypt(Nonce::from_slice(&nonce), record.as_slice())
            .map_err(|_| EceError("AES-GCM encryption failed"))?;

        // aes128gcm header: salt, record size, keyid length, keyid
        let mut body = Vec::with_capacity(16 + 4 + 1 + 65 + ciphertext.len());
        body.extend_from_slice(&salt);
        body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
        body.push(65);
        body.extend_from_slice(as_public.as_bytes());
        body.extend_from_slice(&ciphertext);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::Aead;
    use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
    use hkdf::Hkdf;
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::VerifyingKey;
    use sha2::Sha256;
    use wiremock::matchers::{header, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Decrypt an `aes128gcm` body with the subscriber's key, the way a
    /// browser would.
    fn decrypt(body: &[u8], ua_secret: &SecretKey, auth_secret: &[u8]) -> Vec<u8> {
        let (salt, rest) = body.split_at(16);
        let (_rs, rest) = rest.split_at(4);
        let (keyid_len, rest) = rest.split_at(1);
        assert_eq!(keyid_len[0], 65);
        let (as_public_raw, ciphertext) = rest.split_at(65);

        let as_public = p256::PublicKey::from_sec1_bytes(as_public_raw).unwrap();
        let shared =
            p256::ecdh::diffie_hellman(ua_secret.to_nonzero_scalar(), as_public.as_affine());

        let mut info = Vec::new();
        info.extend_from_slice(b"WebPush: info\0");
        info.extend_from_slice(
            ua_secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes(),
        );
        info.extend_from_slice(as_public_raw);
        let mut ikm = [0u8; 32];
        Hkdf::<Sha256>::new(Some(auth_secret), shared.raw_secret_bytes())
            .expand(&info, &mut ikm)
            .unwrap();

        let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
        let mut cek = [0u8; 16];
        hk.expand(b"Content-Encoding: aes128gcm\0", &mut cek).unwrap();
        let mut nonce = [0u8; 12];
        hk.expand(b"Content-Encoding: nonce\0", &mut nonce).unwrap();

        let mut record = Aes128Gcm::new_from_slice(&cek)
            .unwrap()
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .unwrap();
        assert_eq!(record.pop(), Some(0x02));
        record
    }

    #[test]
    fn test_encrypt_round_trips() {
        let ua_secret = SecretKey::random(&mut rand::rngs::OsRng);
        let ua_public = ua_secret.public_key().to_encoded_point(false);
        let auth_secret: [u8; 16] = rand::random();

        let plaintext = br#"{"room_id":"!a:b","unread":2}"#;
        let body = ece::encrypt(plaintext, ua_public.as_bytes(), &auth_secret).unwrap();
        assert_eq!(decrypt(&body, &ua_secret, &auth_secret), plaintext);
    }

    #[test]
    fn test_encrypt_rejects_garbage_key() {
        assert!(ece::encrypt(b"x", &[0u8; 65], &[0u8; 16]).is_err());
    }

    #[test]
    fn test_vapid_header_shape_and_signature() {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let pem = secret.to_sec1_pem(Default::default()).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), pem.as_bytes()).unwrap();

        let signer = VapidSigner::from_pem_file(
            "com.example.webpush",
            file.path().to_str().unwrap(),
            "admin@example.com",
        )
        .unwrap();

        let header = signer.auth_header("https://push.example.net").unwrap();
        let token = header
            .strip_prefix("vapid t=")
            .unwrap()
            .split(", k=")
            .next()
            .unwrap();

        let mut parts = token.split('.');
        let jwt_header = parts.next().unwrap();
        let claims = parts.next().unwrap();
        let signature = parts.next().unwrap();

        let decoded: Value =
            serde_json::from_slice(&b64url_decode(claims).unwrap()).unwrap();
        assert_eq!(decoded["aud"], "https://push.example.net");
        assert_eq!(decoded["sub"], "mailto:admin@example.com");
        assert!(decoded["exp"].as_u64().unwrap() > 0);

        let verifying_key = VerifyingKey::from(&SigningKey::from(&secret));
        let signature =
            p256::ecdsa::Signature::from_slice(&b64url_decode(signature).unwrap()).unwrap();
        verifying_key
            .verify(format!("{jwt_header}.{claims}").as_bytes(), &signature)
            .unwrap();
    }

    fn subscription_device(endpoint: &str) -> Value {
        let ua_secret = SecretKey::random(&mut rand::rngs::OsRng);
        let p256dh = b64url_encode(
            ua_secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes(),
        );
        let auth: [u8; 16] = rand::random();
        json!({
            "app_id": "com.example.webpush",
            "pushkey": p256dh,
            "data": {
                "endpoint": endpoint,
                "auth": b64url_encode(&auth),
            }
        })
    }

    fn backend_with_tempkey(ttl: u64) -> (WebPushBackend, tempfile::NamedTempFile) {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let pem = secret.to_sec1_pem(Default::default()).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), pem.as_bytes()).unwrap();

        let app: AppConfig = serde_yaml::from_str(&format!(
            "type: webpush\nvapid_private_key: {}\nvapid_contact_email: admin@example.com\nttl: {ttl}\n",
            file.path().display()
        ))
        .unwrap();
        let backend = WebPushBackend::create("com.example.webpush", &app, &Dialer::Direct).unwrap();
        (backend, file)
    }

    fn notification(devices: Value) -> Notification {
        serde_json::from_value(json!({
            "event_id": "$event",
            "room_id": "!room:example.com",
            "type": "m.room.message",
            "sender": "@user:example.com",
            "user_is_target": false,
            "content": {"msgtype": "m.text", "body": "hello"},
            "counts": {"unread": 2},
            "devices": devices
        }))
        .unwrap()
    }

    #[test]
    fn test_build_payload_skips_empty_and_false() {
        let n = notification(json!([subscription_device("https://push.example.net/x")]));
        let payload = WebPushBackend::build_payload(&n, &n.devices[0]).unwrap();
        assert_eq!(payload["room_id"], "!room:example.com");
        assert_eq!(payload["unread"], 2);
        // user_is_target: false is not forwarded
        assert!(payload.get("user_is_target").is_none());
        assert!(payload.get("room_name").is_none());
    }

    #[tokio::test]
    async fn test_delivery_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-encoding", "aes128gcm"))
            .and(header("TTL", "15"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (backend, _key) = backend_with_tempkey(15);
        let n = notification(json!([
            subscription_device(&format!("{}/push/v2/token", server.uri()))
        ]));
        let device = &n.devices[0];
        let rejected = backend
            .dispatch(&n, &[device], &NotificationContext::new())
            .await
            .unwrap();
        assert!(rejected.is_empty());
    }

    #[tokio::test]
    async fn test_4xx_rejects_pushkey() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .expect(1)
            .mount(&server)
            .await;

        let (backend, _key) = backend_with_tempkey(0);
        let n = notification(json!([
            subscription_device(&format!("{}/push/v2/token", server.uri()))
        ]));
        let device = &n.devices[0];
        let rejected = backend
            .dispatch(&n, &[device], &NotificationContext::new())
            .await
            .unwrap();
        assert_eq!(rejected, vec![device.pushkey.clone()]);
    }

    #[tokio::test]
    async fn test_5xx_is_temporary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let (backend, _key) = backend_with_tempkey(0);
        let n = notification(json!([
            subscription_device(&format!("{}/push/v2/token", server.uri()))
        ]));
        let device = &n.devices[0];

        let err = backend
            .send_once(
                &format!("{}/push/v2/token", server.uri()),
                vec![1, 2, 3],
                device,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Temporary { .. }));
    }

    #[tokio::test]
    async fn test_missing_endpoint_rejects_pushkey() {
        let (backend, _key) = backend_with_tempkey(0);
        let n = notification(json!([{
            "app_id": "com.example.webpush",
            "pushkey": "AAAA",
            "data": {"auth": "AAAA"}
        }]));
        let device = &n.devices[0];
        let rejected = backend
            .dispatch(&n, &[device], &NotificationContext::new())
            .await
            .unwrap();
        assert_eq!(rejected, vec!["AAAA"]);
    }
}
