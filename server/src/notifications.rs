use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::time::Instant;

/// Per-device presentation hints supplied by the homeserver.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tweaks {
    pub sound: Option<String>,
}

/// Unread/missed-call counters carried alongside a notification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Counts {
    pub unread: Option<i64>,
    pub missed_calls: Option<i64>,
}

/// One target device for a notification. `pushkey` is the provider-specific
/// registration token and is treated as a secret.
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub app_id: String,
    pub pushkey: String,
    #[serde(default)]
    pub pushkey_ts: i64,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub tweaks: Tweaks,
}

impl Device {
    /// The `default_payload` mapping from `data`, if configured.
    ///
    /// `Ok(None)` means absent, `Err(())` means present but not a mapping,
    /// in which case the device must be rejected.
    pub fn default_payload(&self) -> Result<Option<&Map<String, Value>>, ()> {
        match self.data.as_ref().and_then(|d| d.get("default_payload")) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(()),
        }
    }

    /// A string field from `data`, if present and actually a string.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(Value::as_str)
    }
}

/// A single notification poke from the homeserver, fanned out over
/// `devices`. Immutable for the lifetime of the request.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    pub event_id: Option<String>,
    pub room_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub sender: Option<String>,
    pub sender_display_name: Option<String>,
    pub room_name: Option<String>,
    pub room_alias: Option<String>,
    pub membership: Option<String>,
    pub user_is_target: Option<bool>,
    pub prio: Option<String>,
    pub content: Option<Map<String, Value>>,
    #[serde(default)]
    pub counts: Counts,
    pub devices: Vec<Device>,
}

impl Notification {
    /// Whether the homeserver marked this notification low priority.
    pub fn is_low_priority(&self) -> bool {
        self.prio.as_deref() == Some("low")
    }
}

/// Per-request context created by the HTTP layer and threaded through every
/// backend dispatch for correlated logging.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    pub request_id: String,
    pub start_time: Instant,
}

impl NotificationContext {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            start_time: Instant::now(),
        }
    }
}

impl Default for NotificationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Pushkeys can be used to push to someone, so never log them whole.
pub fn mask_pushkey(pushkey: &str) -> String {
    if pushkey.len() <= 12 {
        return format!("{}...", &pushkey[..pushkey.len().min(4)]);
    }

    format!(
        "{}...{}",
        &pushkey[..8],
        &pushkey[pushkey.len().saturating_sub(4)..]
    )
}

/// Truncate `s` to at most `max_bytes` bytes without splitting a code point.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device_from(value: serde_json::Value) -> Device {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_notification_minimal() {
        let n: Notification = serde_json::from_value(json!({
            "devices": [{"app_id": "com.example.apns", "pushkey": "spqr"}]
        }))
        .unwrap();
        assert_eq!(n.devices.len(), 1);
        assert_eq!(n.devices[0].app_id, "com.example.apns");
        assert!(!n.is_low_priority());
        assert!(n.counts.unread.is_none());
    }

    #[test]
    fn test_notification_missing_pushkey_fails() {
        let result: Result<Notification, _> = serde_json::from_value(json!({
            "devices": [{"app_id": "com.example.apns"}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_low_priority() {
        let n: Notification = serde_json::from_value(json!({
            "prio": "low",
            "devices": [{"app_id": "a", "pushkey": "k"}]
        }))
        .unwrap();
        assert!(n.is_low_priority());
    }

    #[test]
    fn test_default_payload_absent() {
        let d = device_from(json!({"app_id": "a", "pushkey": "k"}));
        assert_eq!(d.default_payload(), Ok(None));
    }

    #[test]
    fn test_default_payload_present() {
        let d = device_from(json!({
            "app_id": "a",
            "pushkey": "k",
            "data": {"default_payload": {"aps": {"mutable-content": 1}}}
        }));
        let payload = d.default_payload().unwrap().unwrap();
        assert!(payload.contains_key("aps"));
    }

    #[test]
    fn test_default_payload_malformed() {
        let d = device_from(json!({
            "app_id": "a",
            "pushkey": "k",
            "data": {"default_payload": "not a map"}
        }));
        assert!(d.default_payload().is_err());
    }

    #[test]
    fn test_mask_pushkey_short() {
        assert_eq!(mask_pushkey("spqr"), "spqr...");
    }

    #[test]
    fn test_mask_pushkey_long() {
        let masked = mask_pushkey("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(masked, "abcdefgh...wxyz");
    }

    #[test]
    fn test_truncate_str_char_boundary() {
        // é is two bytes in UTF-8; cutting at byte 1 must back off to 0
        assert_eq!(truncate_str("é", 1), "");
        assert_eq!(truncate_str("aé", 2), "a");
        assert_eq!(truncate_str("abc", 5), "abc");
        assert_eq!(truncate_str("abc", 2), "ab");
    }
}
