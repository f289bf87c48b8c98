//! Shrinks an APNs payload to a byte budget by chopping whole code points
//! off user-visible alert text (`aps.alert`, `aps.alert.body`,
//! `aps.alert.loc-args[i]`), longest field first.

use serde_json::{Map, Value};

/// The payload cannot be made to fit: nothing left to chop.
#[derive(Debug, thiserror::Error)]
#[error("Payload could not be truncated to fit the size limit")]
pub struct BodyTooLong;

/// A field inside `aps` whose text may be shortened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choppable {
    Alert,
    AlertBody,
    LocArg(usize),
}

/// JSON-encoded size in bytes. serde_json emits UTF-8 without ASCII
/// escaping, so this matches what goes on the wire.
pub fn json_len(payload: &Map<String, Value>) -> usize {
    serde_json::to_string(&Value::Object(payload.clone()))
        .map(|s| s.len())
        .unwrap_or(usize::MAX)
}

pub fn is_too_long(payload: &Map<String, Value>, max_length: usize) -> bool {
    json_len(payload) > max_length
}

/// Truncate alert fields until the JSON-encoded payload fits in
/// `max_length` bytes.
///
/// Only fields that are safe to shorten are touched; whole code points are
/// removed so the result is always valid UTF-8. Fails with [`BodyTooLong`]
/// when the payload has no (remaining) choppable text and is still over
/// budget.
pub fn truncate(
    payload: &Map<String, Value>,
    max_length: usize,
) -> Result<Map<String, Value>, BodyTooLong> {
    let mut payload = payload.clone();

    let Some(aps) = payload.get("aps").and_then(Value::as_object).cloned() else {
        if is_too_long(&payload, max_length) {
            return Err(BodyTooLong);
        }
        return Ok(payload);
    };

    let mut aps = aps;
    // chop off whole code points until it fits, or nothing is left to chop
    loop {
        payload.insert("aps".to_string(), Value::Object(aps.clone()));
        if !is_too_long(&payload, max_length) {
            break;
        }

        let Some(longest) = longest_choppable(&aps) else {
            return Err(BodyTooLong);
        };

        let mut txt = choppable_get(&aps, longest).unwrap_or_default().to_string();
        txt.pop();
        choppable_put(&mut aps, longest, txt);
    }

    Ok(payload)
}

fn choppables_for_aps(aps: &Map<String, Value>) -> Vec<Choppable> {
    let mut ret = Vec::new();
    let Some(alert) = aps.get("alert") else {
        return ret;
    };

    match alert {
        Value::String(_) => ret.push(Choppable::Alert),
        Value::Object(alert) => {
            if alert.get("body").is_some() {
                ret.push(Choppable::AlertBody);
            }
            if let Some(args) = alert.get("loc-args").and_then(Value::as_array) {
                ret.extend((0..args.len()).map(Choppable::LocArg));
            }
        }
        _ => {}
    }

    ret
}

fn choppable_get<'a>(aps: &'a Map<String, Value>, choppable: Choppable) -> Option<&'a str> {
    match choppable {
        Choppable::Alert => aps.get("alert").and_then(Value::as_str),
        Choppable::AlertBody => aps
            .get("alert")
            .and_then(Value::as_object)
            .and_then(|a| a.get("body"))
            .and_then(Value::as_str),
        Choppable::LocArg(i) => aps
            .get("alert")
            .and_then(Value::as_object)
            .and_then(|a| a.get("loc-args"))
            .and_then(Value::as_array)
            .and_then(|args| args.get(i))
            .and_then(Value::as_str),
    }
}

fn choppable_put(aps: &mut Map<String, Value>, choppable: Choppable, val: String) {
    match choppable {
        Choppable::Alert => {
            aps.insert("alert".to_string(), Value::String(val));
        }
        Choppable::AlertBody => {
            if let Some(alert) = aps.get_mut("alert").and_then(Value::as_object_mut) {
                alert.insert("body".to_string(), Value::String(val));
            }
        }
        Choppable::LocArg(i) => {
            if let Some(args) = aps
                .get_mut("alert")
                .and_then(Value::as_object_mut)
                .and_then(|a| a.get_mut("loc-args"))
                .and_then(Value::as_array_mut)
            {
                if let Some(slot) = args.get_mut(i) {
                    *slot = Value::String(val);
                }
            }
        }
    }
}

/// The choppable with the largest UTF-8 byte length; ties go to the first
/// in enumeration order. `None` when nothing is left to chop.
fn longest_choppable(aps: &Map<String, Value>) -> Option<Choppable> {
    let mut longest = None;
    let mut length_of_longest = 0;
    for c in choppables_for_aps(aps) {
        let val_len = choppable_get(aps, c).map(str::len).unwrap_or(0);
        if val_len > length_of_longest {
            longest = Some(c);
            length_of_longest = val_len;
        }
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn simplestring(length: usize) -> String {
        "a".repeat(length)
    }

    fn sizedstring(length: usize) -> String {
        // Equal numbers of 1-, 2-, 3- and 4-byte code points
        let mut s = String::new();
        let chars = ['a', 'é', '☃', '🍩'];
        let mut bytes = 0;
        for c in chars.iter().cycle() {
            if bytes + c.len_utf8() > length {
                break;
            }
            s.push(*c);
            bytes += c.len_utf8();
        }
        s.clone() + &simplestring(length - s.len())
    }

    #[test]
    fn test_no_aps_under_budget_passes_through() {
        let payload = obj(json!({"room_id": "!a:b"}));
        let out = truncate(&payload, 2048).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_no_aps_over_budget_fails() {
        let payload = obj(json!({"room_id": simplestring(300)}));
        assert!(truncate(&payload, 200).is_err());
    }

    #[test]
    fn test_simple_alert_string_truncated() {
        let payload = obj(json!({"aps": {"alert": simplestring(500)}}));
        let out = truncate(&payload, 200).unwrap();
        assert!(json_len(&out) <= 200);
        let alert = out["aps"]["alert"].as_str().unwrap();
        assert!(!alert.is_empty());
    }

    #[test]
    fn test_alert_body_truncated() {
        let payload = obj(json!({"aps": {"alert": {"body": simplestring(500)}}}));
        let out = truncate(&payload, 200).unwrap();
        assert!(json_len(&out) <= 200);
        assert!(out["aps"]["alert"]["body"].as_str().unwrap().len() < 500);
    }

    #[test]
    fn test_multibyte_code_points_never_split() {
        for max in 100..150 {
            let payload = obj(json!({"aps": {"alert": {"body": sizedstring(200)}}}));
            let out = truncate(&payload, max).unwrap();
            assert!(json_len(&out) <= max, "over budget at max={max}");
            // as_str() would have panicked already if the string were
            // invalid; double-check the JSON round-trips
            let encoded = serde_json::to_string(&out).unwrap();
            let _: Value = serde_json::from_str(&encoded).unwrap();
        }
    }

    #[test]
    fn test_longest_loc_arg_chopped_first() {
        let payload = obj(json!({
            "aps": {"alert": {"loc-args": [simplestring(30), simplestring(100)]}}
        }));
        let out = truncate(&payload, 100).unwrap();
        let args = out["aps"]["alert"]["loc-args"].as_array().unwrap();
        // the short arg is untouched; only the long one was chopped
        assert_eq!(args[0].as_str().unwrap().len(), 30);
        assert!(args[1].as_str().unwrap().len() < 100);
        assert!(json_len(&out) <= 100);
    }

    #[test]
    fn test_both_loc_args_chopped_when_needed() {
        let payload = obj(json!({
            "aps": {"alert": {"loc-args": [simplestring(1000), simplestring(1000)]}}
        }));
        let out = truncate(&payload, 200).unwrap();
        assert!(json_len(&out) <= 200);
        let args = out["aps"]["alert"]["loc-args"].as_array().unwrap();
        assert!(!args[0].as_str().unwrap().is_empty());
        assert!(!args[1].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_nothing_choppable_fails() {
        let payload = obj(json!({"aps": {"badge": 3}, "room_id": simplestring(300)}));
        assert!(truncate(&payload, 100).is_err());
    }

    #[test]
    fn test_unchoppable_alert_list_fails() {
        // an alert of unexpected type contributes no choppables
        let payload = obj(json!({"aps": {"alert": [simplestring(300)]}}));
        assert!(truncate(&payload, 100).is_err());
    }

    #[test]
    fn test_idempotent() {
        let payload = obj(json!({
            "aps": {"alert": {"loc-args": [simplestring(150), simplestring(30)]}}
        }));
        let once = truncate(&payload, 120).unwrap();
        let twice = truncate(&once, 120).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_fits_untouched() {
        let payload = obj(json!({"aps": {"alert": "short"}}));
        let out = truncate(&payload, 2048).unwrap();
        assert_eq!(out, payload);
    }
}
