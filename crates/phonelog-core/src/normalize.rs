//! Location item normalization and fingerprinting.
//!
//! [`normalize_one`] turns one inbound [`LocationItem`] into a
//! [`CanonicalRecord`], or `None` when the item cannot be placed in time and
//! space. Drops are a data-quality outcome and are counted by callers, they
//! are never errors.

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::model::{CanonicalRecord, LocationItem};
use crate::timestamp::parse_timestamp;

/// Normalize a single location item.
///
/// Identity resolution order for both `user_id` and `device_id`: the item
/// itself, then its properties, then the caller-supplied default.
///
/// Returns `None` iff the epoch milliseconds, longitude or latitude could not
/// be resolved.
pub fn normalize_one(
    item: &LocationItem,
    default_user: &str,
    default_device: Option<&str>,
) -> Option<CanonicalRecord> {
    let geometry = item.geometry.as_ref().and_then(|g| g.as_object());
    let properties = item.properties.as_ref().and_then(|p| p.as_object());
    let geometry = geometry.as_deref();
    let properties = properties.as_deref();

    let (longitude, latitude) = geometry
        .and_then(|g| g.get("coordinates"))
        .and_then(coordinate_pair)?;

    let timestamp = properties
        .and_then(|p| p.get("timestamp"))
        .and_then(parse_timestamp)?;

    let user_id = identifier(item.user_id.as_ref())
        .or_else(|| identifier(properties.and_then(|p| p.get("user_id"))))
        .unwrap_or_else(|| default_user.to_string());
    let device_id = identifier(item.device_id.as_ref())
        .or_else(|| identifier(properties.and_then(|p| p.get("device_id"))))
        .or_else(|| default_device.map(str::to_string));

    let fingerprint = fingerprint(
        &user_id,
        device_id.as_deref(),
        timestamp.epoch_millis,
        longitude,
        latitude,
    );

    let prop = |key: &str| passthrough(properties, key);

    Some(CanonicalRecord {
        fingerprint,
        user_id,
        device_id,
        geometry_type: geometry
            .and_then(|g| g.get("type"))
            .and_then(Value::as_str)
            .map(str::to_string),
        coordinates: geometry
            .and_then(|g| g.get("coordinates"))
            .map(coordinate_values),
        longitude,
        latitude,
        timestamp_iso8601: timestamp.iso8601,
        timestamp_epoch_millis: timestamp.epoch_millis,
        speed: prop("speed"),
        battery_state: prop("battery_state"),
        motion: prop("motion"),
        battery_level: prop("battery_level"),
        vertical_accuracy: prop("vertical_accuracy"),
        horizontal_accuracy: prop("horizontal_accuracy"),
        pauses: prop("pauses"),
        wifi: prop("wifi"),
        deferred: prop("deferred"),
        significant_change: prop("significant_change"),
        locations_in_payload: prop("locations_in_payload"),
        activity: prop("activity"),
        altitude: prop("altitude"),
        desired_accuracy: prop("desired_accuracy"),
        raw_item: item.to_value(),
    })
}

/// Derive the idempotency key for an observation.
///
/// SHA-1 hex over `user|device|millis|lon|lat`. The field encoding matches
/// the keys already present in the store: an absent device is `None`, a zero
/// millis/longitude/latitude is the empty string, and floats use their
/// shortest round-trip form with a `.0` suffix when integral.
pub fn fingerprint(
    user_id: &str,
    device_id: Option<&str>,
    epoch_millis: i64,
    longitude: f64,
    latitude: f64,
) -> String {
    let millis = if epoch_millis == 0 {
        String::new()
    } else {
        epoch_millis.to_string()
    };
    let source = format!(
        "{}|{}|{}|{}|{}",
        user_id,
        device_id.unwrap_or("None"),
        millis,
        coordinate_text(longitude),
        coordinate_text(latitude),
    );
    hex::encode(Sha1::digest(source.as_bytes()))
}

/// Take `[longitude, latitude]` from the first two elements of a sequence.
fn coordinate_pair(value: &Value) -> Option<(f64, f64)> {
    let items = value.as_array()?;
    if items.len() < 2 {
        return None;
    }
    Some((coordinate(&items[0])?, coordinate(&items[1])?))
}

fn coordinate(value: &Value) -> Option<f64> {
    let f = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    f.is_finite().then_some(f)
}

/// The coordinate sequence with numeric strings turned into numbers, or the
/// value as received if any element is not numeric.
fn coordinate_values(value: &Value) -> Value {
    let Some(items) = value.as_array() else {
        return value.clone();
    };
    let numeric: Option<Vec<Value>> = items
        .iter()
        .map(|v| match v {
            Value::Number(_) => Some(v.clone()),
            other => coordinate(other).map(Value::from),
        })
        .collect();
    numeric.map_or_else(|| value.clone(), Value::Array)
}

/// Resolve an item-level identifier: non-empty strings and non-zero numbers.
fn identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

/// Resolve a batch-level identifier: any string or number, as text.
///
/// Unlike item-level identifiers an empty string is kept, so an empty batch
/// device reaches the fingerprint as an empty field rather than as absent.
pub(crate) fn batch_identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn passthrough(properties: Option<&Map<String, Value>>, key: &str) -> Option<Value> {
    properties?.get(key).filter(|v| !v.is_null()).cloned()
}

fn coordinate_text(value: f64) -> String {
    if value == 0.0 {
        String::new()
    } else {
        float_repr(value)
    }
}

/// Shortest round-trip float text, exponent form outside `[1e-4, 1e16)`.
fn float_repr(value: f64) -> String {
    let magnitude = value.abs();
    if (1e-4..1e16).contains(&magnitude) {
        let text = value.to_string();
        if text.contains('.') {
            text
        } else {
            format!("{text}.0")
        }
    } else {
        // Rust renders `1e-5`; the stored keys use `1e-05`.
        let text = format!("{value:e}");
        match text.split_once('e') {
            Some((mantissa, exponent)) => {
                let exponent: i32 = exponent.parse().unwrap_or(0);
                let sign = if exponent < 0 { '-' } else { '+' };
                format!("{mantissa}e{sign}{:02}", exponent.abs())
            }
            None => text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(value: Value) -> LocationItem {
        LocationItem::from_value(value).unwrap()
    }

    fn feature(coordinates: Value, properties: Value) -> LocationItem {
        item(json!({
            "type": "Feature",
            "geometry": {"type": "Point", "coordinates": coordinates},
            "properties": properties
        }))
    }

    #[test]
    fn test_reference_example() {
        let record = normalize_one(
            &feature(json!([-73.5, 40.5]), json!({"timestamp": "2024-01-01T00:00:00Z"})),
            "u1",
            Some("d1"),
        )
        .unwrap();

        assert_eq!(record.timestamp_epoch_millis, 1_704_067_200_000);
        assert_eq!(record.longitude, -73.5);
        assert_eq!(record.latitude, 40.5);
        assert_eq!(record.geometry_type.as_deref(), Some("Point"));
        assert_eq!(record.coordinates, Some(json!([-73.5, 40.5])));
        // sha1("u1|d1|1704067200000|-73.5|40.5")
        assert_eq!(
            record.fingerprint,
            "9027f464e966ea8e7df1ce553b1435833b7ace0f"
        );
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint("u1", Some("d1"), 1_704_067_200_000, -73.5, 40.5);
        let b = fingerprint("u1", Some("d1"), 1_704_067_200_000, -73.5, 40.5);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn test_fingerprint_varies_with_each_field() {
        let base = fingerprint("u1", Some("d1"), 1_704_067_200_000, -73.5, 40.5);
        assert_ne!(base, fingerprint("u2", Some("d1"), 1_704_067_200_000, -73.5, 40.5));
        assert_ne!(base, fingerprint("u1", Some("d2"), 1_704_067_200_000, -73.5, 40.5));
        assert_ne!(base, fingerprint("u1", Some("d1"), 1_704_067_200_001, -73.5, 40.5));
        assert_ne!(base, fingerprint("u1", Some("d1"), 1_704_067_200_000, -73.4, 40.5));
        assert_ne!(base, fingerprint("u1", Some("d1"), 1_704_067_200_000, -73.5, 40.4));
    }

    #[test]
    fn test_fingerprint_legacy_encoding() {
        // sha1("u1|None|1704067200000|-73.5|40.5")
        assert_eq!(
            fingerprint("u1", None, 1_704_067_200_000, -73.5, 40.5),
            "4f6917f5a6c0591adac2d583ff51c72928d29277"
        );
        // sha1("anonymous|d1|1704067200000|10.0|1e-05")
        assert_eq!(
            fingerprint("anonymous", Some("d1"), 1_704_067_200_000, 10.0, 0.00001),
            "634aaa6c87470fa884cba5aab4efdf4ea66e8cc8"
        );
    }

    #[test]
    fn test_fingerprint_empty_device_is_not_absent() {
        // sha1("u1||1704067200000|-73.5|40.5")
        let empty = fingerprint("u1", Some(""), 1_704_067_200_000, -73.5, 40.5);
        assert_eq!(empty, "69e0c78a33b44ad9f3929ee7621b84dc588239d0");
        assert_ne!(empty, fingerprint("u1", None, 1_704_067_200_000, -73.5, 40.5));
    }

    #[test]
    fn test_batch_identifier() {
        assert_eq!(batch_identifier(Some(&json!("u1"))).as_deref(), Some("u1"));
        assert_eq!(batch_identifier(Some(&json!(""))).as_deref(), Some(""));
        assert_eq!(batch_identifier(Some(&json!(42))).as_deref(), Some("42"));
        assert_eq!(batch_identifier(Some(&json!(1.5))).as_deref(), Some("1.5"));
        assert_eq!(batch_identifier(Some(&Value::Null)), None);
        assert_eq!(batch_identifier(Some(&json!({"id": 1}))), None);
        assert_eq!(batch_identifier(None), None);
    }

    #[test]
    fn test_float_repr() {
        assert_eq!(float_repr(-73.5), "-73.5");
        assert_eq!(float_repr(40.0), "40.0");
        assert_eq!(float_repr(0.0001), "0.0001");
        assert_eq!(float_repr(0.00001), "1e-05");
        assert_eq!(float_repr(-0.000015), "-1.5e-05");
        assert_eq!(float_repr(1e16), "1e+16");
    }

    #[test]
    fn test_drop_without_timestamp() {
        let dropped = normalize_one(&feature(json!([-73.5, 40.5]), json!({})), "u1", None);
        assert!(dropped.is_none());
    }

    #[test]
    fn test_drop_with_null_timestamp_in_encoded_properties() {
        let it = item(json!({
            "type": "Feature",
            "geometry": {"type": "Point", "coordinates": [-73.5, 40.5]},
            "properties": "{'timestamp': None}"
        }));
        assert!(normalize_one(&it, "u1", None).is_none());
    }

    #[test]
    fn test_drop_without_coordinates() {
        let props = json!({"timestamp": 1_704_067_200, "speed": 3.2, "wifi": "home"});
        for coords in [json!([]), json!([1.0]), json!(["a", 2.0]), json!(null), json!("1,2")] {
            assert!(normalize_one(&feature(coords, props.clone()), "u1", None).is_none());
        }
        let no_geometry = item(json!({"properties": props}));
        assert!(normalize_one(&no_geometry, "u1", None).is_none());
    }

    #[test]
    fn test_drop_with_unparseable_geometry() {
        let it = item(json!({
            "geometry": "{'type': 'Point', 'coordinates': [",
            "properties": {"timestamp": 1_704_067_200}
        }));
        assert!(normalize_one(&it, "u1", None).is_none());
    }

    #[test]
    fn test_numeric_strings_as_coordinates() {
        let record = normalize_one(
            &feature(json!([" -73.5", "40.5", 12]), json!({"timestamp": 1_704_067_200})),
            "u1",
            Some("d1"),
        )
        .unwrap();
        assert_eq!((record.longitude, record.latitude), (-73.5, 40.5));
        assert_eq!(record.coordinates, Some(json!([-73.5, 40.5, 12])));
    }

    #[test]
    fn test_non_numeric_extra_coordinate_kept_as_received() {
        let record = normalize_one(
            &feature(json!([-73.5, 40.5, "n/a"]), json!({"timestamp": 1_704_067_200})),
            "u1",
            None,
        )
        .unwrap();
        assert_eq!(record.coordinates, Some(json!([-73.5, 40.5, "n/a"])));
    }

    #[test]
    fn test_encoded_fragments_match_structured() {
        let structured = feature(
            json!([-73.5, 40.5]),
            json!({"timestamp": "2024-01-01T00:00:00Z", "deferred": true, "wifi": null}),
        );
        let encoded = item(json!({
            "type": "Feature",
            "geometry": "{'type': 'Point', 'coordinates': [-73.5, 40.5],}",
            "properties": "{'timestamp': '2024-01-01T00:00:00Z', 'deferred': True, 'wifi': None,}"
        }));

        let a = normalize_one(&structured, "u1", Some("d1")).unwrap();
        let b = normalize_one(&encoded, "u1", Some("d1")).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.deferred, b.deferred);
        assert_eq!(a.wifi, None);
        assert_eq!(b.wifi, None);
        assert_eq!(a.coordinates, b.coordinates);
    }

    #[test]
    fn test_identity_resolution_order() {
        let props = json!({"timestamp": 1_704_067_200, "user_id": "prop-user", "device_id": "prop-dev"});

        // Defaults lose to properties.
        let r = normalize_one(&feature(json!([1.5, 2.5]), props.clone()), "default", Some("dd")).unwrap();
        assert_eq!(r.user_id, "prop-user");
        assert_eq!(r.device_id.as_deref(), Some("prop-dev"));

        // Properties lose to the item itself.
        let it = item(json!({
            "user_id": "item-user",
            "device_id": "",
            "geometry": {"coordinates": [1.5, 2.5]},
            "properties": props
        }));
        let r = normalize_one(&it, "default", Some("dd")).unwrap();
        assert_eq!(r.user_id, "item-user");
        // Empty strings fall through to the next source.
        assert_eq!(r.device_id.as_deref(), Some("prop-dev"));

        // Nothing anywhere: defaults.
        let r = normalize_one(
            &feature(json!([1.5, 2.5]), json!({"timestamp": 1_704_067_200})),
            "default",
            None,
        )
        .unwrap();
        assert_eq!(r.user_id, "default");
        assert_eq!(r.device_id, None);

        // A zero identifier on the item falls through like an empty one.
        let it = item(json!({
            "user_id": 0,
            "device_id": 7,
            "geometry": {"coordinates": [1.5, 2.5]},
            "properties": {"timestamp": 1_704_067_200}
        }));
        let r = normalize_one(&it, "default", None).unwrap();
        assert_eq!(r.user_id, "default");
        assert_eq!(r.device_id.as_deref(), Some("7"));
    }

    #[test]
    fn test_passthrough_fields_and_raw_item() {
        let raw = json!({
            "type": "Feature",
            "geometry": {"type": "Point", "coordinates": [-73.5, 40.5]},
            "properties": {
                "timestamp": 1_704_067_200_000_i64,
                "speed": 4.5,
                "battery_state": "charging",
                "motion": ["driving"],
                "battery_level": 0.8,
                "altitude": 12,
                "desired_accuracy": 100,
                "activity": "other_navigation"
            }
        });
        let r = normalize_one(&item(raw.clone()), "u1", Some("d1")).unwrap();

        assert_eq!(r.speed, Some(json!(4.5)));
        assert_eq!(r.battery_state, Some(json!("charging")));
        assert_eq!(r.motion, Some(json!(["driving"])));
        assert_eq!(r.battery_level, Some(json!(0.8)));
        assert_eq!(r.altitude, Some(json!(12)));
        assert_eq!(r.desired_accuracy, Some(json!(100)));
        assert_eq!(r.activity, Some(json!("other_navigation")));
        assert_eq!(r.wifi, None);
        assert_eq!(r.pauses, None);
        assert_eq!(r.raw_item, raw);
    }
}
