//! Conversion between wire rows and [`SyncRecord`].
//!
//! Decoding is where inbound data is normalised: fields unknown to the
//! descriptor are dropped, timestamps are parsed leniently and re-rendered,
//! booleans accept the usual textual spellings, base64 payloads are validated
//! and placeholder serial numbers become null. Both sides of the protocol run
//! every inbound row through [`decode_record`].

use crate::{
    error::Result,
    protocol::WireRecord,
    schema::{EntityDescriptor, FieldDef, FieldType},
    timestamp, Error, SyncRecord,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// Values that mean "no serial number" in legacy data.
pub const PLACEHOLDERS: &[&str] = &[
    "N.P.",
    "NP",
    "N/A",
    "NA",
    "NON PRESENTE",
    "-",
    "SENZA SN",
    "NO SN",
    "MANCA SN",
    "N/D",
    "MANCANTE",
    "ND",
];

/// Columns that exist only in the local store and are silently discarded.
const LOCAL_ONLY: &[&str] = &["id", "is_synced"];

/// A decoded row plus what normalisation had to throw away.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub record: SyncRecord,
    /// Wire fields the table does not declare
    pub dropped_fields: Vec<String>,
    /// Declared fields whose value was unreadable and stored as null
    pub nulled_fields: Vec<String>,
}

/// Whether `text` is blank or a known placeholder.
pub fn is_placeholder(text: &str) -> bool {
    let text = text.trim();
    text.is_empty() || PLACEHOLDERS.iter().any(|p| p.eq_ignore_ascii_case(text))
}

/// Lenient boolean reading: `true/false`, numbers, and
/// `1/0/true/false/t/f/yes/no/y/n` (empty text is false).
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n
            .as_i64()
            .map(|i| i != 0)
            .or_else(|| n.as_f64().map(|f| f != 0.0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "yes" | "y" => Some(true),
            "0" | "false" | "f" | "no" | "n" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Decode and normalise one inbound wire row.
pub fn decode_record(entity: &EntityDescriptor, mut raw: WireRecord) -> Result<Decoded> {
    let last_modified = match raw.remove("last_modified") {
        Some(Value::String(text)) => timestamp::parse(&text)?,
        Some(other) => return Err(Error::InvalidTimestamp(other.to_string())),
        None => return Err(Error::InvalidTimestamp("missing last_modified".into())),
    };

    let is_deleted = match raw.remove("is_deleted") {
        None | Some(Value::Null) => false,
        Some(value) => coerce_bool(&value)
            .ok_or_else(|| type_mismatch("is_deleted", FieldType::Bool, &value))?,
    } && entity.tombstones;

    let base_last_modified = match raw.remove("base_last_modified") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(timestamp::parse(&text)?),
        Some(other) => return Err(Error::InvalidTimestamp(other.to_string())),
    };

    let parent = match &entity.parent {
        Some(parent_ref) => {
            raw.remove(&parent_ref.column);
            match raw.remove(&parent_ref.uuid_field) {
                Some(Value::String(text)) if !text.trim().is_empty() => {
                    Some(text.trim().to_string())
                }
                None | Some(Value::Null) | Some(Value::String(_)) => None,
                Some(other) => {
                    return Err(type_mismatch(
                        &parent_ref.uuid_field,
                        FieldType::String,
                        &other,
                    ))
                }
            }
        }
        None => None,
    };

    let mut fields = BTreeMap::new();
    let mut nulled_fields = Vec::new();
    for def in &entity.fields {
        let value = raw.remove(&def.name).unwrap_or(Value::Null);
        match normalize_field(def, value)? {
            Some(value) => {
                fields.insert(def.name.clone(), value);
            }
            None => {
                nulled_fields.push(def.name.clone());
                fields.insert(def.name.clone(), Value::Null);
            }
        }
    }

    let derived = entity
        .identity_field
        .as_deref()
        .and_then(|name| fields.get(name))
        .and_then(|value| entity.derive_uuid(value));
    let uuid = match (derived, raw.remove("uuid")) {
        (Some(uuid), _) => uuid,
        (None, Some(Value::String(text))) if !text.trim().is_empty() => text.trim().to_string(),
        _ => return Err(Error::MissingUuid),
    };

    if entity.parent.is_some() && parent.is_none() {
        return Err(Error::MissingParentRef(entity.name.clone()));
    }

    if !is_deleted {
        if let Some(missing) = entity
            .fields
            .iter()
            .find(|def| def.required && fields.get(&def.name).map_or(true, Value::is_null))
        {
            return Err(Error::MissingRequiredField(missing.name.clone()));
        }
    }

    for column in LOCAL_ONLY {
        raw.remove(*column);
    }
    let dropped_fields = raw.keys().cloned().collect();

    Ok(Decoded {
        record: SyncRecord {
            uuid,
            last_modified,
            is_deleted,
            parent,
            base_last_modified,
            fields,
        },
        dropped_fields,
        nulled_fields,
    })
}

/// Render a record as a wire row for `entity`.
pub fn encode_record(entity: &EntityDescriptor, record: &SyncRecord) -> WireRecord {
    let mut wire = WireRecord::new();
    wire.insert("uuid".into(), Value::String(record.uuid.clone()));
    wire.insert(
        "last_modified".into(),
        Value::String(timestamp::format(&record.last_modified)),
    );
    if entity.tombstones {
        wire.insert("is_deleted".into(), Value::Bool(record.is_deleted));
    }
    if let Some(parent_ref) = &entity.parent {
        let parent = record
            .parent
            .as_ref()
            .map(|uuid| Value::String(uuid.clone()))
            .unwrap_or(Value::Null);
        wire.insert(parent_ref.uuid_field.clone(), parent);
    }
    if let Some(base) = &record.base_last_modified {
        wire.insert(
            "base_last_modified".into(),
            Value::String(timestamp::format(base)),
        );
    }
    for def in &entity.fields {
        wire.insert(def.name.clone(), record.field(&def.name).clone());
    }
    wire
}

/// Normalise one declared field. `Ok(None)` means the value was unreadable
/// but not fatal to the row.
fn normalize_field(def: &FieldDef, value: Value) -> Result<Option<Value>> {
    if value.is_null() {
        return Ok(Some(Value::Null));
    }

    let normalized = match def.field_type {
        FieldType::String => match value {
            Value::String(text) if def.placeholder_null && is_placeholder(&text) => Value::Null,
            Value::String(text) => Value::String(text),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            other => return Err(type_mismatch(&def.name, def.field_type, &other)),
        },
        FieldType::Int => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Value::Number(n),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Value::Number(Number::from(f as i64)),
                _ => return Err(type_mismatch(&def.name, def.field_type, &Value::Number(n))),
            },
            Value::String(text) if text.trim().is_empty() => Value::Null,
            Value::String(text) => match text.trim().parse::<i64>() {
                Ok(i) => Value::Number(Number::from(i)),
                Err(_) => {
                    return Err(type_mismatch(&def.name, def.field_type, &Value::String(text)))
                }
            },
            Value::Bool(b) => Value::Number(Number::from(i64::from(b))),
            other => return Err(type_mismatch(&def.name, def.field_type, &other)),
        },
        FieldType::Float => {
            let parsed = match &value {
                Value::Number(n) => n.as_f64(),
                Value::String(text) if text.trim().is_empty() => return Ok(Some(Value::Null)),
                Value::String(text) => text.trim().parse::<f64>().ok(),
                _ => None,
            };
            match parsed.and_then(Number::from_f64) {
                Some(n) => Value::Number(n),
                None => return Err(type_mismatch(&def.name, def.field_type, &value)),
            }
        }
        FieldType::Bool => match coerce_bool(&value) {
            Some(b) => Value::Bool(b),
            None => return Err(type_mismatch(&def.name, def.field_type, &value)),
        },
        FieldType::Timestamp => match value {
            Value::String(text) if text.trim().is_empty() => Value::Null,
            Value::String(text) => Value::String(timestamp::format(&timestamp::parse(&text)?)),
            other => return Err(type_mismatch(&def.name, def.field_type, &other)),
        },
        FieldType::Bytes => match value {
            Value::String(text) if text.trim().is_empty() => Value::Null,
            Value::String(text) => match STANDARD.decode(text.trim()) {
                Ok(bytes) => Value::String(STANDARD.encode(bytes)),
                Err(_) => return Ok(None),
            },
            other => return Err(type_mismatch(&def.name, def.field_type, &other)),
        },
        FieldType::Json => match value {
            Value::String(text) if text.trim().is_empty() => Value::Null,
            Value::String(text) => match serde_json::from_str::<Value>(&text) {
                Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
                _ => Value::String(text),
            },
            other => other,
        },
    };

    Ok(Some(normalized))
}

fn type_mismatch(field: &str, expected: FieldType, got: &Value) -> Error {
    Error::TypeMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        got: json_type_name(got).to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Schema;
    use serde_json::json;

    fn wire(value: Value) -> WireRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("wire rows are objects"),
        }
    }

    fn decode(table: &str, value: Value) -> Result<Decoded> {
        let schema = Schema::standard();
        decode_record(schema.entity(table).unwrap(), wire(value))
    }

    #[test]
    fn drops_unknown_and_local_columns() {
        let decoded = decode(
            "customers",
            json!({
                "id": 7,
                "is_synced": 0,
                "uuid": "c-1",
                "last_modified": "2024-01-31 10:00:00",
                "name": "ACME",
                "fax": "0123",
            }),
        )
        .unwrap();

        assert_eq!(decoded.dropped_fields, vec!["fax".to_string()]);
        assert_eq!(decoded.record.field("name"), &json!("ACME"));
        assert_eq!(decoded.record.field("phone"), &Value::Null);
        assert_eq!(
            timestamp::format(&decoded.record.last_modified),
            "2024-01-31T10:00:00.000000Z"
        );
    }

    #[test]
    fn placeholder_serials_become_null() {
        for serial in ["N/A", " np ", "", "Senza SN", "-"] {
            let decoded = decode(
                "devices",
                json!({
                    "uuid": "d-1",
                    "last_modified": "2024-01-31T10:00:00Z",
                    "destination_uuid": "s-1",
                    "serial_number": serial,
                }),
            )
            .unwrap();
            assert_eq!(decoded.record.field("serial_number"), &Value::Null, "{serial}");
        }

        let decoded = decode(
            "devices",
            json!({
                "uuid": "d-1",
                "last_modified": "2024-01-31T10:00:00Z",
                "destination_uuid": "s-1",
                "serial_number": "SN-42",
            }),
        )
        .unwrap();
        assert_eq!(decoded.record.field("serial_number"), &json!("SN-42"));
    }

    #[test]
    fn lenient_booleans() {
        for (input, expected) in [
            (json!(1), true),
            (json!("yes"), true),
            (json!("T"), true),
            (json!(0), false),
            (json!("n"), false),
            (json!(""), false),
        ] {
            let decoded = decode(
                "mti_instruments",
                json!({
                    "uuid": "i-1",
                    "last_modified": "2024-01-31T10:00:00Z",
                    "instrument_name": "ESA615",
                    "is_default": input,
                    "is_deleted": "0",
                }),
            )
            .unwrap();
            assert_eq!(decoded.record.field("is_default"), &json!(expected));
            assert!(!decoded.record.is_deleted);
        }

        let err = decode(
            "mti_instruments",
            json!({
                "uuid": "i-1",
                "last_modified": "2024-01-31T10:00:00Z",
                "instrument_name": "ESA615",
                "is_default": "maybe",
            }),
        );
        assert!(matches!(err, Err(Error::TypeMismatch { field, .. }) if field == "is_default"));
    }

    #[test]
    fn invalid_base64_is_nulled_not_fatal() {
        let decoded = decode(
            "signatures",
            json!({
                "last_modified": "2024-01-31T10:00:00Z",
                "username": "mrossi",
                "signature_data": "%%% not base64 %%%",
            }),
        )
        .unwrap();

        assert_eq!(decoded.nulled_fields, vec!["signature_data".to_string()]);
        assert_eq!(decoded.record.field("signature_data"), &Value::Null);
    }

    #[test]
    fn signature_uuid_is_derived_from_username() {
        let schema = Schema::standard();
        let signatures = schema.entity("signatures").unwrap();

        let decoded = decode(
            "signatures",
            json!({
                "uuid": "random-client-uuid",
                "last_modified": "2024-01-31T10:00:00Z",
                "username": "mrossi",
                "signature_data": "aGVsbG8=",
                "is_deleted": true,
            }),
        )
        .unwrap();

        assert_eq!(
            Some(decoded.record.uuid.clone()),
            signatures.derive_uuid(&json!("mrossi"))
        );
        assert!(!decoded.record.is_deleted);
        assert_eq!(decoded.record.field("signature_data"), &json!("aGVsbG8="));
    }

    #[test]
    fn legacy_json_text_is_parsed() {
        let decoded = decode(
            "devices",
            json!({
                "uuid": "d-1",
                "last_modified": "2024-01-31T10:00:00Z",
                "destination_uuid": "s-1",
                "applied_parts_json": "[{\"name\": \"ECG\", \"code\": \"CF\"}]",
                "verification_interval": "12",
            }),
        )
        .unwrap();

        assert_eq!(
            decoded.record.field("applied_parts_json"),
            &json!([{"name": "ECG", "code": "CF"}])
        );
        assert_eq!(decoded.record.field("verification_interval"), &json!(12));
    }

    #[test]
    fn rejects_rows_without_identity_or_time() {
        let missing_uuid = decode(
            "customers",
            json!({"last_modified": "2024-01-31T10:00:00Z", "name": "ACME"}),
        );
        assert!(matches!(missing_uuid, Err(Error::MissingUuid)));

        let bad_time = decode(
            "customers",
            json!({"uuid": "c-1", "last_modified": "soon", "name": "ACME"}),
        );
        assert!(matches!(bad_time, Err(Error::InvalidTimestamp(_))));
    }

    #[test]
    fn required_fields_only_bind_live_rows() {
        let live = decode(
            "customers",
            json!({"uuid": "c-1", "last_modified": "2024-01-31T10:00:00Z"}),
        );
        assert!(matches!(live, Err(Error::MissingRequiredField(f)) if f == "name"));

        let tombstone = decode(
            "customers",
            json!({"uuid": "c-1", "last_modified": "2024-01-31T10:00:00Z", "is_deleted": 1}),
        )
        .unwrap();
        assert!(tombstone.record.is_deleted);
    }

    #[test]
    fn child_rows_need_a_parent_reference() {
        let orphan = decode(
            "destinations",
            json!({"uuid": "s-1", "last_modified": "2024-01-31T10:00:00Z", "name": "Lab"}),
        );
        assert!(matches!(orphan, Err(Error::MissingParentRef(t)) if t == "destinations"));
    }

    #[test]
    fn encode_then_decode_preserves_content() {
        let schema = Schema::standard();
        let devices = schema.entity("devices").unwrap();
        let original = decode(
            "devices",
            json!({
                "uuid": "d-1",
                "last_modified": "2024-01-31T10:00:00Z",
                "destination_uuid": "s-1",
                "serial_number": "SN-42",
                "verification_interval": 24,
                "base_last_modified": "2024-01-30T10:00:00Z",
            }),
        )
        .unwrap()
        .record;

        let wire = encode_record(devices, &original);
        assert_eq!(wire["destination_uuid"], json!("s-1"));
        assert_eq!(wire["is_deleted"], json!(false));
        assert_eq!(wire["base_last_modified"], json!("2024-01-30T10:00:00.000000Z"));

        let decoded = decode_record(devices, wire).unwrap();
        assert_eq!(decoded.record, original);
        assert!(decoded.dropped_fields.is_empty());
    }
}
