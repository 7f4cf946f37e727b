//! CBOR decoder for document values.

use crate::encoder::{BLOB_TYPE, BLOB_TYPE_KEY, TAG_DATE_TIME, TAG_EPOCH};
use crate::error::{CodecError, CodecResult};
use crate::value::{BlobRef, Number, Value};
use chrono::{DateTime, Utc};
use ciborium::value::Value as Cbor;
use std::collections::BTreeMap;

/// Decodes CBOR bytes into a document value.
///
/// # Errors
///
/// Returns an error if the bytes are not valid CBOR, if a map has a
/// non-text key, or if the input contains items with no document
/// counterpart (byte strings, unknown tags).
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let cbor: Cbor = ciborium::de::from_reader(bytes)
        .map_err(|e| CodecError::decoding_failed(e.to_string()))?;
    from_cbor_value(cbor)
}

fn from_cbor_value(cbor: Cbor) -> CodecResult<Value> {
    match cbor {
        Cbor::Null => Ok(Value::Null),
        Cbor::Bool(b) => Ok(Value::Bool(b)),
        Cbor::Integer(int) => {
            let wide = i128::from(int);
            if let Ok(n) = i64::try_from(wide) {
                Ok(Value::Number(Number::Int(n)))
            } else if let Ok(n) = u64::try_from(wide) {
                Ok(Value::Number(Number::UInt(n)))
            } else {
                Err(CodecError::invalid_structure("integer out of range"))
            }
        }
        Cbor::Float(x) => {
            if x.is_nan() {
                return Err(CodecError::NaNForbidden);
            }
            Ok(Value::Number(Number::Float(x)))
        }
        Cbor::Text(s) => Ok(Value::String(s)),
        Cbor::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(from_cbor_value)
                .collect::<CodecResult<Vec<_>>>()?,
        )),
        Cbor::Map(pairs) => decode_map(pairs),
        Cbor::Tag(tag, inner) => decode_tag(tag, *inner),
        Cbor::Bytes(_) => Err(CodecError::unsupported_type("byte string")),
        _ => Err(CodecError::unsupported_type("unknown CBOR item")),
    }
}

fn decode_map(pairs: Vec<(Cbor, Cbor)>) -> CodecResult<Value> {
    let mut dict = BTreeMap::new();
    for (k, v) in pairs {
        let key = match k {
            Cbor::Text(s) => s,
            _ => return Err(CodecError::invalid_structure("dictionary keys must be text")),
        };
        dict.insert(key, from_cbor_value(v)?);
    }

    if dict.get(BLOB_TYPE_KEY).and_then(Value::as_str) == Some(BLOB_TYPE) {
        return decode_blob(&dict);
    }

    Ok(Value::Dict(dict))
}

fn decode_blob(dict: &BTreeMap<String, Value>) -> CodecResult<Value> {
    let digest = dict
        .get("digest")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::invalid_structure("blob without digest"))?;
    let length = dict
        .get("length")
        .and_then(Value::as_number)
        .and_then(|n| match n {
            Number::Int(i) => u64::try_from(i).ok(),
            Number::UInt(u) => Some(u),
            Number::Float(_) => None,
        })
        .ok_or_else(|| CodecError::invalid_structure("blob without length"))?;

    let mut blob = BlobRef::new(digest, length);
    if let Some(ct) = dict.get("content_type").and_then(Value::as_str) {
        blob = blob.with_content_type(ct);
    }
    Ok(Value::Blob(blob))
}

fn decode_tag(tag: u64, inner: Cbor) -> CodecResult<Value> {
    match (tag, inner) {
        (TAG_DATE_TIME, Cbor::Text(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|d| Value::Date(d.with_timezone(&Utc)))
            .map_err(|e| CodecError::invalid_structure(format!("bad date: {e}"))),
        (TAG_EPOCH, Cbor::Integer(int)) => {
            let secs = i64::try_from(i128::from(int))
                .map_err(|_| CodecError::invalid_structure("epoch out of range"))?;
            DateTime::from_timestamp(secs, 0)
                .map(Value::Date)
                .ok_or_else(|| CodecError::invalid_structure("epoch out of range"))
        }
        (tag, _) => Err(CodecError::unsupported_type(format!("tag {tag}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::to_cbor;
    use chrono::TimeZone;

    #[test]
    fn document_roundtrip() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let value = Value::dict([
            ("title", Value::from("notes")),
            ("count", Value::from(3i64)),
            ("ratio", Value::from(0.5)),
            ("created", Value::Date(date)),
            ("tags", Value::from(vec!["a", "b"])),
            ("photo", Value::Blob(BlobRef::new("sha256-xyz", 2048))),
            ("archived", Value::Null),
        ]);

        let bytes = to_cbor(&value).unwrap();
        assert_eq!(from_cbor(&bytes).unwrap(), value);
    }

    #[test]
    fn byte_strings_are_unsupported() {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&Cbor::Bytes(vec![1, 2]), &mut buf).unwrap();
        assert!(matches!(
            from_cbor(&buf),
            Err(CodecError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn non_text_keys_are_rejected() {
        let mut buf = Vec::new();
        let map = Cbor::Map(vec![(Cbor::Integer(1.into()), Cbor::Null)]);
        ciborium::ser::into_writer(&map, &mut buf).unwrap();
        assert!(matches!(
            from_cbor(&buf),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            from_cbor(&[0xff, 0x00, 0x13]),
            Err(CodecError::DecodingFailed { .. })
        ));
    }

    #[test]
    fn epoch_tag_decodes_to_date() {
        let mut buf = Vec::new();
        let tagged = Cbor::Tag(TAG_EPOCH, Box::new(Cbor::Integer(0.into())));
        ciborium::ser::into_writer(&tagged, &mut buf).unwrap();
        let value = from_cbor(&buf).unwrap();
        assert_eq!(value.as_date().map(|d| d.timestamp()), Some(0));
    }
}
