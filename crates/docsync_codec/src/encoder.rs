//! CBOR encoder for document values.

use crate::error::{CodecError, CodecResult};
use crate::value::{BlobRef, Number, Value};
use ciborium::value::{Integer, Value as Cbor};

/// CBOR tag for an RFC 3339 date/time string.
pub(crate) const TAG_DATE_TIME: u64 = 0;
/// CBOR tag for an epoch-based date/time.
pub(crate) const TAG_EPOCH: u64 = 1;
/// Dictionary key marking a blob reference.
pub(crate) const BLOB_TYPE_KEY: &str = "@type";
/// Value of [`BLOB_TYPE_KEY`] for blob references.
pub(crate) const BLOB_TYPE: &str = "blob";

/// Encodes a value to CBOR bytes.
///
/// The output is deterministic: dictionary keys are written in sorted
/// order, so equal values always produce equal bytes. This matters
/// because revision ids are derived from body digests.
///
/// # Errors
///
/// Returns [`CodecError::NaNForbidden`] if the value contains NaN.
pub fn to_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let cbor = to_cbor_value(value)?;
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&cbor, &mut buf)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buf)
}

fn to_cbor_value(value: &Value) -> CodecResult<Cbor> {
    Ok(match value {
        Value::Null => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Number(Number::Int(n)) => Cbor::Integer(Integer::from(*n)),
        Value::Number(Number::UInt(n)) => Cbor::Integer(Integer::from(*n)),
        Value::Number(Number::Float(x)) => {
            if x.is_nan() {
                return Err(CodecError::NaNForbidden);
            }
            Cbor::Float(*x)
        }
        Value::String(s) => Cbor::Text(s.clone()),
        Value::Date(d) => Cbor::Tag(TAG_DATE_TIME, Box::new(Cbor::Text(d.to_rfc3339()))),
        Value::Dict(entries) => {
            let mut pairs = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                pairs.push((Cbor::Text(k.clone()), to_cbor_value(v)?));
            }
            Cbor::Map(pairs)
        }
        Value::Array(items) => Cbor::Array(
            items
                .iter()
                .map(to_cbor_value)
                .collect::<CodecResult<Vec<_>>>()?,
        ),
        Value::Blob(blob) => blob_to_cbor(blob),
    })
}

fn blob_to_cbor(blob: &BlobRef) -> Cbor {
    // Sorted key order keeps the encoding deterministic.
    let mut pairs = vec![
        (Cbor::Text(BLOB_TYPE_KEY.into()), Cbor::Text(BLOB_TYPE.into())),
    ];
    if let Some(ct) = &blob.content_type {
        pairs.push((Cbor::Text("content_type".into()), Cbor::Text(ct.clone())));
    }
    pairs.push((Cbor::Text("digest".into()), Cbor::Text(blob.digest.clone())));
    pairs.push((
        Cbor::Text("length".into()),
        Cbor::Integer(Integer::from(blob.length)),
    ));
    Cbor::Map(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_rejected() {
        let result = to_cbor(&Value::from(f64::NAN));
        assert_eq!(result, Err(CodecError::NaNForbidden));
    }

    #[test]
    fn equal_dicts_encode_identically() {
        let a = Value::dict([("b", Value::from(2i64)), ("a", Value::from(1i64))]);
        let b = Value::dict([("a", Value::from(1i64)), ("b", Value::from(2i64))]);
        assert_eq!(to_cbor(&a).unwrap(), to_cbor(&b).unwrap());
    }

    #[test]
    fn small_int_is_one_byte() {
        assert_eq!(to_cbor(&Value::from(5i64)).unwrap(), vec![0x05]);
        assert_eq!(to_cbor(&Value::Null).unwrap(), vec![0xf6]);
    }
}
