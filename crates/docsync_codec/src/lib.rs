//! # docsync Codec
//!
//! Document value type and deterministic CBOR encoding for docsync.
//!
//! Document bodies are trees of [`Value`]. The encoder writes them as
//! CBOR with dictionary keys in sorted order, so equal bodies always
//! produce equal bytes and hash to the same revision digest.
//!
//! ## Usage
//!
//! ```
//! use docsync_codec::{from_cbor, to_cbor, Value};
//!
//! let body = Value::dict([("title", Value::from("groceries"))]);
//! let bytes = to_cbor(&body).unwrap();
//! assert_eq!(from_cbor(&bytes).unwrap(), body);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod value;

pub use decoder::from_cbor;
pub use encoder::to_cbor;
pub use error::{CodecError, CodecResult};
pub use value::{BlobRef, Number, Value};

use serde::{de::DeserializeOwned, Serialize};

/// Serializes any serde type to CBOR bytes.
///
/// Used for protocol frames and bookkeeping records, which are plain
/// Rust structs rather than document bodies.
pub fn to_bytes<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buf)
}

/// Deserializes a serde type from CBOR bytes.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}
