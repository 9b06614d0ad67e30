//! Inbound payload decoding.
//!
//! A [`Payload`] is a decoded JSON object with typed, optional lookups by
//! dotted path (`"tnk.time"`). Lookups distinguish three cases: the field is
//! absent (`Ok(None)`), present with the expected type (`Ok(Some(_))`), or
//! present with the wrong type (`Err(FieldError)`). An explicit JSON `null`
//! counts as absent.

use serde_json::{Map, Value};
use thiserror::Error;

/// Upper bound on an inbound command payload.
pub const MAX_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit")]
    TooLarge(usize),
    #[error("{0}")]
    Malformed(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("field `{path}` must be {expected}")]
    WrongType {
        path: String,
        expected: &'static str,
    },
    #[error("field `{path}` is out of range")]
    OutOfRange { path: String },
}

impl FieldError {
    fn wrong_type(path: &str, expected: &'static str) -> Self {
        Self::WrongType {
            path: path.to_string(),
            expected,
        }
    }

    pub(crate) fn out_of_range(path: &str) -> Self {
        Self::OutOfRange {
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    root: Map<String, Value>,
}

impl Payload {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() > MAX_PAYLOAD_BYTES {
            return Err(DecodeError::TooLarge(bytes.len()));
        }
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(root)) => Ok(Self { root }),
            Ok(_) => Err(DecodeError::NotAnObject),
            Err(e) => Err(DecodeError::Malformed(e.to_string())),
        }
    }

    /// True when the path resolves to a non-null value.
    pub fn contains(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Numbers that do not fit a finite `f32` are out of range.
    pub fn f32(&self, path: &str) -> Result<Option<f32>, FieldError> {
        self.lookup(path)
            .map(|v| {
                let n = v
                    .as_f64()
                    .ok_or_else(|| FieldError::wrong_type(path, "a number"))?
                    as f32;
                if n.is_finite() {
                    Ok(n)
                } else {
                    Err(FieldError::out_of_range(path))
                }
            })
            .transpose()
    }

    pub fn i64(&self, path: &str) -> Result<Option<i64>, FieldError> {
        self.lookup(path)
            .map(|v| {
                v.as_i64()
                    .ok_or_else(|| FieldError::wrong_type(path, "an integer"))
            })
            .transpose()
    }

    pub fn u32(&self, path: &str) -> Result<Option<u32>, FieldError> {
        self.i64(path)?
            .map(|n| u32::try_from(n).map_err(|_| FieldError::out_of_range(path)))
            .transpose()
    }

    pub fn i32(&self, path: &str) -> Result<Option<i32>, FieldError> {
        self.i64(path)?
            .map(|n| i32::try_from(n).map_err(|_| FieldError::out_of_range(path)))
            .transpose()
    }

    pub fn bool(&self, path: &str) -> Result<Option<bool>, FieldError> {
        self.lookup(path)
            .map(|v| {
                v.as_bool()
                    .ok_or_else(|| FieldError::wrong_type(path, "a boolean"))
            })
            .transpose()
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.root.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        (!current.is_null()).then_some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(json: &str) -> Payload {
        Payload::decode(json.as_bytes()).unwrap()
    }

    // -- decode --------------------------------------------------------------

    #[test]
    fn decode_object() {
        let p = decode(r#"{"tv": 2.5}"#);
        assert!(p.contains("tv"));
    }

    #[test]
    fn decode_malformed_reports_cause() {
        let err = Payload::decode(br#"{"tv": "#).unwrap_err();
        match err {
            DecodeError::Malformed(cause) => assert!(!cause.is_empty()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn decode_empty_is_malformed() {
        assert!(matches!(
            Payload::decode(b""),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn decode_array_is_not_an_object() {
        assert_eq!(Payload::decode(b"[1,2]"), Err(DecodeError::NotAnObject));
    }

    #[test]
    fn decode_oversized_rejected() {
        let big = format!(r#"{{"m":"{}"}}"#, "x".repeat(MAX_PAYLOAD_BYTES));
        assert!(matches!(
            Payload::decode(big.as_bytes()),
            Err(DecodeError::TooLarge(_))
        ));
    }

    // -- lookups -------------------------------------------------------------

    #[test]
    fn absent_field_is_none() {
        let p = decode("{}");
        assert_eq!(p.f32("tv"), Ok(None));
        assert_eq!(p.bool("wifi"), Ok(None));
        assert!(!p.contains("tv"));
    }

    #[test]
    fn null_field_is_absent() {
        let p = decode(r#"{"tv": null}"#);
        assert!(!p.contains("tv"));
        assert_eq!(p.f32("tv"), Ok(None));
    }

    #[test]
    fn float_overflowing_f32_is_out_of_range() {
        let p = decode(r#"{"tv": 1e39, "tp": -1e300}"#);
        assert_eq!(p.f32("tv"), Err(FieldError::out_of_range("tv")));
        assert_eq!(p.f32("tp"), Err(FieldError::out_of_range("tp")));
    }

    #[test]
    fn integer_accepted_as_float() {
        let p = decode(r#"{"tv": 3}"#);
        assert_eq!(p.f32("tv"), Ok(Some(3.0)));
    }

    #[test]
    fn wrong_type_names_the_path() {
        let p = decode(r#"{"tnk": {"time": "soon"}}"#);
        let err = p.u32("tnk.time").unwrap_err();
        assert_eq!(err.to_string(), "field `tnk.time` must be an integer");
    }

    #[test]
    fn float_is_not_an_integer() {
        let p = decode(r#"{"tt": 1.5}"#);
        assert!(matches!(p.i64("tt"), Err(FieldError::WrongType { .. })));
    }

    #[test]
    fn negative_u32_is_out_of_range() {
        let p = decode(r#"{"srvc": {"res": -1}}"#);
        assert_eq!(
            p.u32("srvc.res"),
            Err(FieldError::OutOfRange {
                path: "srvc.res".into()
            })
        );
    }

    #[test]
    fn nested_lookup_through_non_object_is_absent() {
        let p = decode(r#"{"tnk": 5}"#);
        assert_eq!(p.u32("tnk.time"), Ok(None));
    }

    #[test]
    fn bool_lookup() {
        let p = decode(r#"{"wifi": true, "mqtt": 1}"#);
        assert_eq!(p.bool("wifi"), Ok(Some(true)));
        assert!(p.bool("mqtt").is_err());
    }
}
