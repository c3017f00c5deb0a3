//! [`InputValue`] and the binary payload holding an [`ExtraInput`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::types::ExtraInput;

const FORMAT_V1: u8 = 1;
/// Deepest nesting of lists/maps accepted in either direction.
pub const MAX_DEPTH: usize = 64;

/// A single value inside [`ExtraInput`].
///
/// Serialized externally tagged: the variant index comes first, then its
/// body. Reordering variants changes the stored format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<InputValue>),
    Map(BTreeMap<String, InputValue>),
}

impl InputValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            InputValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            InputValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InputValue::Float(f) => Some(*f),
            InputValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            InputValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for InputValue {
    fn from(v: bool) -> Self {
        InputValue::Bool(v)
    }
}

impl From<i64> for InputValue {
    fn from(v: i64) -> Self {
        InputValue::Int(v)
    }
}

impl From<i32> for InputValue {
    fn from(v: i32) -> Self {
        InputValue::Int(v.into())
    }
}

impl From<f64> for InputValue {
    fn from(v: f64) -> Self {
        InputValue::Float(v)
    }
}

impl From<&str> for InputValue {
    fn from(v: &str) -> Self {
        InputValue::String(v.to_string())
    }
}

impl From<String> for InputValue {
    fn from(v: String) -> Self {
        InputValue::String(v)
    }
}

impl From<Vec<u8>> for InputValue {
    fn from(v: Vec<u8>) -> Self {
        InputValue::Bytes(v)
    }
}

impl From<Vec<InputValue>> for InputValue {
    fn from(v: Vec<InputValue>) -> Self {
        InputValue::List(v)
    }
}

impl From<BTreeMap<String, InputValue>> for InputValue {
    fn from(v: BTreeMap<String, InputValue>) -> Self {
        InputValue::Map(v)
    }
}

impl<T: Into<InputValue>> From<Option<T>> for InputValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(InputValue::Null, Into::into)
    }
}

impl From<serde_json::Value> for InputValue {
    /// JSON numbers that fit in i64 become `Int`, all others `Float`.
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => InputValue::Null,
            Value::Bool(b) => InputValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => InputValue::Int(i),
                None => InputValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => InputValue::String(s),
            Value::Array(items) => InputValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                InputValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u8,
    input: &'a ExtraInput,
}

#[derive(Deserialize)]
struct Envelope {
    version: u8,
    input: ExtraInput,
}

// Caps every length prefix read back from a payload.
const PAYLOAD_LIMIT: usize = 16 * 1024 * 1024;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<PAYLOAD_LIMIT>()
}

/// Serialize an input map into its opaque payload: a versioned envelope
/// encoded with bincode. Maps are ordered, so equal inputs always produce
/// identical bytes.
pub fn encode_input(input: &ExtraInput) -> Result<Vec<u8>> {
    check_depth(input, 1).map_err(SchedulerError::Encoding)?;
    let envelope = EnvelopeRef {
        version: FORMAT_V1,
        input,
    };
    bincode::serde::encode_to_vec(&envelope, config())
        .map_err(|e| SchedulerError::Encoding(format!("input: {e}")))
}

/// Inverse of [`encode_input`].
pub fn decode_input(payload: &[u8]) -> Result<ExtraInput> {
    let (envelope, read): (Envelope, usize) =
        bincode::serde::decode_from_slice(payload, config())
            .map_err(|e| SchedulerError::Decoding(format!("input: {e}")))?;
    if read != payload.len() {
        return Err(SchedulerError::Decoding(format!(
            "{} trailing bytes after input",
            payload.len() - read
        )));
    }
    if envelope.version != FORMAT_V1 {
        return Err(SchedulerError::Decoding(format!(
            "unsupported input format version {}",
            envelope.version
        )));
    }
    check_depth(&envelope.input, 1).map_err(SchedulerError::Decoding)?;
    Ok(envelope.input)
}

fn check_depth(map: &BTreeMap<String, InputValue>, depth: usize) -> std::result::Result<(), String> {
    if depth > MAX_DEPTH {
        return Err(format!("input nested deeper than {MAX_DEPTH}"));
    }
    map.values().try_for_each(|v| check_value_depth(v, depth + 1))
}

fn check_value_depth(value: &InputValue, depth: usize) -> std::result::Result<(), String> {
    match value {
        InputValue::List(items) => {
            if depth > MAX_DEPTH {
                return Err(format!("input nested deeper than {MAX_DEPTH}"));
            }
            items.iter().try_for_each(|v| check_value_depth(v, depth + 1))
        }
        InputValue::Map(map) => check_depth(map, depth),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExtraInput {
        let mut nested = BTreeMap::new();
        nested.insert("retries".to_string(), InputValue::Int(3));
        nested.insert("ratio".to_string(), InputValue::Float(0.25));

        let mut input = ExtraInput::new();
        input.insert("name".into(), "nightly".into());
        input.insert("enabled".into(), true.into());
        input.insert("offset".into(), InputValue::Int(-42));
        input.insert("blob".into(), InputValue::Bytes(vec![0, 255, 7]));
        input.insert("nothing".into(), InputValue::Null);
        input.insert(
            "hosts".into(),
            InputValue::List(vec!["a".into(), "b".into(), InputValue::Int(1)]),
        );
        input.insert("limits".into(), InputValue::Map(nested));
        input
    }

    #[test]
    fn round_trip_all_variants() {
        let input = sample();
        let bytes = encode_input(&input).expect("encode");
        assert_eq!(decode_input(&bytes).expect("decode"), input);
    }

    #[test]
    fn reencoding_is_byte_identical() {
        let bytes = encode_input(&sample()).expect("encode");
        let again = encode_input(&decode_input(&bytes).expect("decode")).expect("encode");
        assert_eq!(bytes, again);
    }

    #[test]
    fn empty_input() {
        let bytes = encode_input(&ExtraInput::new()).expect("encode");
        // version byte, then a zero-length map
        assert_eq!(bytes, vec![FORMAT_V1, 0]);
        assert!(decode_input(&bytes).expect("decode").is_empty());
    }

    #[test]
    fn floats_keep_their_exact_bits() {
        let mut input = ExtraInput::new();
        input.insert("third".into(), InputValue::Float(1.0 / 3.0));
        input.insert("tiny".into(), InputValue::Float(f64::MIN_POSITIVE));
        let decoded = decode_input(&encode_input(&input).expect("encode")).expect("decode");
        assert_eq!(decoded, input);
    }

    #[test]
    fn truncated_payload_is_decoding_error() {
        let bytes = encode_input(&sample()).expect("encode");
        for cut in [0, 1, 3, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                matches!(decode_input(&bytes[..cut]), Err(SchedulerError::Decoding(_))),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn unknown_tag_and_version_rejected() {
        // one entry "k" whose variant index is 99
        let bad_tag = [FORMAT_V1, 1, 1, b'k', 99];
        assert!(matches!(decode_input(&bad_tag), Err(SchedulerError::Decoding(_))));

        let bad_version = [9, 0];
        assert!(matches!(decode_input(&bad_version), Err(SchedulerError::Decoding(_))));
    }

    #[test]
    fn invalid_utf8_key_rejected() {
        let bad_key = [FORMAT_V1, 1, 1, 0xff, 0];
        assert!(matches!(decode_input(&bad_key), Err(SchedulerError::Decoding(_))));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode_input(&sample()).expect("encode");
        bytes.push(0);
        assert!(matches!(decode_input(&bytes), Err(SchedulerError::Decoding(_))));
    }

    #[test]
    fn huge_declared_length_does_not_allocate() {
        // "k" => List claiming u32::MAX items (varint marker 252 + 4 bytes)
        let bytes = [FORMAT_V1, 1, 1, b'k', 6, 252, 255, 255, 255, 255];
        assert!(matches!(decode_input(&bytes), Err(SchedulerError::Decoding(_))));
    }

    #[test]
    fn nesting_limit_enforced() {
        let mut value = InputValue::Null;
        for _ in 0..(MAX_DEPTH + 1) {
            value = InputValue::List(vec![value]);
        }
        let mut input = ExtraInput::new();
        input.insert("deep".into(), value);
        assert!(matches!(encode_input(&input), Err(SchedulerError::Encoding(_))));

        let mut shallow = InputValue::Null;
        for _ in 0..(MAX_DEPTH - 2) {
            shallow = InputValue::List(vec![shallow]);
        }
        let mut input = ExtraInput::new();
        input.insert("ok".into(), shallow);
        let bytes = encode_input(&input).expect("within limit");
        assert_eq!(decode_input(&bytes).expect("decode"), input);
    }

    #[test]
    fn from_json_value() {
        let v: InputValue = serde_json::json!({"n": 1, "f": 1.5, "s": "x", "l": [null, true]}).into();
        let InputValue::Map(map) = v else {
            panic!("expected map");
        };
        assert_eq!(map["n"], InputValue::Int(1));
        assert_eq!(map["f"], InputValue::Float(1.5));
        assert_eq!(map["s"].as_str(), Some("x"));
        assert_eq!(
            map["l"],
            InputValue::List(vec![InputValue::Null, InputValue::Bool(true)])
        );
    }
}
