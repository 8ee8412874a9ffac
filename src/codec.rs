//! Argument/result codec
//!
//! Values cross the process boundary as JSON. Everything the submitted code
//! can receive or return in structured form is a [`Value`]: null, booleans,
//! numbers, text, ordered sequences, and mappings with unique text keys.
//! The codec rejects anything it could not decode back identically.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SandboxError};
use crate::resources::LimitReport;

pub use serde_json::Value;

/// Deepest nesting accepted on either side of the boundary.
///
/// Kept well below serde_json's own recursion limit so that anything the
/// encoder accepts is guaranteed to decode again.
pub const MAX_DEPTH: usize = 64;

/// Encode a single value
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    check_depth(value)?;
    Ok(serde_json::to_vec(value)?)
}

/// Decode a single value
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(bytes)?;
    check_depth(&value)?;
    Ok(value)
}

/// Encode one of the runner wire messages
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode one of the runner wire messages
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Reject values nested deeper than [`MAX_DEPTH`]
pub fn check_depth(value: &Value) -> Result<()> {
    let mut stack = vec![(value, 1usize)];

    while let Some((value, depth)) = stack.pop() {
        if depth > MAX_DEPTH {
            return Err(SandboxError::Encoding(format!(
                "value nests deeper than {} levels",
                MAX_DEPTH
            )));
        }

        match value {
            Value::Array(items) => stack.extend(items.iter().map(|v| (v, depth + 1))),
            Value::Object(map) => stack.extend(map.values().map(|v| (v, depth + 1))),
            _ => {}
        }
    }

    Ok(())
}

/// What the supervisor hands to the runner on stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerRequest {
    pub code: String,
    /// Positional arguments for the entry point
    pub arguments: Vec<Value>,
}

impl RunnerRequest {
    /// Validate every argument and encode the request
    pub fn encode(code: &str, arguments: &[Value]) -> Result<Vec<u8>> {
        for argument in arguments {
            check_depth(argument)?;
        }

        encode_message(&RunnerRequest {
            code: code.to_string(),
            arguments: arguments.to_vec(),
        })
    }
}

/// Exception raised by the submitted code, reduced to one line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerFailure {
    pub exception: String,
    pub message: String,
}

impl RunnerFailure {
    /// The single line written to stderr
    pub fn summary(&self) -> String {
        if self.message.is_empty() {
            self.exception.clone()
        } else {
            format!("{}: {}", self.exception, self.message)
        }
    }
}

/// What the runner writes on its result descriptor before exiting
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunnerReport {
    pub limits: LimitReport,
    /// Structured return value, when it is representable as a [`Value`]
    #[serde(default)]
    pub result: Option<Value>,
    /// Set when the return value was dropped for exceeding the output cap
    #[serde(default)]
    pub result_omitted: bool,
    #[serde(default)]
    pub failure: Option<RunnerFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn nested(depth: usize) -> Value {
        let mut value = json!(1);
        for _ in 1..depth {
            value = json!([value]);
        }
        value
    }

    #[test]
    fn test_encode_decode_argument_bundle() {
        let value = json!({"first_name": "Ivan", "last_name": "Petrov", "age": 42, "score": 0.1});
        let bytes = encode(&value).unwrap();
        assert_eq!(decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_depth_limit() {
        assert!(check_depth(&nested(MAX_DEPTH)).is_ok());
        let err = encode(&nested(MAX_DEPTH + 1)).unwrap_err();
        assert!(matches!(err, SandboxError::Encoding(_)));
    }

    #[test]
    fn test_decode_rejects_malformed_bytes() {
        assert!(matches!(
            decode(b"{\"a\": "),
            Err(SandboxError::Encoding(_))
        ));
        assert!(decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_request_rejects_deep_arguments() {
        let result = RunnerRequest::encode("def run(x): return x", &[nested(MAX_DEPTH + 5)]);
        assert!(matches!(result, Err(SandboxError::Encoding(_))));
    }

    #[test]
    fn test_request_message() {
        let bytes = RunnerRequest::encode("def run(x): return x", &[json!({"k": [1, 2]})]).unwrap();
        let request: RunnerRequest = decode_message(&bytes).unwrap();
        assert_eq!(request.code, "def run(x): return x");
        assert_eq!(request.arguments, vec![json!({"k": [1, 2]})]);
    }

    #[test]
    fn test_report_defaults_for_missing_fields() {
        let report: RunnerReport =
            decode_message(br#"{"limits": {"cpu": "enforced", "memory": "unsupported"}}"#).unwrap();
        assert!(report.limits.is_degraded());
        assert!(report.result.is_none());
        assert!(report.failure.is_none());
    }

    #[test]
    fn test_failure_summary() {
        let failure = RunnerFailure {
            exception: "ZeroDivisionError".to_string(),
            message: "division by zero".to_string(),
        };
        assert_eq!(failure.summary(), "ZeroDivisionError: division by zero");

        let bare = RunnerFailure {
            exception: "StopIteration".to_string(),
            message: String::new(),
        };
        assert_eq!(bare.summary(), "StopIteration");
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            any::<u64>().prop_map(|n| json!(n)),
            any::<f64>()
                .prop_filter("finite", |f| f.is_finite())
                .prop_map(|f| json!(f)),
            ".*".prop_map(Value::String),
        ];

        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
                prop::collection::btree_map(".*", inner, 0..8)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(value in arb_value()) {
            let bytes = encode(&value).unwrap();
            prop_assert_eq!(decode(&bytes).unwrap(), value);
        }
    }
}
