use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Upper bound, in serialized bytes, for any payload or result crossing
/// an enqueue or step boundary. Exceeding it is a caller-visible error,
/// never a silent truncation.
pub const MAX_PAYLOAD_BYTES: usize = 1 << 20;

/// A JSON value passed to or produced by a task.
///
/// Wraps the value in an `Arc` so payloads can be cloned cheaply as they
/// move between the store, the scheduler, and callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ValueRef(Arc<serde_json::Value>);

impl<T: Into<serde_json::Value>> From<T> for ValueRef {
    fn from(value: T) -> Self {
        Self::new(value.into())
    }
}

impl ValueRef {
    pub fn new(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn null() -> Self {
        Self::new(serde_json::Value::Null)
    }

    /// Size of the canonical JSON serialization, in bytes.
    ///
    /// Used for the [`MAX_PAYLOAD_BYTES`] boundary check.
    pub fn serialized_size(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self.0.as_ref()).map(|bytes| bytes.len())
    }
}

impl AsRef<serde_json::Value> for ValueRef {
    fn as_ref(&self) -> &serde_json::Value {
        &self.0
    }
}

impl Default for ValueRef {
    fn default() -> Self {
        Self::null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_ref_round_trip() {
        let value = ValueRef::new(json!({"message": "hello", "count": 3}));
        let encoded = serde_json::to_string(&value).unwrap();
        let decoded: ValueRef = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_serialized_size() {
        let value = ValueRef::new(json!("abc"));
        // "abc" with quotes
        assert_eq!(value.serialized_size().unwrap(), 5);
    }
}
