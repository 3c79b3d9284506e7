use std::fmt;

use error_stack::ResultExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::value::ValueRef;

/// A type-safe wrapper for step input hashes.
///
/// The hash is a SHA-256 of the declared step name plus the canonical
/// JSON serialization of its arguments, and nothing else. Engine-injected
/// identifiers (work ids, attempt counters) are deliberately excluded so
/// that replaying a workflow body reproduces the same hash sequence. A
/// mismatch between a regenerated hash and the journaled one is a
/// determinism violation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct InputsHash(String);

impl InputsHash {
    /// Create an `InputsHash` from a hex-encoded hash string.
    ///
    /// Validates that the string is a valid SHA-256 hash (64 hex characters).
    pub fn new(hash: String) -> error_stack::Result<Self, InputsHashError> {
        error_stack::ensure!(
            hash.len() == 64,
            InputsHashError::InvalidLength {
                expected: 64,
                actual: hash.len(),
            }
        );

        error_stack::ensure!(
            hash.chars().all(|c| c.is_ascii_hexdigit()),
            InputsHashError::InvalidCharacters
        );

        Ok(InputsHash(hash))
    }

    /// Hash a step invocation: the step name and its serialized arguments.
    pub fn from_step(step_name: &str, args: &ValueRef) -> error_stack::Result<Self, InputsHashError> {
        let mut hasher = Sha256::new();
        hasher.update(step_name.as_bytes());
        // Separator so ("ab", "c") and ("a", "bc") hash differently.
        hasher.update([0u8]);

        serde_json::to_writer(&mut hasher, args.as_ref())
            .change_context(InputsHashError::SerializeFailed)?;

        let hash = hex::encode(hasher.finalize());
        Self::new(hash)
    }

    /// Get the inner hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InputsHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for InputsHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when creating an InputsHash.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputsHashError {
    #[error("Invalid inputs hash length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("Invalid inputs hash: contains non-hex characters")]
    InvalidCharacters,
    #[error("Failed to serialize step arguments for hashing")]
    SerializeFailed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_same_inputs_same_hash() {
        let args1 = ValueRef::new(json!({"to": "a@example.com"}));
        let args2 = ValueRef::new(json!({"to": "a@example.com"}));

        let h1 = InputsHash::from_step("send_email", &args1).unwrap();
        let h2 = InputsHash::from_step("send_email", &args2).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.as_str().len(), 64);
    }

    #[test]
    fn test_step_name_is_part_of_the_hash() {
        let args = ValueRef::new(json!({"id": 1}));

        let h1 = InputsHash::from_step("charge", &args).unwrap();
        let h2 = InputsHash::from_step("refund", &args).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_name_argument_boundary() {
        let h1 = InputsHash::from_step("ab", &ValueRef::new(json!("c"))).unwrap();
        let h2 = InputsHash::from_step("a", &ValueRef::new(json!("bc"))).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_validation() {
        assert!(InputsHash::new("a".repeat(64)).is_ok());
        assert!(InputsHash::new("abc".to_string()).is_err());
        assert!(InputsHash::new("g".repeat(64)).is_err());
    }
}
