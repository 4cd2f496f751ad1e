//! Capability token types

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

/// Opaque, serializable proof of access to one filesystem location.
///
/// Serialized as a base64 string.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CapabilityToken(Vec<u8>);

impl CapabilityToken {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityToken({} bytes)", self.0.len())
    }
}

impl Serialize for CapabilityToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for CapabilityToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Outcome of resolving a token back into a location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedToken {
    pub path: PathBuf,
    /// The location still resolves but no longer matches what was granted
    pub is_stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_serializes_as_base64() {
        let token = CapabilityToken::from_bytes(b"grant".to_vec());
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, "\"Z3JhbnQ=\"");

        let back: CapabilityToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let result: std::result::Result<CapabilityToken, _> = serde_json::from_str("\"%%%\"");
        assert!(result.is_err());
    }
}
