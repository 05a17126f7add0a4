//! Versioned device configuration document

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Device configuration with an embedded version counter
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    /// Bumped once per committed change
    #[serde(default)]
    pub version: u64,

    /// Configuration content
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Set a top-level key, returning the previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.payload.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.payload.remove(key)
    }

    /// Canonical serialized form
    ///
    /// Object keys come out sorted, so equal content always yields equal
    /// bytes regardless of insertion order.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&serde_json::to_value(self)?)
    }

    /// Hex SHA-256 of the canonical form
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes()?);
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_ignores_key_order() {
        let mut a = ConfigDocument::new();
        a.set("hosts", json!(["mydomain.adam"]));
        a.set("api_v1", true);

        let mut b = ConfigDocument::new();
        b.set("api_v1", true);
        b.set("hosts", json!(["mydomain.adam"]));

        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
        assert_eq!(a.content_hash().unwrap().len(), 64);
    }

    #[test]
    fn test_hash_tracks_content_and_version() {
        let mut doc = ConfigDocument::new().with_version(5);
        doc.set("server", "mydomain.adam:3333");
        let h1 = doc.content_hash().unwrap();

        doc.set("server", "mydomain.adam:4444");
        let h2 = doc.content_hash().unwrap();
        assert_ne!(h1, h2);

        doc.version += 1;
        assert_ne!(h2, doc.content_hash().unwrap());
    }

    #[test]
    fn test_parse_without_version() {
        let doc: ConfigDocument = serde_json::from_str(r#"{"payload": {"a": 1}}"#).unwrap();
        assert_eq!(doc.version, 0);
        assert_eq!(doc.get("a"), Some(&json!(1)));
    }
}
