//! The wire envelope.
//!
//! Every message on the socket is a JSON object with a `Name` and a flat
//! `Fields` map of strings. This module is purely structural: it knows which
//! names exist and how to get a field out, nothing about what the fields mean.
//! The typed layer lives in [`crate::message`].

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};

/// Every envelope name that may appear on the wire, in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeName {
    SendKey,
    ImportKey,
    RevokeKey,
    RequestKey,
    NotifyGranted,
    Reencrypt,
    NewUpload,
    /// Handshake: the first message a client sends on a new connection.
    Authenticate,
    /// Relay-to-sender rejection notice.
    Error,
}

impl EnvelopeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeName::SendKey => "SendKey",
            EnvelopeName::ImportKey => "ImportKey",
            EnvelopeName::RevokeKey => "RevokeKey",
            EnvelopeName::RequestKey => "RequestKey",
            EnvelopeName::NotifyGranted => "NotifyGranted",
            EnvelopeName::Reencrypt => "Reencrypt",
            EnvelopeName::NewUpload => "NewUpload",
            EnvelopeName::Authenticate => "Authenticate",
            EnvelopeName::Error => "Error",
        }
    }
}

/// A named message with a flat string field map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Name")]
    pub name: EnvelopeName,

    #[serde(rename = "Fields", default, deserialize_with = "null_as_empty")]
    pub fields: BTreeMap<String, String>,
}

impl Envelope {
    /// An envelope with no fields.
    pub fn new(name: EnvelopeName) -> Self {
        Self {
            name,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Insert a field only if a value is present.
    pub fn with_optional_field(self, key: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.with_field(key, value),
            None => self,
        }
    }

    /// Look up a field. Absence is an error; an empty value is not.
    pub fn get_field(&self, key: &str) -> Result<&str> {
        self.fields
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| CoreError::MissingField(key.to_string()))
    }

    /// Look up a field that may legitimately be absent.
    pub fn optional_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::Encode(e.to_string()))
    }

    /// Parse wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Decode(e.to_string()))
    }
}

// Field-less envelopes from some peers carry `"Fields": null`.
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wire_shape() {
        let env = Envelope::new(EnvelopeName::RevokeKey).with_field("to", "alice");
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["Name"], "RevokeKey");
        assert_eq!(json["Fields"]["to"], "alice");
    }

    #[test]
    fn test_decode_foreign_json() {
        let bytes = br#"{"Name":"NotifyGranted","Fields":{"from":"bob","displayName":"Dr. Bob"}}"#;
        let env = Envelope::decode(bytes).unwrap();
        assert_eq!(env.name, EnvelopeName::NotifyGranted);
        assert_eq!(env.get_field("displayName").unwrap(), "Dr. Bob");
    }

    #[test]
    fn test_decode_null_and_missing_fields() {
        let env = Envelope::decode(br#"{"Name":"Reencrypt","Fields":null}"#).unwrap();
        assert!(env.fields.is_empty());
        let env = Envelope::decode(br#"{"Name":"Reencrypt"}"#).unwrap();
        assert!(env.fields.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Envelope::decode(b"not json"), Err(CoreError::Decode(_))));
        assert!(matches!(
            Envelope::decode(br#"{"Name":"Subscribe","Fields":{}}"#),
            Err(CoreError::Decode(_))
        ));
        assert!(matches!(
            Envelope::decode(br#"{"Name":"SendKey","Fields":{"to":5}}"#),
            Err(CoreError::Decode(_))
        ));
    }

    #[test]
    fn test_missing_vs_empty_field() {
        let env = Envelope::new(EnvelopeName::SendKey).with_field("context", "");
        assert_eq!(env.get_field("context").unwrap(), "");
        assert!(matches!(env.get_field("to"), Err(CoreError::MissingField(f)) if f == "to"));
    }

    #[test]
    fn test_optional_field_insertion() {
        let env = Envelope::new(EnvelopeName::SendKey)
            .with_optional_field("context", None::<String>)
            .with_optional_field("to", Some("bob"));
        assert_eq!(env.optional_field("context"), None);
        assert_eq!(env.optional_field("to"), Some("bob"));
    }

    fn arb_name() -> impl Strategy<Value = EnvelopeName> {
        prop_oneof![
            Just(EnvelopeName::SendKey),
            Just(EnvelopeName::ImportKey),
            Just(EnvelopeName::RevokeKey),
            Just(EnvelopeName::RequestKey),
            Just(EnvelopeName::NotifyGranted),
            Just(EnvelopeName::Reencrypt),
            Just(EnvelopeName::NewUpload),
            Just(EnvelopeName::Authenticate),
            Just(EnvelopeName::Error),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            name in arb_name(),
            fields in prop::collection::btree_map("[a-zA-Z]{1,12}", "\\PC{0,64}", 0..8),
        ) {
            let env = Envelope { name, fields };
            let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, env);
        }
    }
}
