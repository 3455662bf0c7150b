//! State content and fingerprints for optimistic concurrency

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// MD5 digest of state content
///
/// The same digest is sent as `Content-MD5` when writing, so the storage
/// service records it alongside the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Compute the fingerprint of some content
    pub fn of(data: &[u8]) -> Self {
        Self(Md5::digest(data).into())
    }

    /// Build a fingerprint from raw digest bytes, e.g. a `Content-MD5` header
    pub fn from_digest(bytes: &[u8]) -> Option<Self> {
        <[u8; 16]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Fingerprint {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The serialized state of a workspace as last read from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateContent {
    /// Opaque state payload
    pub data: Bytes,
    /// Fingerprint to pass back when writing an update of this content
    pub fingerprint: Fingerprint,
}

impl StateContent {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let fingerprint = Fingerprint::of(&data);
        Self { data, fingerprint }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = Fingerprint::of(b"{\"serial\": 1}");
        let b = Fingerprint::of(b"{\"serial\": 1}");
        let c = Fingerprint::of(b"{\"serial\": 2}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_known_digest() {
        // MD5 of the empty string
        assert_eq!(
            Fingerprint::of(b"").to_string(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn test_fingerprint_parse() {
        let fingerprint = Fingerprint::of(b"state");
        let parsed: Fingerprint = fingerprint.to_string().parse().unwrap();
        assert_eq!(parsed, fingerprint);
        assert!("not-hex".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_fingerprint_from_digest() {
        let fingerprint = Fingerprint::of(b"state");
        assert_eq!(
            Fingerprint::from_digest(fingerprint.as_bytes()),
            Some(fingerprint)
        );
        assert_eq!(Fingerprint::from_digest(&[1, 2, 3]), None);
    }

    #[test]
    fn test_state_content_new() {
        let content = StateContent::new(&b"v1"[..]);
        assert_eq!(content.len(), 2);
        assert!(!content.is_empty());
        assert_eq!(content.fingerprint, Fingerprint::of(b"v1"));
    }
}
