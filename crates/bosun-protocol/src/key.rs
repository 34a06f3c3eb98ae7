// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routing keys for agent messages.
//!
//! A key is a `.`-separated list of `name:value` segments, for example
//! `cluster:3.env:staging.envId:12.release:web-01`. The agent adds
//! `kind:`/`name:` for resource messages and `Cert:`/`commit:` for
//! certificate messages.

use std::fmt;
use std::str::FromStr;

use crate::ProtocolError;

/// Segment carrying the cluster id.
pub const CLUSTER: &str = "cluster";
/// Segment carrying the environment namespace.
pub const NAMESPACE: &str = "env";
/// Segment carrying the environment id.
pub const ENV_ID: &str = "envId";
/// Segment carrying the release (instance) name.
pub const RELEASE: &str = "release";
/// Segment carrying a resource kind.
pub const KIND: &str = "kind";
/// Segment carrying a resource name.
pub const NAME: &str = "name";
/// Segment carrying a certificate name.
pub const CERT: &str = "Cert";
/// Segment carrying a commit sha.
pub const COMMIT: &str = "commit";

/// Parsed message routing key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageKey {
    segments: Vec<(String, String)>,
}

impl MessageKey {
    /// Parse a raw key string.
    ///
    /// A `.`-separated piece without a `:` continues the previous segment's
    /// value, so values containing dots survive a round trip.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ProtocolError::InvalidKey("empty key".to_string()));
        }

        let mut segments: Vec<(String, String)> = Vec::new();
        for piece in raw.split('.') {
            match piece.split_once(':') {
                Some((name, value)) if !name.is_empty() => {
                    segments.push((name.to_string(), value.to_string()));
                }
                _ => match segments.last_mut() {
                    Some((_, value)) => {
                        value.push('.');
                        value.push_str(piece);
                    }
                    None => {
                        return Err(ProtocolError::InvalidKey(format!(
                            "segment '{}' is not of the form name:value",
                            piece
                        )));
                    }
                },
            }
        }

        Ok(Self { segments })
    }

    /// Key addressing a whole environment.
    pub fn for_environment(cluster_id: i64, namespace: &str, env_id: i64) -> Self {
        Self::default()
            .with(CLUSTER, cluster_id.to_string())
            .with(NAMESPACE, namespace)
            .with(ENV_ID, env_id.to_string())
    }

    /// Key addressing one release inside an environment.
    pub fn for_release(cluster_id: i64, namespace: &str, env_id: i64, release: &str) -> Self {
        Self::for_environment(cluster_id, namespace, env_id).with(RELEASE, release)
    }

    /// Append (or replace) a segment.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.segments.iter_mut().find(|(n, _)| n == name) {
            Some(existing) => existing.1 = value,
            None => self.segments.push((name.to_string(), value)),
        }
        self
    }

    /// Value of a segment, if present and non-empty.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.segments
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Value of a segment that must be present.
    pub fn require(&self, name: &'static str) -> Result<&str, ProtocolError> {
        self.get(name).ok_or(ProtocolError::MissingSegment(name))
    }

    /// Cluster id.
    pub fn cluster_id(&self) -> Result<i64, ProtocolError> {
        self.numeric(CLUSTER)
    }

    /// Environment id, when the agent includes it.
    pub fn env_id(&self) -> Option<i64> {
        self.get(ENV_ID).and_then(|v| v.parse().ok())
    }

    /// Environment namespace.
    pub fn namespace(&self) -> Option<&str> {
        self.get(NAMESPACE)
    }

    /// Release name.
    pub fn release(&self) -> Option<&str> {
        self.get(RELEASE)
    }

    /// Resource kind.
    pub fn kind(&self) -> Option<&str> {
        self.get(KIND)
    }

    /// Resource name.
    pub fn name(&self) -> Option<&str> {
        self.get(NAME)
    }

    /// Certificate name.
    pub fn cert(&self) -> Option<&str> {
        self.get(CERT)
    }

    /// Commit sha.
    pub fn commit(&self) -> Option<&str> {
        self.get(COMMIT)
    }

    fn numeric(&self, name: &'static str) -> Result<i64, ProtocolError> {
        let raw = self.require(name)?;
        raw.parse().map_err(|_| {
            ProtocolError::InvalidKey(format!("segment '{}' is not numeric: {}", name, raw))
        })
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}:{}", name, value)?;
        }
        Ok(())
    }
}

impl FromStr for MessageKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release_key() {
        let key = MessageKey::parse("cluster:3.env:staging.envId:12.release:web-01").unwrap();

        assert_eq!(key.cluster_id().unwrap(), 3);
        assert_eq!(key.namespace(), Some("staging"));
        assert_eq!(key.env_id(), Some(12));
        assert_eq!(key.release(), Some("web-01"));
        assert_eq!(key.kind(), None);
    }

    #[test]
    fn test_parse_resource_key() {
        let key =
            MessageKey::parse("cluster:1.env:prod.release:api.kind:Pod.name:api-7d9f-x2").unwrap();

        assert_eq!(key.kind(), Some("Pod"));
        assert_eq!(key.name(), Some("api-7d9f-x2"));
    }

    #[test]
    fn test_value_with_dots_is_kept() {
        let key = MessageKey::parse("cluster:1.env:prod.name:api.example.com").unwrap();
        assert_eq!(key.name(), Some("api.example.com"));
        assert_eq!(key.to_string(), "cluster:1.env:prod.name:api.example.com");
    }

    #[test]
    fn test_leading_segment_without_colon_is_rejected() {
        assert!(matches!(
            MessageKey::parse("garbage.cluster:1"),
            Err(ProtocolError::InvalidKey(_))
        ));
        assert!(MessageKey::parse("   ").is_err());
    }

    #[test]
    fn test_non_numeric_cluster() {
        let key = MessageKey::parse("cluster:abc.env:prod").unwrap();
        assert!(key.cluster_id().is_err());
    }

    #[test]
    fn test_missing_segment() {
        let key = MessageKey::parse("env:prod").unwrap();
        assert!(matches!(
            key.cluster_id(),
            Err(ProtocolError::MissingSegment(CLUSTER))
        ));
    }

    #[test]
    fn test_build_release_key() {
        let key = MessageKey::for_release(3, "staging", 12, "web-01");
        assert_eq!(key.to_string(), "cluster:3.env:staging.envId:12.release:web-01");

        let replaced = key.with(RELEASE, "web-02");
        assert_eq!(replaced.release(), Some("web-02"));
    }
}
