use std::{fmt::Display, str::FromStr};

use serde_with::{DeserializeFromStr, SerializeDisplay};

/// Location of an endpoint for one transport, written `scheme://authority/path`.
///
/// The path always starts with `/`; an address parsed without a path gets the
/// root path `/`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr)]
pub struct TransportAddress {
    scheme: String,
    authority: String,
    path: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportAddressError {
    #[error("missing `://` separator in `{0}`")]
    MissingScheme(String),
    #[error("empty authority in `{0}`")]
    EmptyAuthority(String),
}

impl TransportAddress {
    pub fn new(scheme: &str, authority: &str) -> Self {
        Self {
            scheme: scheme.to_owned(),
            authority: authority.to_owned(),
            path: "/".to_owned(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Same scheme and authority, with `path` instead of the current path.
    pub fn with_path(&self, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };
        Self {
            scheme: self.scheme.clone(),
            authority: self.authority.clone(),
            path,
        }
    }
}

impl Display for TransportAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)
    }
}

impl std::fmt::Debug for TransportAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for TransportAddress {
    type Err = TransportAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| TransportAddressError::MissingScheme(s.to_owned()))?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(TransportAddressError::EmptyAuthority(s.to_owned()));
        }
        Ok(Self {
            scheme: scheme.to_owned(),
            authority: authority.to_owned(),
            path: path.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_components() {
        let ta: TransportAddress = "ringlink.mem://host-a/overlay/one".parse().unwrap();
        assert_eq!(ta.scheme(), "ringlink.mem");
        assert_eq!(ta.authority(), "host-a");
        assert_eq!(ta.path(), "/overlay/one");
        assert_eq!(ta.to_string(), "ringlink.mem://host-a/overlay/one");
    }

    #[test]
    fn missing_path_is_root() {
        let ta: TransportAddress = "ringlink.mem://host-a".parse().unwrap();
        assert_eq!(ta.path(), "/");
        assert_eq!(ta.to_string(), "ringlink.mem://host-a/");
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            "host-a/path".parse::<TransportAddress>(),
            Err(TransportAddressError::MissingScheme(_))
        ));
        assert!(matches!(
            "udp:///path".parse::<TransportAddress>(),
            Err(TransportAddressError::EmptyAuthority(_))
        ));
    }

    #[test]
    fn serializes_as_string() {
        let ta: TransportAddress = "udp://10.0.0.1:4000/p".parse().unwrap();
        let json = serde_json::to_string(&ta).unwrap();
        assert_eq!(json, "\"udp://10.0.0.1:4000/p\"");
        let back: TransportAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ta);
    }
}
