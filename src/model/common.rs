use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, VcsError};

pub type Id = String;

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// SHA-256 content hash of a stored object (blob or tree), hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectHash(String);

/// SHA-256 commit identifier, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(String);

macro_rules! hex_id {
    ($ty:ident) => {
        impl $ty {
            pub fn from_hex(hex: impl Into<String>) -> Self {
                Self(hex.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First 12 hex characters, for log lines.
            pub fn short(&self) -> &str {
                let end = self.0.len().min(12);
                &self.0[..end]
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

hex_id!(ObjectHash);
hex_id!(CommitId);

/// `namespace.name`, unique within a tree.
///
/// The namespace is everything before the first `.`; the name may itself
/// contain dots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QualifiedName(String);

impl QualifiedName {
    pub fn new(namespace: &str, name: &str) -> Result<Self> {
        Self::parse(&format!("{}.{}", namespace, name))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| VcsError::InvalidName {
            name: raw.to_string(),
            reason: reason.to_string(),
        };

        let (namespace, name) = raw
            .split_once('.')
            .ok_or_else(|| invalid("expected 'namespace.name'"))?;
        if namespace.trim().is_empty() || name.trim().is_empty() {
            return Err(invalid("namespace and name must be non-empty"));
        }
        if raw.chars().any(|c| c.is_control()) {
            return Err(invalid("control characters are not allowed"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn namespace(&self) -> &str {
        self.0.split_once('.').map(|(ns, _)| ns).unwrap_or(&self.0)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('.').map(|(_, n)| n).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for QualifiedName {
    type Error = VcsError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<QualifiedName> for String {
    fn from(value: QualifiedName) -> Self {
        value.0
    }
}

/// Validate a branch or tag name. Mirrors the usual git ref restrictions.
pub fn validate_ref_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| VcsError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("must be non-empty"));
    }
    if name.starts_with('-') || name.starts_with('/') || name.ends_with('/') {
        return Err(invalid("must not start with '-' or '/' or end with '/'"));
    }
    if name.contains("..") || name.contains("//") {
        return Err(invalid("must not contain '..' or '//'"));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
    {
        return Err(invalid("contains a forbidden character"));
    }
    Ok(())
}
