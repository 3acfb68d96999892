use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};

/// VLESS client id. Also seeds the WebSocket path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity(Uuid);

impl Identity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a supplied id, or generates a fresh one when `raw` is absent or blank.
    pub fn resolve(raw: Option<&str>) -> Result<Self> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            Some(value) => Uuid::parse_str(value)
                .map(Self)
                .map_err(|e| Error::Config(format!("invalid UUID '{}': {}", value, e))),
            None => Ok(Self::generate()),
        }
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for Identity {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// WebSocket path the inbound listens on, always starting with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenPath(String);

impl ListenPath {
    /// `/` followed by the first 8 hex chars of md5(identity).
    pub fn derive(identity: &Identity) -> Self {
        let digest = format!("{:x}", md5::compute(identity.to_string().as_bytes()));
        Self(format!("/{}", &digest[..8]))
    }

    pub fn from_override(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with('/') {
            Self(raw.to_string())
        } else {
            Self(format!("/{}", raw))
        }
    }

    /// Uses the override when one is set, otherwise derives from the identity.
    pub fn resolve(override_path: Option<&str>, identity: &Identity) -> Self {
        match override_path.map(str::trim).filter(|s| !s.is_empty()) {
            Some(path) => Self::from_override(path),
            None => Self::derive(identity),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListenPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
