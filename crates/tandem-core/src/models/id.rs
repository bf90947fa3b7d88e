//! Entity identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix carried by client-minted ids that the server has not acknowledged yet.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Identifier of a note, collection or setting.
///
/// Ids are opaque strings: either minted on this device (provisional) or
/// assigned by the server (canonical).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap an existing id.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a provisional id using UUID v7 (time-sortable)
    #[must_use]
    pub fn mint_local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::now_v7().simple()))
    }

    /// Get the string representation of this ID
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was minted on this device
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput("id must not be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The before/after id pair produced when a provisional entity receives its server id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapMapping {
    pub from: EntityId,
    pub to: EntityId,
}

impl SwapMapping {
    pub const fn new(from: EntityId, to: EntityId) -> Self {
        Self { from, to }
    }

    /// Server accepted the client-chosen id.
    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_unique_and_local() {
        let first = EntityId::mint_local();
        let second = EntityId::mint_local();
        assert_ne!(first, second);
        assert!(first.is_local());
        assert!(!EntityId::new("srv_42").is_local());
    }

    #[test]
    fn parse_rejects_blank_ids() {
        assert!("   ".parse::<EntityId>().is_err());
        assert_eq!(" abc ".parse::<EntityId>().unwrap(), EntityId::new("abc"));
    }

    #[test]
    fn swap_mapping_identity() {
        let id = EntityId::new("n1");
        assert!(SwapMapping::new(id.clone(), id).is_identity());
        assert!(!SwapMapping::new("a".into(), "b".into()).is_identity());
    }
}
