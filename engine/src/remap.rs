//! Identity remaps.
//!
//! When the service decides that two uuids denote one entity it answers with
//! `{duplicate -> canonical}`. Applying a remap is an identity rewrite, not an
//! upsert, and always happens before inbound rows are applied.

use crate::{error::Result, protocol::UuidMap, Error, RecordUuid};
use std::collections::{BTreeMap, BTreeSet};

/// A validated remap with every chain collapsed to its final target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRemap {
    targets: BTreeMap<RecordUuid, RecordUuid>,
}

impl IdentityRemap {
    /// Create an empty remap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a wire map. `a -> b, b -> c` becomes `a -> c, b -> c`; self
    /// mappings are dropped; cycles are rejected.
    pub fn from_map(map: &UuidMap) -> Result<Self> {
        let mut targets = BTreeMap::new();

        for start in map.keys() {
            let mut seen = BTreeSet::new();
            let mut current = start;
            seen.insert(current);

            while let Some(next) = map.get(current) {
                if next == current {
                    break;
                }
                if !seen.insert(next) {
                    return Err(Error::InvalidRemap(format!(
                        "cycle through '{}'",
                        start
                    )));
                }
                current = next;
            }

            if current != start {
                targets.insert(start.clone(), current.clone());
            }
        }

        Ok(Self { targets })
    }

    /// Record that `duplicate` is now known as `canonical`.
    pub fn insert(&mut self, duplicate: impl Into<RecordUuid>, canonical: impl Into<RecordUuid>) {
        self.targets.insert(duplicate.into(), canonical.into());
    }

    /// Final target for `uuid`, if it was remapped.
    pub fn resolve(&self, uuid: &str) -> Option<&RecordUuid> {
        self.targets.get(uuid)
    }

    /// Follow the remap, or return `uuid` unchanged.
    pub fn apply<'a>(&'a self, uuid: &'a str) -> &'a str {
        self.resolve(uuid).map(String::as_str).unwrap_or(uuid)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Pairs of (duplicate, canonical) in uuid order.
    pub fn iter(&self) -> impl Iterator<Item = (&RecordUuid, &RecordUuid)> {
        self.targets.iter()
    }

    /// Render for the wire.
    pub fn to_map(&self) -> UuidMap {
        self.targets.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> UuidMap {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn chains_collapse() {
        let remap = IdentityRemap::from_map(&map(&[("a", "b"), ("b", "c")])).unwrap();

        assert_eq!(remap.resolve("a").map(String::as_str), Some("c"));
        assert_eq!(remap.resolve("b").map(String::as_str), Some("c"));
        assert_eq!(remap.apply("c"), "c");
        assert_eq!(remap.len(), 2);
    }

    #[test]
    fn self_mapping_is_ignored() {
        let remap = IdentityRemap::from_map(&map(&[("a", "a")])).unwrap();
        assert!(remap.is_empty());
    }

    #[test]
    fn cycles_are_rejected() {
        let err = IdentityRemap::from_map(&map(&[("a", "b"), ("b", "a")]));
        assert!(matches!(err, Err(Error::InvalidRemap(_))));
    }

    #[test]
    fn roundtrip_to_wire() {
        let mut remap = IdentityRemap::new();
        remap.insert("dup", "canon");
        assert_eq!(remap.to_map(), map(&[("dup", "canon")]));
    }
}
