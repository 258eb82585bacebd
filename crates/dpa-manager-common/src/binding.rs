//! One-to-one binding between owner names and table indices.
//!
//! `BindingTable` keeps a forward and a reverse map and never creates an
//! entry as a side effect of a lookup. A lookup for a missing name returns
//! `None`; it never yields a default index such as `0` that could be mistaken
//! for a real table.

use crate::error::ManagerError;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("{owner} is already bound to index {index}")]
    OwnerBound { owner: String, index: u32 },

    #[error("index {index} is already owned by {owner}")]
    IndexTaken { index: u32, owner: String },

    #[error("binding maps out of step for {owner} / index {index}")]
    Inconsistent { owner: String, index: u32 },
}

impl From<BindingError> for ManagerError {
    fn from(err: BindingError) -> Self {
        ManagerError::fatal(err.to_string())
    }
}

/// Two-way map of owner to index.
///
/// ```
/// use dpa_manager_common::BindingTable;
///
/// let mut table: BindingTable<String> = BindingTable::new();
/// assert_eq!(table.index_of(&"g1".to_string()), None);
///
/// table.bind("g1".to_string(), 3).unwrap();
/// assert_eq!(table.index_of(&"g1".to_string()), Some(3));
/// assert_eq!(table.owner_of(3), Some(&"g1".to_string()));
/// ```
#[derive(Debug, Clone)]
pub struct BindingTable<K> {
    by_owner: BTreeMap<K, u32>,
    by_index: BTreeMap<u32, K>,
}

impl<K> BindingTable<K>
where
    K: Ord + Clone + Display + Debug,
{
    pub fn new() -> Self {
        Self {
            by_owner: BTreeMap::new(),
            by_index: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_owner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_owner.is_empty()
    }

    /// Returns the index bound to `owner`. **Never creates entries.**
    pub fn index_of(&self, owner: &K) -> Option<u32> {
        self.by_owner.get(owner).copied()
    }

    /// Returns the owner of `index`. **Never creates entries.**
    pub fn owner_of(&self, index: u32) -> Option<&K> {
        self.by_index.get(&index)
    }

    /// Binds `owner` to `index`.
    ///
    /// # Errors
    ///
    /// Fails if either side already has a binding. Nothing is changed on error.
    pub fn bind(&mut self, owner: K, index: u32) -> Result<(), BindingError> {
        if let Some(&bound) = self.by_owner.get(&owner) {
            return Err(BindingError::OwnerBound {
                owner: owner.to_string(),
                index: bound,
            });
        }
        if let Some(existing) = self.by_index.get(&index) {
            return Err(BindingError::IndexTaken {
                index,
                owner: existing.to_string(),
            });
        }
        self.by_index.insert(index, owner.clone());
        self.by_owner.insert(owner, index);
        Ok(())
    }

    /// Removes the binding for `owner` and returns its index.
    ///
    /// Returns `Ok(None)` if `owner` was never bound.
    ///
    /// # Errors
    ///
    /// [`BindingError::Inconsistent`] if the reverse entry is missing or
    /// names another owner. The forward entry is still removed.
    pub fn unbind(&mut self, owner: &K) -> Result<Option<u32>, BindingError> {
        let Some(index) = self.by_owner.remove(owner) else {
            return Ok(None);
        };
        match self.by_index.remove(&index) {
            Some(ref reverse) if reverse == owner => Ok(Some(index)),
            Some(other) => {
                self.by_index.insert(index, other);
                Err(BindingError::Inconsistent {
                    owner: owner.to_string(),
                    index,
                })
            }
            None => Err(BindingError::Inconsistent {
                owner: owner.to_string(),
                index,
            }),
        }
    }

    /// Iterates bindings in owner order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, u32)> {
        self.by_owner.iter().map(|(k, &v)| (k, v))
    }
}

impl<K> Default for BindingTable<K>
where
    K: Ord + Clone + Display + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn owner(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_lookup_never_creates() {
        let table: BindingTable<String> = BindingTable::new();
        assert_eq!(table.index_of(&owner("missing")), None);
        assert_eq!(table.owner_of(0), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_bind_both_sides_exclusive() {
        let mut table = BindingTable::new();
        table.bind(owner("g1"), 3).unwrap();

        assert_eq!(
            table.bind(owner("g1"), 2),
            Err(BindingError::OwnerBound {
                owner: owner("g1"),
                index: 3
            })
        );
        assert_eq!(
            table.bind(owner("g2"), 3),
            Err(BindingError::IndexTaken {
                index: 3,
                owner: owner("g1")
            })
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unbind_returns_index() {
        let mut table = BindingTable::new();
        table.bind(owner("g1"), 3).unwrap();
        assert_eq!(table.unbind(&owner("g1")), Ok(Some(3)));
        assert_eq!(table.unbind(&owner("g1")), Ok(None));
        assert_eq!(table.owner_of(3), None);

        table.bind(owner("g2"), 3).unwrap();
        assert_eq!(table.owner_of(3), Some(&owner("g2")));
    }

    #[test]
    fn test_inconsistency_is_fatal() {
        let mut table = BindingTable::new();
        table.bind(owner("g1"), 3).unwrap();
        table.by_index.insert(3, owner("g9"));

        let err = table.unbind(&owner("g1")).unwrap_err();
        assert_eq!(
            err,
            BindingError::Inconsistent {
                owner: owner("g1"),
                index: 3
            }
        );
        assert!(ManagerError::from(err).is_fatal());
        assert_eq!(table.owner_of(3), Some(&owner("g9")));
    }

    #[test]
    fn test_iter_in_owner_order() {
        let mut table = BindingTable::new();
        table.bind(owner("b"), 1).unwrap();
        table.bind(owner("a"), 2).unwrap();
        let pairs: Vec<(String, u32)> = table.iter().map(|(k, v)| (k.clone(), v)).collect();
        assert_eq!(pairs, vec![(owner("a"), 2), (owner("b"), 1)]);
    }
}
