//! Whole-element last-writer-wins reconciliation.
//!
//! Every element competes on a single total order, `(version, versionNonce)`:
//!
//! ```text
//! incoming E vs current C (same id)
//!   C absent                           → accept
//!   E.version >  C.version             → accept
//!   E.version == C.version, nonce >    → accept
//!   otherwise                          → drop (stale)
//! ```
//!
//! Because acceptance only ever moves an id towards the maximum of that
//! order, applying the same multiset of updates in any interleaving yields
//! the same final map. Tombstones are ordinary field values on the same
//! axis: a higher-version live edit resurrects a deleted element.
//!
//! Pure and I/O-free. Used by rooms, by the persistence bridge when merging
//! storage state back into a room, and by clients on their local scene.

use indexmap::IndexMap;

use crate::element::{Element, ElementHeader, ElementMap};

/// Result of applying one incoming batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedDelta {
    /// Accepted elements, one per id, carrying the final accepted value.
    pub accepted: Vec<Element>,
    /// Incoming elements that lost the version race.
    pub stale: usize,
}

impl AppliedDelta {
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }
}

/// Whether `incoming` wins over `current` on the `(version, versionNonce)` order.
#[inline]
pub fn supersedes(incoming: &ElementHeader, current: &ElementHeader) -> bool {
    (incoming.version, incoming.version_nonce) > (current.version, current.version_nonce)
}

/// Merge `incoming` into `current`, returning what changed.
///
/// O(batch) with one hash lookup per element.
pub fn reconcile<I>(current: &mut ElementMap, incoming: I) -> AppliedDelta
where
    I: IntoIterator<Item = Element>,
{
    let mut accepted: IndexMap<String, Element> = IndexMap::new();
    let mut stale = 0;

    for element in incoming {
        let wins = match current.get(element.id()) {
            None => true,
            Some(existing) => supersedes(&element.header, &existing.header),
        };

        if !wins {
            stale += 1;
            continue;
        }

        // IndexMap::insert keeps the original position for existing ids.
        current.insert(element.header.id.clone(), element.clone());
        accepted.insert(element.header.id.clone(), element);
    }

    AppliedDelta {
        accepted: accepted.into_values().collect(),
        stale,
    }
}
