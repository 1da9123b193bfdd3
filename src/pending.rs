//! Pending delegation table.
//!
//! When a delegation names an authority without glue, the lookup that needs
//! the authority's address parks here, keyed by the authority's hostname,
//! until a separate address lookup for that hostname completes. One address
//! lookup runs per hostname; later lookups that need the same authority
//! queue behind it.

use rustc_hash::FxHashMap;

use crate::dns::normalize_name;
use crate::error::{Error, Result};
use crate::resolver::{LookupId, ResolutionId};

/// A lookup blocked on an authority's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub lookup: LookupId,
    pub resolution: ResolutionId,
}

/// An in-flight address lookup for one authority and the lookups parked on it.
#[derive(Debug, Clone)]
pub struct PendingDelegation {
    /// The address lookup for the authority.
    pub lookup: LookupId,
    /// Resolution that owns (and is charged for) the address lookup.
    pub owner: ResolutionId,
    /// Blocked lookups in arrival order.
    pub waiters: Vec<Waiter>,
}

#[derive(Default)]
pub struct PendingTable {
    entries: FxHashMap<String, PendingDelegation>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `waiter` as blocked on `authority`, resolved by `lookup`.
    ///
    /// Fails with [`Error::Conflict`] if the authority already has an entry;
    /// the existing entry is left untouched.
    pub fn mark_pending(
        &mut self,
        authority: &str,
        lookup: LookupId,
        owner: ResolutionId,
        waiter: Waiter,
    ) -> Result<()> {
        let authority = normalize_name(authority);
        if self.entries.contains_key(&authority) {
            return Err(Error::Conflict(authority));
        }

        self.entries.insert(
            authority,
            PendingDelegation {
                lookup,
                owner,
                waiters: vec![waiter],
            },
        );
        Ok(())
    }

    /// Queue `waiter` behind the existing entry for `authority`.
    ///
    /// Returns `false` if there is no such entry.
    pub fn enqueue(&mut self, authority: &str, waiter: Waiter) -> bool {
        match self.entries.get_mut(&normalize_name(authority)) {
            Some(entry) => {
                entry.waiters.push(waiter);
                true
            }
            None => false,
        }
    }

    /// Remove and return the entry for `authority`.
    pub fn resolve_pending(&mut self, authority: &str) -> Option<PendingDelegation> {
        self.entries.remove(&normalize_name(authority))
    }

    /// Whether `lookup` is the address lookup registered for `authority`.
    pub fn is_resolved_by(&self, authority: &str, lookup: LookupId) -> bool {
        self.entries
            .get(&normalize_name(authority))
            .is_some_and(|entry| entry.lookup == lookup)
    }

    /// Drop all state belonging to `resolution`.
    ///
    /// Its parked lookups leave every queue, and entries whose address lookup
    /// it owns are removed. Waiters of other resolutions parked on those
    /// removed entries are returned with their authority so the caller can
    /// restart them.
    pub fn clear(&mut self, resolution: ResolutionId) -> Vec<(String, Waiter)> {
        let mut orphans = Vec::new();

        self.entries.retain(|authority, entry| {
            entry.waiters.retain(|w| w.resolution != resolution);
            if entry.owner != resolution {
                return true;
            }
            orphans.extend(entry.waiters.drain(..).map(|w| (authority.clone(), w)));
            false
        });

        orphans
    }

    pub fn contains(&self, authority: &str) -> bool {
        self.entries.contains_key(&normalize_name(authority))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
