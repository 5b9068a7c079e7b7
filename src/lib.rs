//! # hostdb
//!
//! In-memory database of storage hosts announced on chain, with random host
//! selection weighted by each host's announced weight.
//!
//! ## Features
//!
//! - **Weighted sampling**: O(depth) draws over a weighted selection tree
//! - **Arbitrary removal**: hosts leave the tree in O(depth) without rebuilding
//! - **Reorg aware**: [`HostDb::update`] rewinds and applies blocks as one
//!   atomic step, so readers never see a half-applied reorganization
//! - **Concurrent**: any number of readers sample while a single writer updates
//!
//! ## Example
//!
//! ```rust
//! use hostdb::{HostDb, HostDbError, HostEntry};
//!
//! let db = HostDb::new();
//! db.insert(HostEntry::new("alpha", 10)).unwrap();
//! db.insert(HostEntry::new("beta", 30)).unwrap();
//!
//! assert_eq!(db.total_weight(), 40);
//! let host = db.random_host().unwrap();
//! assert!(host.id.as_str() == "alpha" || host.id.as_str() == "beta");
//!
//! db.remove("alpha").unwrap();
//! assert_eq!(
//!     db.remove("alpha"),
//!     Err(HostDbError::NotFound("alpha".into()))
//! );
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

pub mod entry;
pub mod error;
pub mod tree;
pub mod update;

pub use entry::{BlockHeight, HostEntry, HostId, Weight};
pub use error::{HostDbError, ReorgDirection, UpdateError};
pub use tree::WeightTree;
pub use update::AnnouncementScanner;

use std::collections::HashMap;

use log::{debug, warn};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::{CryptoRng, Rng, RngCore};

use tree::{Exclusions, NodeId};

/// Configuration for the host database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial capacity hint for the number of active hosts
    pub initial_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveHost {
    node: NodeId,
    /// Announcements seen on chain for this host and not yet rewound.
    announcements: u64,
}

#[derive(Debug, Clone)]
struct InactiveHost {
    entry: HostEntry,
    announcements: u64,
}

/// Everything the lock guards. Methods here assume the caller holds it.
#[derive(Debug)]
struct Inner {
    tree: WeightTree,
    active: HashMap<HostId, ActiveHost>,
    inactive: HashMap<HostId, InactiveHost>,
}

impl Inner {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            tree: WeightTree::with_capacity(capacity),
            active: HashMap::with_capacity(capacity),
            inactive: HashMap::new(),
        }
    }

    fn insert(&mut self, entry: HostEntry) -> Result<(), HostDbError> {
        if entry.weight == 0 {
            return Err(HostDbError::ZeroWeight(entry.id));
        }
        if self.active.contains_key(&entry.id) {
            return Err(HostDbError::AlreadyExists(entry.id));
        }

        // A fresh entry supersedes whatever was parked for this id.
        let announcements = match self.inactive.remove(&entry.id) {
            Some(parked) => parked.announcements,
            None => 1,
        };
        self.activate_entry(entry, announcements);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Result<HostEntry, HostDbError> {
        if let Some(host) = self.active.remove(id) {
            return Ok(self.detach(host.node));
        }
        match self.inactive.remove(id) {
            Some(parked) => Ok(parked.entry),
            None => Err(HostDbError::NotFound(id.into())),
        }
    }

    fn deactivate(&mut self, id: &str) -> Result<(), HostDbError> {
        let host = self
            .active
            .remove(id)
            .ok_or_else(|| HostDbError::NotFound(id.into()))?;
        let entry = self.detach(host.node);
        self.inactive.insert(
            entry.id.clone(),
            InactiveHost {
                entry,
                announcements: host.announcements,
            },
        );
        Ok(())
    }

    fn activate(&mut self, id: &str) -> Result<(), HostDbError> {
        let parked = self
            .inactive
            .remove(id)
            .ok_or_else(|| HostDbError::NotInactive(id.into()))?;
        self.activate_entry(parked.entry, parked.announcements);
        Ok(())
    }

    /// Records an on-chain announcement. Returns true if a new host was added.
    fn announce(&mut self, entry: HostEntry) -> bool {
        // Zero weight announcements are invisible in both directions, see
        // `retract`, so a rewind never undoes something apply skipped.
        if entry.weight == 0 {
            warn!("ignoring zero weight announcement for host {}", entry.id);
            return false;
        }
        if let Some(host) = self.active.get_mut(&entry.id) {
            host.announcements += 1;
            debug!("repeat announcement for active host {}", entry.id);
            return false;
        }
        if let Some(parked) = self.inactive.get_mut(&entry.id) {
            parked.announcements += 1;
            debug!("repeat announcement for inactive host {}", entry.id);
            return false;
        }
        self.activate_entry(entry, 1);
        true
    }

    /// Undoes one announcement. Returns true if the host was dropped.
    fn retract(&mut self, entry: &HostEntry) -> bool {
        if entry.weight == 0 {
            return false;
        }
        let id = &entry.id;
        if let Some(host) = self.active.get_mut(id) {
            host.announcements -= 1;
            if host.announcements > 0 {
                return false;
            }
            let node = host.node;
            self.active.remove(id);
            self.detach(node);
            return true;
        }
        if let Some(parked) = self.inactive.get_mut(id) {
            parked.announcements -= 1;
            if parked.announcements == 0 {
                self.inactive.remove(id);
                return true;
            }
            return false;
        }
        warn!("rewound announcement for unknown host {id}");
        false
    }

    fn activate_entry(&mut self, entry: HostEntry, announcements: u64) {
        debug!("activating host {} (weight {})", entry.id, entry.weight);
        let id = entry.id.clone();
        let node = self.tree.insert(entry);
        self.active.insert(
            id,
            ActiveHost {
                node,
                announcements,
            },
        );
    }

    /// Removes a node from the tree, repointing whichever host got moved.
    fn detach(&mut self, node: NodeId) -> HostEntry {
        let removed = self.tree.remove(node);
        if let Some((moved, to)) = removed.relocated {
            match self.active.get_mut(&moved) {
                Some(host) => host.node = to,
                None => panic!("relocated host {moved} missing from the active index"),
            }
        }
        debug!(
            "removed host {} (weight {}) from the selection tree",
            removed.entry.id, removed.entry.weight
        );
        removed.entry
    }

    fn sample<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Result<HostEntry, HostDbError> {
        if self.active.is_empty() {
            return Err(HostDbError::NoHostsAvailable);
        }
        let weight = rng.gen_range(0..self.tree.total_weight());
        Ok(self.tree.entry_at_weight(weight).clone())
    }
}

/// Set of known storage hosts with weighted random selection.
///
/// All state sits behind one reader-writer lock. Sampling and queries share
/// it; inserts, removals and [`update`](HostDb::update) hold it exclusively.
pub struct HostDb {
    inner: RwLock<Inner>,
    config: Config,
}

impl HostDb {
    /// Create an empty database with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create an empty database with the given configuration.
    pub fn with_config(config: Config) -> Self {
        Self {
            inner: RwLock::new(Inner::with_capacity(config.initial_capacity)),
            config,
        }
    }

    /// The configuration this database was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Add an active host.
    ///
    /// Fails with [`HostDbError::AlreadyExists`] if a host with the same id is
    /// active, and with [`HostDbError::ZeroWeight`] for an unsampleable entry.
    /// An inactive host with the same id is replaced.
    pub fn insert(&self, entry: HostEntry) -> Result<(), HostDbError> {
        self.inner.write().insert(entry)
    }

    /// Forget a host, active or inactive.
    pub fn remove(&self, id: &str) -> Result<(), HostDbError> {
        self.inner.write().remove(id).map(|_| ())
    }

    /// Take an active host out of selection while remembering it.
    pub fn deactivate(&self, id: &str) -> Result<(), HostDbError> {
        self.inner.write().deactivate(id)
    }

    /// Put an inactive host back into selection.
    pub fn activate(&self, id: &str) -> Result<(), HostDbError> {
        self.inner.write().activate(id)
    }

    /// Pick an active host with probability proportional to its weight.
    pub fn random_host(&self) -> Result<HostEntry, HostDbError> {
        self.random_host_with(&mut OsRng)
    }

    /// Like [`random_host`](HostDb::random_host) with a caller supplied
    /// random source.
    pub fn random_host_with<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<HostEntry, HostDbError> {
        self.inner.read().sample(rng)
    }

    /// Pick up to `n` distinct active hosts, weighted, without replacement.
    pub fn random_hosts(&self, n: usize) -> Vec<HostEntry> {
        self.random_hosts_with(n, &mut OsRng)
    }

    /// Like [`random_hosts`](HostDb::random_hosts) with a caller supplied
    /// random source.
    pub fn random_hosts_with<R: RngCore + CryptoRng>(
        &self,
        n: usize,
        rng: &mut R,
    ) -> Vec<HostEntry> {
        // Picks are hidden in a side table, so the shared tree never changes.
        let inner = self.inner.read();
        let mut excluded = Exclusions::default();
        let mut picked = Vec::with_capacity(n.min(inner.tree.len()));
        while picked.len() < n {
            let remaining = inner.tree.remaining_weight(&excluded);
            if remaining == 0 {
                break;
            }
            let node = inner
                .tree
                .node_at_weight_excluding(rng.gen_range(0..remaining), &excluded);
            inner.tree.exclude(node, &mut excluded);
            picked.push(inner.tree.entry(node).clone());
        }
        picked
    }

    /// Number of active hosts.
    pub fn len(&self) -> usize {
        self.inner.read().active.len()
    }

    /// Check if there are no active hosts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of inactive hosts.
    pub fn inactive_len(&self) -> usize {
        self.inner.read().inactive.len()
    }

    /// Sum of the weights of all active hosts.
    pub fn total_weight(&self) -> u128 {
        self.inner.read().tree.total_weight()
    }

    /// Check if a host is known, active or not.
    pub fn contains(&self, id: &str) -> bool {
        let inner = self.inner.read();
        inner.active.contains_key(id) || inner.inactive.contains_key(id)
    }

    /// Check if a host is taking part in selection.
    pub fn is_active(&self, id: &str) -> bool {
        self.inner.read().active.contains_key(id)
    }

    /// Look up a host, active or not.
    pub fn get(&self, id: &str) -> Option<HostEntry> {
        let inner = self.inner.read();
        if let Some(host) = inner.active.get(id) {
            return Some(inner.tree.entry(host.node).clone());
        }
        inner.inactive.get(id).map(|parked| parked.entry.clone())
    }

    /// Snapshot of every active host.
    pub fn active_hosts(&self) -> Vec<HostEntry> {
        self.inner.read().tree.entries().cloned().collect()
    }
}

impl Default for HostDb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod proptests;

#[cfg(test)]
impl HostDb {
    /// Checks the tree against both indices.
    pub(crate) fn validate(&self) {
        let inner = self.inner.read();
        inner.tree.validate();
        assert_eq!(inner.tree.len(), inner.active.len());
        for (id, host) in &inner.active {
            assert_eq!(&inner.tree.entry(host.node).id, id, "stale locator");
            assert!(host.announcements > 0);
            assert!(!inner.inactive.contains_key(id), "{id} active and inactive");
        }
        for (id, parked) in &inner.inactive {
            assert_eq!(&parked.entry.id, id);
            assert!(parked.announcements > 0);
        }
        let sum: u128 = inner.tree.entries().map(|e| u128::from(e.weight)).sum();
        assert_eq!(inner.tree.total_weight(), sum);
    }
}
