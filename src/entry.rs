//! Host announcement records.

use std::borrow::Borrow;
use std::fmt;

/// Height of a block in the chain the announcements are read from.
pub type BlockHeight = u64;

/// Sampling weight of a single host. Must be positive.
pub type Weight = u64;

/// Stable identifier of an announced host.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HostId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for HostId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for HostId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A host as announced on chain.
///
/// Only `id` and `weight` matter to the database; the remaining fields are
/// carried through untouched for whoever picks the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostEntry {
    pub id: HostId,
    pub weight: Weight,
    /// Network address the host accepts negotiation on.
    pub address: String,
    /// Bytes the host offers in total.
    pub total_storage: u64,
    /// Price per byte per block.
    pub price: u64,
    /// Amount burned by the host if it fails a proof.
    pub burn: u64,
}

impl HostEntry {
    /// Entry with the given id and weight and empty metadata.
    pub fn new(id: impl Into<HostId>, weight: Weight) -> Self {
        Self {
            id: id.into(),
            weight,
            address: String::new(),
            total_storage: 0,
            price: 0,
            burn: 0,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }
}
