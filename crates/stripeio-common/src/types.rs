//! Core type definitions for StripeIO
//!
//! This module defines the identifiers, extent vectors and buffer vectors
//! shared by the layout, transport and client layers.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 128-bit identifier of an object, index or realm
///
/// Identifiers are never reused. The range below [`EntityId::APP_MIN`] is
/// reserved for well-known entities such as the root realm.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct EntityId(Uuid);

impl EntityId {
    /// The root realm every entity lives in unless told otherwise
    pub const ROOT_REALM: Self = Self::from_parts(0, 1);

    /// Smallest identifier available to applications
    pub const APP_MIN: Self = Self::from_parts(0, 0x10_0000);

    /// Generate a new random identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an identifier from its high and low halves
    #[must_use]
    pub const fn from_parts(hi: u64, lo: u64) -> Self {
        Self(Uuid::from_u64_pair(hi, lo))
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub fn hi(&self) -> u64 {
        self.0.as_u64_pair().0
    }

    #[must_use]
    pub fn lo(&self) -> u64 {
        self.0.as_u64_pair().1
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Whether an application may create an entity with this id
    #[must_use]
    pub fn is_app_range(&self) -> bool {
        *self >= Self::APP_MIN
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({:#x}:{:#x})", self.hi(), self.lo())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{:#x}", self.hi(), self.lo())
    }
}

/// Kind of entity an identifier names
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Object,
    Index,
    Realm,
}

/// Storage target (one device slot in a pool version)
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("tgt-{_0}")]
pub struct TargetId(u32);

impl TargetId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Remote service endpoint (an IO, metadata or index service)
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("svc-{_0}")]
pub struct ServiceId(u32);

impl ServiceId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Role of a remote service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Stores object data units
    Io,
    /// Stores object and realm metadata
    Metadata,
    /// Serves key-value indices
    Index,
}

impl ServiceKind {
    /// Services that hold transactions an fsync round must confirm
    #[must_use]
    pub const fn is_durable(self) -> bool {
        matches!(self, Self::Io | Self::Metadata)
    }
}

/// A storage target together with the service that owns it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetAddr {
    pub target: TargetId,
    pub service: ServiceId,
}

/// Layout identifier (striping geometry)
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into, Default,
)]
#[display("layout-{_0}")]
pub struct LayoutId(u64);

impl LayoutId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Pool version identifier
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into, Default,
)]
#[display("pver-{_0}")]
pub struct PoolVersionId(u64);

impl PoolVersionId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Transaction id assigned by a remote service to an update
///
/// A zero `txid` means "nothing pending". Durability comparisons look at
/// `txid` only; the locality is carried along so an fsync can name it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxRemId {
    pub txid: u64,
    pub locality: u64,
}

impl TxRemId {
    #[must_use]
    pub const fn new(txid: u64, locality: u64) -> Self {
        Self { txid, locality }
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.txid != 0
    }
}

/// One byte range of an object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub count: u64,
}

impl Extent {
    #[must_use]
    pub const fn new(offset: u64, count: u64) -> Self {
        Self { offset, count }
    }

    /// Exclusive end offset
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.count
    }
}

/// Ordered list of extents an IO operation touches
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexVec(Vec<Extent>);

impl IndexVec {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, offset: u64, count: u64) {
        self.0.push(Extent::new(offset, count));
    }

    /// Sum of all extent lengths
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().map(|e| e.count).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.0.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Extent] {
        &self.0
    }
}

impl From<Vec<Extent>> for IndexVec {
    fn from(v: Vec<Extent>) -> Self {
        Self(v)
    }
}

impl FromIterator<(u64, u64)> for IndexVec {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(o, c)| Extent::new(o, c)).collect())
    }
}

/// Scatter-gather list of application buffers
///
/// The buffers are treated as one flat byte stream; buffer boundaries carry
/// no meaning beyond the shape handed back after a read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufVec {
    bufs: Vec<Vec<u8>>,
}

impl BufVec {
    #[must_use]
    pub const fn new() -> Self {
        Self { bufs: Vec::new() }
    }

    /// Allocate `nr` zeroed buffers of `size` bytes each
    #[must_use]
    pub fn alloc(nr: usize, size: usize) -> Self {
        Self {
            bufs: (0..nr).map(|_| vec![0u8; size]).collect(),
        }
    }

    pub fn push(&mut self, buf: Vec<u8>) {
        self.bufs.push(buf);
    }

    /// Total number of bytes across all buffers
    #[must_use]
    pub fn total(&self) -> u64 {
        self.bufs.iter().map(|b| b.len() as u64).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    #[must_use]
    pub fn buffers(&self) -> &[Vec<u8>] {
        &self.bufs
    }

    /// Concatenate all buffers into one contiguous vector
    #[must_use]
    pub fn to_flat(&self) -> Vec<u8> {
        self.bufs.concat()
    }

    /// Overwrite the buffers, in order, with the bytes of `flat`
    ///
    /// `flat` must be exactly [`BufVec::total`] bytes long.
    pub fn fill_from(&mut self, flat: &[u8]) {
        debug_assert_eq!(flat.len() as u64, self.total());
        let mut pos = 0;
        for buf in &mut self.bufs {
            let n = buf.len();
            buf.copy_from_slice(&flat[pos..pos + n]);
            pos += n;
        }
    }
}

impl From<Vec<Vec<u8>>> for BufVec {
    fn from(bufs: Vec<Vec<u8>>) -> Self {
        Self { bufs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_parts() {
        let id = EntityId::from_parts(7, 42);
        assert_eq!(id.hi(), 7);
        assert_eq!(id.lo(), 42);
        assert_eq!(id.to_string(), "0x7:0x2a");
    }

    #[test]
    fn test_entity_id_app_range() {
        assert!(!EntityId::ROOT_REALM.is_app_range());
        assert!(EntityId::APP_MIN.is_app_range());
        assert!(EntityId::from_parts(1, 0).is_app_range());
        assert!(!EntityId::from_parts(0, 0xffff).is_app_range());
    }

    #[test]
    fn test_index_vec_total() {
        let iv: IndexVec = [(0, 4096), (8192, 8192)].into_iter().collect();
        assert_eq!(iv.len(), 2);
        assert_eq!(iv.total(), 12288);
        assert_eq!(iv.as_slice()[1].end(), 16384);
    }

    #[test]
    fn test_bufvec_flatten_and_fill() {
        let mut bv = BufVec::alloc(3, 4);
        assert_eq!(bv.total(), 12);
        let flat: Vec<u8> = (0u8..12).collect();
        bv.fill_from(&flat);
        assert_eq!(bv.buffers()[1], vec![4, 5, 6, 7]);
        assert_eq!(bv.to_flat(), flat);
    }

    #[test]
    fn test_txremid_pending() {
        assert!(!TxRemId::default().is_pending());
        assert!(TxRemId::new(3, 0).is_pending());
    }

    #[test]
    fn test_service_kind_durable() {
        assert!(ServiceKind::Io.is_durable());
        assert!(ServiceKind::Metadata.is_durable());
        assert!(!ServiceKind::Index.is_durable());
    }
}
