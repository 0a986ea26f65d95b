//! Distributed in-memory cache engine.
//!
//! Values live in named [`Group`]s, each backed by a byte-budgeted LRU.
//! A miss is coalesced per key, then resolved against the cluster: the
//! consistent-hash ring names the owning node, the HTTP pool fetches from
//! it, and only keys owned locally (or without a reachable owner) fall
//! through to the group's source loader. Cached values are immutable
//! [`ByteView`] snapshots.
//!
//! The engine is best-effort: no persistence, no replication, and no
//! cross-node invalidation. A populated node answers from memory until
//! eviction.

pub mod byte_view;
pub mod consistent_hash;
pub mod group;
pub mod http;
pub mod lru;
pub mod pb;
pub mod peers;
pub mod singleflight;

pub use byte_view::ByteView;
pub use consistent_hash::HashRing;
pub use group::{Getter, GetterFn, Group};
pub use peers::{PeerGetter, PeerPicker};
pub use self::http::{HttpPool, WireFormat, DEFAULT_BASE_PATH};
pub use singleflight::Flight;

/// Errors surfaced by cache reads.
///
/// Cloneable because a coalesced load delivers one outcome to every caller
/// in the wave.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    /// `Group::get` called with an empty key.
    #[error("key is required")]
    EmptyKey,

    /// No value for the key: the group has no loader, or the loader chose
    /// to report absence.
    #[error("cache group {group:?}: key {key:?} not found")]
    NotFound { group: String, key: String },

    /// User-supplied loader failed.
    #[error("loader: {0}")]
    Loader(String),

    /// Remote peer fetch failed. Not retried locally.
    #[error("peer: {0}")]
    Peer(String),
}
