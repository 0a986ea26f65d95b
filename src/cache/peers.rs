//! Capability seams between a cache group and the rest of the cluster.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::CacheError;

/// Fetches a group's value for a key from one remote cache node.
#[async_trait]
pub trait PeerGetter: Send + Sync {
    async fn get(&self, group: &str, key: &str) -> Result<Bytes, CacheError>;
}

/// Resolves which remote node, if any, owns a key.
///
/// Implementations return `None` both for an empty cluster and when the
/// ring maps the key to the local node, so the caller always falls back to
/// its own loader rather than dialing itself.
pub trait PeerPicker: Send + Sync {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}
