#![cfg_attr(docsrs, feature(doc_cfg))]

//! Two distributed-systems engines in one small, pragmatic package.
//!
//! Ika bundles a distributed in-memory cache and a framed RPC runtime that
//! are built to share a process: cache nodes discover each other over the
//! same HTTP plumbing the RPC registry uses, and both engines ride tokio.
//!
//! # High-level features
//! - Named cache [`cache::Group`]s over byte-budgeted LRUs, with
//!   per-key request coalescing on miss
//! - Consistent-hash peer routing and an HTTP peer transport carrying
//!   protobuf value frames
//! - A framed RPC protocol with a JSON handshake, pluggable body codecs,
//!   connect and handle timeouts
//! - Typed, reflection-free service registration and a concurrent
//!   dispatcher with per-method call counters
//! - A multiplexing client: many concurrent calls over one connection,
//!   correlated by sequence number
//! - A heartbeat registry plus client-side discovery with random and
//!   round-robin balancing, unicast and broadcast calls
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - HTTP surfaces: `hyper` 1.x
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use ika::cache::{Group, GetterFn};
//!
//! # async fn example() -> Result<(), ika::cache::CacheError> {
//! let scores = Group::new("scores", 2 << 10, GetterFn(|key: String| async move {
//!     Ok(format!("score-of-{key}").into_bytes())
//! }));
//! let view = scores.get("alice").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Key concepts
//! - [cache::Group] is a cache namespace: LRU + loader + peers + coalescer.
//! - [cache::HttpPool] is a node's peer transport and pick-a-peer ring.
//! - [rpc::Server] dispatches `Service.Method` requests against
//!   [rpc::Service] registrations.
//! - [rpc::Client] multiplexes calls; [rpc::XClient] adds discovery,
//!   load balancing, and broadcast.
//!
//! # Feature flags
//! - `ika-tracing` — structured tracing subscriber

/// Distributed in-memory cache engine: groups, LRU, peering, coalescing.
pub mod cache;

/// Framed RPC runtime: codec, server, client, registry, discovery.
pub mod rpc;

/// Distributed tracing integration for observability.
#[cfg(feature = "ika-tracing")]
#[cfg_attr(docsrs, doc(cfg(feature = "ika-tracing")))]
pub mod tracing;

pub use bytes::Bytes;
pub use cache::{ByteView, Group};
pub use rpc::{Client, Options, Server, Service, XClient};
