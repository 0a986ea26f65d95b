//! Framed RPC runtime.
//!
//! A connection negotiates once with a JSON [`Options`](codec::Options)
//! frame (magic number, codec, timeouts), then carries any number of
//! requests as header+body frame pairs in the negotiated codec. The
//! [`Server`] dispatches `Service.Method` names against registered typed
//! handlers; the [`Client`] multiplexes concurrent calls over one
//! connection by sequence number. On top sit a heartbeat [`Registry`],
//! pluggable [`Discovery`](discovery::Discovery), and the
//! load-balancing/broadcast [`XClient`].

pub mod client;
pub mod codec;
pub mod debug;
pub mod discovery;
pub mod registry;
pub mod server;
pub mod service;
pub mod xclient;

pub use client::{Client, PendingReply};
pub use codec::{CodecKind, Header, Options, MAGIC_NUMBER};
pub use discovery::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode};
pub use registry::Registry;
pub use server::Server;
pub use service::Service;
pub use xclient::XClient;

use std::time::Duration;

/// Path answered with the CONNECT hijack on an RPC-over-HTTP listener.
pub const DEFAULT_RPC_PATH: &str = "/_ika_";

/// Path serving the human-readable service table.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/ika";

/// Status line both sides agree on for a successful CONNECT handshake.
pub const CONNECTED_MESSAGE: &str = "200 connected to ika";

/// Errors surfaced by the RPC runtime.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding a wire value failed.
    #[error("codec: {0}")]
    Codec(String),

    /// The peer's Options frame carried the wrong magic number.
    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),

    /// The peer violated the framing or handshake protocol.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The stream ended between a header and its body.
    #[error("connection ended mid-message")]
    Incomplete,

    /// A request named something other than `Service.Method`.
    #[error("service/method {0:?} is malformed, expected Service.Method")]
    InvalidServiceMethod(String),

    #[error("service {0:?} not found")]
    ServiceNotFound(String),

    #[error("method {0:?} not found")]
    MethodNotFound(String),

    #[error("service {0:?} already registered")]
    DuplicateService(String),

    /// The connection is closed or has failed; pending calls are dropped
    /// with this error.
    #[error("connection is shut down")]
    Shutdown,

    /// Transport and handshake did not complete within the deadline.
    #[error("connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    /// The server could not invoke the method and write its reply within
    /// the deadline.
    #[error("request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),

    /// A broadcast branch was cancelled after another branch failed.
    #[error("call cancelled")]
    Cancelled,

    /// Error string carried back in a reply header.
    #[error("{0}")]
    Remote(String),

    #[error("rpc discovery: no available servers")]
    NoAvailableServers,
}
