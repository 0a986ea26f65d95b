//! HTTP transport between cache nodes.
//!
//! Every node runs an [`HttpPool`]: an HTTP/1.1 server answering
//! `GET /<base>/<group>/<key>` for the keys it owns, and a
//! [`PeerPicker`] that routes outbound reads to the owning node via the
//! consistent-hash ring. Values travel as a protobuf
//! [`CacheResponse`](crate::cache::pb::CacheResponse) frame
//! (`application/x-protobuf`) by default, or as raw octets in legacy mode.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ika::cache::{Group, GetterFn, HttpPool};
//! use tokio::net::TcpListener;
//!
//! # async fn example() -> std::io::Result<()> {
//! let group = Group::new("scores", 2 << 10, GetterFn(|key: String| async move {
//!     Ok(key.into_bytes())
//! }));
//!
//! let pool = Arc::new(HttpPool::new("http://127.0.0.1:9001"));
//! pool.set_peers(["http://127.0.0.1:9001", "http://127.0.0.1:9002"]);
//! group.register_peers(Arc::clone(&pool) as _);
//!
//! let listener = TcpListener::bind("127.0.0.1:9001").await?;
//! HttpPool::serve(pool, listener).await
//! # }
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use crate::cache::consistent_hash::HashRing;
use crate::cache::group::Group;
use crate::cache::pb;
use crate::cache::peers::{PeerGetter, PeerPicker};
use crate::cache::CacheError;

/// Prefix under which every node serves its groups.
pub const DEFAULT_BASE_PATH: &str = "/ccache/";

/// Virtual-node multiplier for the peer ring.
const DEFAULT_REPLICAS: usize = 50;

/// Encoding of the value payload on the peer wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireFormat {
    /// `application/x-protobuf` carrying a [`pb::CacheResponse`].
    Proto,
    /// Legacy raw bytes as `application/octet-stream`.
    Raw,
}

struct PoolState {
    ring: HashRing,
    peers: HashMap<String, Arc<HttpPeer>>,
}

/// A node's server-side HTTP surface plus its view of the cluster.
pub struct HttpPool {
    self_addr: String,
    base_path: String,
    wire: WireFormat,
    state: Mutex<PoolState>,
}

impl HttpPool {
    /// Creates a pool identified by this node's own base URL, for example
    /// `http://10.0.0.2:8001`.
    pub fn new(self_addr: impl Into<String>) -> Self {
        Self::with_options(self_addr, DEFAULT_BASE_PATH, WireFormat::Proto)
    }

    /// Creates a pool with an explicit base path and wire format.
    pub fn with_options(
        self_addr: impl Into<String>,
        base_path: impl Into<String>,
        wire: WireFormat,
    ) -> Self {
        Self {
            self_addr: self_addr.into(),
            base_path: base_path.into(),
            wire,
            state: Mutex::new(PoolState { ring: HashRing::new(DEFAULT_REPLICAS), peers: HashMap::new() }),
        }
    }

    /// Replaces the cluster membership.
    ///
    /// Rebuilds the ring and the per-peer client table. The local address
    /// may be included; picks that land on it report no peer.
    pub fn set_peers<S: Into<String>>(&self, peers: impl IntoIterator<Item = S>) {
        let mut state = self.state.lock();
        state.ring = HashRing::new(DEFAULT_REPLICAS);
        state.peers.clear();
        for peer in peers {
            let peer = peer.into();
            state.ring.add([peer.as_str()]);
            state
                .peers
                .insert(peer.clone(), Arc::new(HttpPeer::new(peer, &self.base_path, self.wire)));
        }
    }

    /// Accept loop: one spawned task per inbound connection, each served
    /// with HTTP/1.1.
    pub async fn serve(pool: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!(server = %pool.self_addr, addr = %listener.local_addr()?, "cache pool listening");
        loop {
            let (stream, remote) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let pool = Arc::clone(&pool);

            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let pool = Arc::clone(&pool);
                    async move { Ok::<_, Infallible>(pool.handle(req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                    tracing::error!(%remote, "cache pool connection error: {err}");
                }
            });
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_string();
        tracing::info!(server = %self.self_addr, method = %req.method(), %path, "cache request");

        if req.method() != Method::GET {
            return plain(StatusCode::METHOD_NOT_ALLOWED, "GET only");
        }
        let Some(rest) = path.strip_prefix(self.base_path.as_str()) else {
            return plain(StatusCode::BAD_REQUEST, "unexpected path");
        };

        let mut parts = rest.splitn(2, '/');
        let (group_name, key) = match (parts.next(), parts.next()) {
            (Some(group), Some(key)) if !group.is_empty() && !key.is_empty() => (group, key),
            _ => return plain(StatusCode::BAD_REQUEST, "expected /<base>/<group>/<key>"),
        };
        let lookup = pb::CacheRequest {
            group: percent_decode(group_name),
            key: percent_decode(key),
        };

        let Some(group) = Group::get_group(&lookup.group) else {
            return plain(StatusCode::NOT_FOUND, "no such group");
        };

        match group.get(&lookup.key).await {
            Ok(view) => match self.wire {
                WireFormat::Proto => {
                    let frame = pb::CacheResponse { value: view.to_vec() };
                    let mut res = Response::new(Full::new(Bytes::from(frame.encode_to_vec())));
                    res.headers_mut().insert(
                        header::CONTENT_TYPE,
                        http::HeaderValue::from_static("application/x-protobuf"),
                    );
                    res
                }
                WireFormat::Raw => {
                    let mut res = Response::new(Full::new(view.as_bytes()));
                    res.headers_mut().insert(
                        header::CONTENT_TYPE,
                        http::HeaderValue::from_static("application/octet-stream"),
                    );
                    res
                }
            },
            Err(err) => plain(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        }
    }
}

impl PeerPicker for HttpPool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        let state = self.state.lock();
        let owner = state.ring.get(key)?;
        if owner == self.self_addr {
            return None;
        }
        tracing::debug!(server = %self.self_addr, %owner, key, "picked peer");
        let peer = state.peers.get(owner)?;
        Some(Arc::clone(peer) as Arc<dyn PeerGetter>)
    }
}

fn plain(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut res = Response::new(Full::new(Bytes::copy_from_slice(message.as_bytes())));
    *res.status_mut() = status;
    res
}

fn percent_decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Client half: fetches values from one remote node.
pub struct HttpPeer {
    base_url: String,
    wire: WireFormat,
}

impl HttpPeer {
    fn new(addr: String, base_path: &str, wire: WireFormat) -> Self {
        let base_url = format!("{}{}", addr.trim_end_matches('/'), base_path);
        Self { base_url, wire }
    }
}

#[async_trait]
impl PeerGetter for HttpPeer {
    async fn get(&self, group: &str, key: &str) -> Result<Bytes, CacheError> {
        let target = format!(
            "{}{}/{}",
            self.base_url,
            urlencoding::encode(group),
            urlencoding::encode(key),
        );
        let url = Url::parse(&target).map_err(|err| CacheError::Peer(err.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| CacheError::Peer(format!("peer url {target} has no host")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| CacheError::Peer(format!("peer url {target} has no port")))?;

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|err| CacheError::Peer(err.to_string()))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(io)
            .await
            .map_err(|err| CacheError::Peer(err.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::error!("cache peer connection error: {err}");
            }
        });

        let req = Request::builder()
            .method(Method::GET)
            .uri(url.path().to_string())
            .header(header::HOST, format!("{host}:{port}"))
            .body(Empty::new())
            .map_err(|err| CacheError::Peer(err.to_string()))?;

        let response = sender
            .send_request(req)
            .await
            .map_err(|err| CacheError::Peer(err.to_string()))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| CacheError::Peer(err.to_string()))?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(CacheError::Peer(format!(
                "peer returned {status}: {}",
                String::from_utf8_lossy(&body),
            )));
        }

        match self.wire {
            WireFormat::Proto => {
                // Decode into a freshly allocated frame.
                let frame = pb::CacheResponse::decode(body.as_ref())
                    .map_err(|err| CacheError::Peer(format!("decoding peer response: {err}")))?;
                Ok(Bytes::from(frame.value))
            }
            WireFormat::Raw => Ok(body),
        }
    }
}
