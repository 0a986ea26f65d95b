//! Heartbeat-based service registry.
//!
//! Servers POST their address periodically; clients GET the list of
//! addresses whose last heartbeat is inside the liveness window. State is
//! one map, addresses to last-heartbeat times; expired entries are purged
//! while the alive list is enumerated.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use crate::rpc::RpcError;

/// Path the registry answers on.
pub const DEFAULT_REGISTRY_PATH: &str = "/_ika_/registry";

/// Request header carrying one server's address in a heartbeat.
pub const SERVER_HEADER: &str = "X-Ika-Server";

/// Response header carrying the comma-joined alive list.
pub const SERVERS_HEADER: &str = "X-Ika-Servers";

/// Entries older than this are considered dead.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

struct ServerItem {
    start: Instant,
}

/// The registry store plus its HTTP surface.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ika::rpc::Registry;
/// use tokio::net::TcpListener;
///
/// # async fn example() -> std::io::Result<()> {
/// let registry = Arc::new(Registry::new());
/// let listener = TcpListener::bind("127.0.0.1:9999").await?;
/// Registry::serve(registry, listener).await
/// # }
/// ```
pub struct Registry {
    timeout: Duration,
    path: String,
    servers: Mutex<HashMap<String, ServerItem>>,
}

impl Registry {
    /// Registry with the default five-minute liveness window.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Registry with an explicit liveness window. Zero keeps entries
    /// forever.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            path: DEFAULT_REGISTRY_PATH.to_string(),
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Upserts a server, stamping its heartbeat time.
    pub fn put_server(&self, addr: impl Into<String>) {
        let mut servers = self.servers.lock();
        servers.insert(addr.into(), ServerItem { start: Instant::now() });
    }

    /// Sorted alive addresses; expired entries are dropped on the way.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock();
        let timeout = self.timeout;
        let now = Instant::now();
        servers.retain(|_, item| timeout.is_zero() || item.start + timeout > now);

        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort_unstable();
        alive
    }

    /// Accept loop serving the registry over HTTP/1.1.
    pub async fn serve(registry: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, path = %registry.path, "registry listening");
        loop {
            let (stream, remote) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let registry = Arc::clone(&registry);

            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let registry = Arc::clone(&registry);
                    async move { Ok::<_, Infallible>(registry.handle(req)) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                    tracing::error!(%remote, "registry connection error: {err}");
                }
            });
        }
    }

    fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        if req.uri().path() != self.path {
            return status_only(StatusCode::NOT_FOUND);
        }

        if req.method() == Method::GET {
            let alive = self.alive_servers().join(",");
            let mut res = Response::new(Full::new(Bytes::new()));
            match http::HeaderValue::from_str(&alive) {
                Ok(value) => {
                    res.headers_mut().insert(SERVERS_HEADER, value);
                    res
                }
                Err(_) => status_only(StatusCode::INTERNAL_SERVER_ERROR),
            }
        } else if req.method() == Method::POST {
            let addr = req
                .headers()
                .get(SERVER_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            if addr.is_empty() {
                return status_only(StatusCode::INTERNAL_SERVER_ERROR);
            }
            tracing::debug!(%addr, "registry heartbeat");
            self.put_server(addr);
            status_only(StatusCode::OK)
        } else {
            status_only(StatusCode::METHOD_NOT_ALLOWED)
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn status_only(status: StatusCode) -> Response<Full<Bytes>> {
    let mut res = Response::new(Full::new(Bytes::new()));
    *res.status_mut() = status;
    res
}

/// Sends one heartbeat immediately, then keeps beating on a background
/// task until a send fails.
///
/// A zero period defaults to the registry timeout minus one minute, so a
/// beat always lands inside the liveness window.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), ika::rpc::RpcError> {
/// ika::rpc::registry::heartbeat(
///     "http://127.0.0.1:9999/_ika_/registry",
///     "tcp@10.0.0.1:7000",
///     Duration::ZERO,
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn heartbeat(
    registry: impl Into<String>,
    addr: impl Into<String>,
    period: Duration,
) -> Result<(), RpcError> {
    let registry = registry.into();
    let addr = addr.into();
    let period = if period.is_zero() {
        DEFAULT_TIMEOUT - Duration::from_secs(60)
    } else {
        period
    };

    send_heartbeat(&registry, &addr).await?;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // first tick fires immediately; already sent
        loop {
            ticker.tick().await;
            if let Err(err) = send_heartbeat(&registry, &addr).await {
                tracing::error!(%addr, "heartbeat failed, stopping: {err}");
                break;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(registry: &str, addr: &str) -> Result<(), RpcError> {
    tracing::debug!(%addr, %registry, "sending heartbeat");
    let response = simple_request(Method::POST, registry, &[(SERVER_HEADER, addr)]).await?;
    if response.status() != StatusCode::OK {
        return Err(RpcError::Protocol(format!(
            "registry rejected heartbeat: {}",
            response.status(),
        )));
    }
    Ok(())
}

/// Minimal one-shot HTTP request over a fresh connection.
///
/// Enough for heartbeats and registry refreshes; anything long-lived talks
/// hyper directly.
pub(crate) async fn simple_request(
    method: Method,
    url: &str,
    headers: &[(&str, &str)],
) -> Result<Response<Bytes>, RpcError> {
    let url = Url::parse(url).map_err(|err| RpcError::Protocol(err.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| RpcError::Protocol(format!("url {url} has no host")))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RpcError::Protocol(format!("url {url} has no port")))?;

    let stream = TcpStream::connect((host.as_str(), port)).await.map_err(RpcError::Io)?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(io)
        .await
        .map_err(|err| RpcError::Protocol(err.to_string()))?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::error!("http connection error: {err}");
        }
    });

    let mut builder = Request::builder()
        .method(method)
        .uri(url.path().to_string())
        .header(header::HOST, format!("{host}:{port}"));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder
        .body(Empty::new())
        .map_err(|err| RpcError::Protocol(err.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|err| RpcError::Protocol(err.to_string()))?;
    let (parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|err| RpcError::Protocol(err.to_string()))?
        .to_bytes();
    Ok(Response::from_parts(parts, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeats_keep_servers_alive() {
        let registry = Registry::with_timeout(Duration::from_millis(200));
        registry.put_server("tcp@127.0.0.1:7001");
        registry.put_server("tcp@127.0.0.1:7002");

        assert_eq!(
            registry.alive_servers(),
            ["tcp@127.0.0.1:7001", "tcp@127.0.0.1:7002"],
        );
    }

    #[test]
    fn expired_servers_are_purged_on_enumeration() {
        let registry = Registry::with_timeout(Duration::from_millis(50));
        registry.put_server("tcp@127.0.0.1:7001");
        std::thread::sleep(Duration::from_millis(80));

        assert!(registry.alive_servers().is_empty());
        assert!(registry.servers.lock().is_empty());
    }

    #[test]
    fn a_fresh_heartbeat_revives_an_entry() {
        let registry = Registry::with_timeout(Duration::from_millis(100));
        registry.put_server("tcp@127.0.0.1:7001");
        std::thread::sleep(Duration::from_millis(60));
        registry.put_server("tcp@127.0.0.1:7001");
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(registry.alive_servers(), ["tcp@127.0.0.1:7001"]);
    }

    #[test]
    fn zero_timeout_keeps_entries_forever() {
        let registry = Registry::with_timeout(Duration::ZERO);
        registry.put_server("tcp@127.0.0.1:7001");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.alive_servers(), ["tcp@127.0.0.1:7001"]);
    }
}
