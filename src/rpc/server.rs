//! RPC server: accept loop, per-connection protocol, request dispatch.
//!
//! Each accepted connection gets its own task. After the Options
//! handshake, the connection task reads header+body pairs and spawns a
//! short-lived task per request; replies are serialized through a shared
//! writer so concurrent handlers cannot interleave frames. A header read
//! failure (including EOF) ends the session; the connection then drains
//! in-flight handlers before closing.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ika::rpc::{Server, Service};
//! use serde::{Deserialize, Serialize};
//! use tokio::net::TcpListener;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args { a: i64, b: i64 }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Arc::new(Server::new());
//! server.register(
//!     Service::new("Arith").method("Sum", |args: Args| async move { Ok(args.a + args.b) }),
//! )?;
//!
//! let listener = TcpListener::bind("127.0.0.1:7000").await?;
//! Server::accept(server, listener).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::rpc::codec::{self, BoxStream, CodecKind, Header, WireWriter};
use crate::rpc::service::{split_service_method, Service};
use crate::rpc::{debug, RpcError, CONNECTED_MESSAGE, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};

/// Dispatches requests against registered services.
pub struct Server {
    services: DashMap<String, Arc<Service>>,
}

impl Server {
    pub fn new() -> Self {
        Self { services: DashMap::new() }
    }

    /// Registers a service under its name.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ika::rpc::{Server, Service};
    ///
    /// let server = Server::new();
    /// server
    ///     .register(Service::new("Echo").method("Say", |text: String| async move { Ok(text) }))
    ///     .unwrap();
    ///
    /// // A second service under the same name is refused.
    /// assert!(server.register(Service::new("Echo")).is_err());
    /// ```
    pub fn register(&self, service: Service) -> Result<(), RpcError> {
        let name = service.name().to_string();
        match self.services.entry(name.clone()) {
            Entry::Vacant(slot) => {
                tracing::info!(service = %name, "rpc server: registered service");
                slot.insert(Arc::new(service));
                Ok(())
            }
            Entry::Occupied(_) => Err(RpcError::DuplicateService(name)),
        }
    }

    /// Snapshot of services and their methods, for the debug page.
    pub fn service_summaries(&self) -> Vec<debug::ServiceSummary> {
        let mut services: Vec<debug::ServiceSummary> = self
            .services
            .iter()
            .map(|entry| {
                let mut methods: Vec<debug::MethodSummary> = entry
                    .value()
                    .methods()
                    .map(|(name, handler)| debug::MethodSummary {
                        name: name.to_string(),
                        arg_type: handler.arg_type(),
                        reply_type: handler.reply_type(),
                        num_calls: handler.num_calls(),
                    })
                    .collect();
                methods.sort_by(|a, b| a.name.cmp(&b.name));
                debug::ServiceSummary { name: entry.key().clone(), methods }
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Accept loop for the raw TCP transport: one connection task each.
    pub async fn accept(server: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "rpc server listening");
        loop {
            let (stream, remote) = listener.accept().await?;
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                tracing::debug!(%remote, "rpc server: connection accepted");
                server.serve_conn(Box::new(stream)).await;
            });
        }
    }

    /// Accept loop for the HTTP transport: CONNECT requests on
    /// [`DEFAULT_RPC_PATH`] are hijacked into the framed protocol, and
    /// [`DEFAULT_DEBUG_PATH`] serves the service table.
    pub async fn accept_http(server: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "rpc server listening (http)");
        loop {
            let (stream, remote) = listener.accept().await?;
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(err) = server.serve_http_conn(stream).await {
                    tracing::debug!(%remote, "rpc server: http connection: {err}");
                }
            });
        }
    }

    /// Runs the framed protocol over one established stream.
    pub async fn serve_conn(&self, stream: BoxStream) {
        let (options, mut reader, writer) = match codec::accept(stream).await {
            Ok(parts) => parts,
            Err(err) => {
                tracing::error!("rpc server: rejecting connection: {err}");
                return;
            }
        };

        let kind = options.codec;
        let handle_timeout = options.handle_timeout;
        let writer = Arc::new(Mutex::new(writer));
        let mut inflight = JoinSet::new();

        loop {
            let header = match reader.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!("rpc server: read header: {err}");
                    break;
                }
            };

            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(err) => {
                    let mut reply = header;
                    reply.error = format!("reading body: {err}");
                    send_response(&writer, &reply, Bytes::new()).await;
                    continue;
                }
            };

            let service = self.lookup(&header.service_method);
            let writer = Arc::clone(&writer);
            inflight.spawn(handle_request(service, kind, header, body, writer, handle_timeout));
        }

        while inflight.join_next().await.is_some() {}
        let _ = writer.lock().await.close().await;
    }

    fn lookup(&self, service_method: &str) -> Result<Arc<Service>, RpcError> {
        let (service, _) = split_service_method(service_method)?;
        self.services
            .get(service)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RpcError::ServiceNotFound(service.to_string()))
    }

    /// Serves one inbound HTTP connection: parses the request head by hand
    /// so the CONNECT hijack can answer with the exact agreed status line
    /// before the raw framed protocol takes over the socket.
    async fn serve_http_conn(&self, stream: TcpStream) -> std::io::Result<()> {
        let mut stream = BufReader::new(stream);

        let mut request_line = String::new();
        if stream.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await? == 0 || line == "\r\n" {
                break;
            }
        }

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();

        match (method, path) {
            ("CONNECT", DEFAULT_RPC_PATH) => {
                stream
                    .write_all(format!("HTTP/1.0 {CONNECTED_MESSAGE}\r\n\r\n").as_bytes())
                    .await?;
                self.serve_conn(Box::new(stream)).await;
            }
            ("GET", DEFAULT_DEBUG_PATH) => {
                let page = debug::render(&self.service_summaries());
                let head = format!(
                    "HTTP/1.0 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n",
                    page.len(),
                );
                stream.write_all(head.as_bytes()).await?;
                stream.write_all(page.as_bytes()).await?;
                stream.flush().await?;
            }
            ("CONNECT", _) | ("GET", _) => {
                stream
                    .write_all(b"HTTP/1.0 404 Not Found\r\n\r\n")
                    .await?;
            }
            _ => {
                stream
                    .write_all(b"HTTP/1.0 405 Method Not Allowed\r\n\r\n")
                    .await?;
            }
        }
        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Invokes one request and writes its reply under the send lock.
///
/// With a handle timeout, the invocation races a timer; on deadline the
/// error reply goes out immediately and the dropped handler future never
/// gets to send a late one.
async fn handle_request(
    service: Result<Arc<Service>, RpcError>,
    kind: CodecKind,
    mut header: Header,
    body: Bytes,
    writer: Arc<Mutex<WireWriter>>,
    handle_timeout: Duration,
) {
    let invocation = async {
        let service = service?;
        let (_, method) = split_service_method(&header.service_method)?;
        let handler = service
            .handler(method)
            .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))?;
        handler.call(kind, body).await
    };

    let outcome = if handle_timeout.is_zero() {
        invocation.await
    } else {
        match tokio::time::timeout(handle_timeout, invocation).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::HandleTimeout(handle_timeout)),
        }
    };

    let (error, payload) = match outcome {
        Ok(reply) => (String::new(), reply),
        Err(err) => {
            tracing::debug!(service_method = %header.service_method, "rpc server: {err}");
            (err.to_string(), Bytes::new())
        }
    };
    header.error = error;
    send_response(&writer, &header, payload).await;
}

async fn send_response(writer: &Mutex<WireWriter>, header: &Header, body: Bytes) {
    let mut writer = writer.lock().await;
    if let Err(err) = writer.write(header, body).await {
        tracing::error!("rpc server: write response: {err}");
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::rpc::codec::Options;

    #[derive(Serialize, Deserialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    fn arith_server() -> Arc<Server> {
        let server = Server::new();
        server
            .register(Service::new("Arith").method("Sum", |args: Args| async move {
                Ok(args.a + args.b)
            }))
            .unwrap();
        Arc::new(server)
    }

    #[tokio::test]
    async fn duplicate_service_registration_fails() {
        let server = arith_server();
        let err = server
            .register(Service::new("Arith").method("Sum", |args: Args| async move {
                Ok(args.a + args.b)
            }))
            .unwrap_err();
        assert!(matches!(err, RpcError::DuplicateService(name) if name == "Arith"));
    }

    #[tokio::test]
    async fn dispatches_over_a_duplex_stream() {
        let server = arith_server();
        let (client_io, server_io) = tokio::io::duplex(16 << 10);
        tokio::spawn(async move { server.serve_conn(Box::new(server_io)).await });

        let options = Options::default();
        let kind = options.codec;
        let (mut reader, mut writer) =
            codec::connect(Box::new(client_io), &options).await.unwrap();

        let header = Header { service_method: "Arith.Sum".into(), seq: 1, error: String::new() };
        let body = kind.encode(&Args { a: 1, b: 3 }).unwrap();
        writer.write(&header, body).await.unwrap();

        let reply = reader.read_header().await.unwrap().unwrap();
        assert_eq!(reply.seq, 1);
        assert_eq!(reply.error, "");
        let payload = reader.read_body().await.unwrap();
        assert_eq!(kind.decode::<i64>(&payload).unwrap(), 4);
    }

    #[tokio::test]
    async fn unknown_targets_fail_only_that_call() {
        let server = arith_server();
        let (client_io, server_io) = tokio::io::duplex(16 << 10);
        tokio::spawn(async move { server.serve_conn(Box::new(server_io)).await });

        let options = Options::default();
        let kind = options.codec;
        let (mut reader, mut writer) =
            codec::connect(Box::new(client_io), &options).await.unwrap();

        for (seq, target) in [(1u64, "Nope.Sum"), (2, "Arith.Nope"), (3, "bare")] {
            let header = Header { service_method: target.into(), seq, error: String::new() };
            writer.write(&header, kind.encode(&()).unwrap()).await.unwrap();
        }
        // The connection survives to serve a good call.
        let header = Header { service_method: "Arith.Sum".into(), seq: 4, error: String::new() };
        writer
            .write(&header, kind.encode(&Args { a: 2, b: 5 }).unwrap())
            .await
            .unwrap();

        let mut failures = 0;
        let mut sum = None;
        for _ in 0..4 {
            let reply = reader.read_header().await.unwrap().unwrap();
            let body = reader.read_body().await.unwrap();
            if reply.error.is_empty() {
                sum = Some(kind.decode::<i64>(&body).unwrap());
            } else {
                failures += 1;
            }
        }
        assert_eq!(failures, 3);
        assert_eq!(sum, Some(7));
    }
}
