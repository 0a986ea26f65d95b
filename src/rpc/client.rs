//! RPC client: one connection, many concurrent calls.
//!
//! A [`Client`] owns the write half of a framed connection plus a
//! background task draining the read half. Outbound requests are
//! serialized by an async send lock (which also fixes sequence-number
//! order to wire order); inbound replies are matched to pending calls by
//! sequence and delivered over per-call oneshot channels. Cloning a
//! `Client` clones a handle to the same connection.
//!
//! # Examples
//!
//! ```rust,no_run
//! use ika::rpc::{Client, Options};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args { a: i64, b: i64 }
//!
//! # async fn example() -> Result<(), ika::rpc::RpcError> {
//! let client = Client::dial("127.0.0.1:7000", Options::default()).await?;
//! let sum: i64 = client.call("Arith.Sum", &Args { a: 1, b: 3 }).await?;
//! assert_eq!(sum, 4);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::rpc::codec::{self, BoxStream, CodecKind, Header, Options, WireReader, WireWriter};
use crate::rpc::{RpcError, CONNECTED_MESSAGE, DEFAULT_RPC_PATH};

struct ClientState {
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Bytes, RpcError>>>,
    /// Set by `close()`; no new calls, connection winding down.
    closing: bool,
    /// Set when the connection has failed; pending calls were dropped.
    shutdown: bool,
}

struct ClientInner {
    kind: CodecKind,
    /// The send lock. Serializes header+body pairs onto the wire.
    writer: tokio::sync::Mutex<WireWriter>,
    /// Guards seq, the pending map, and the lifecycle flags. Never held
    /// across an await, and never acquired while waiting on the send lock
    /// from inside it.
    state: Mutex<ClientState>,
}

/// Handle to one RPC connection, cheap to clone and share.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Performs the client side of the handshake over an established
    /// stream and starts the receive task.
    pub async fn new(stream: BoxStream, options: Options) -> Result<Client, RpcError> {
        let (reader, writer) = codec::connect(stream, &options).await?;
        let inner = Arc::new(ClientInner {
            kind: options.codec,
            writer: tokio::sync::Mutex::new(writer),
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });

        tokio::spawn(receive_loop(Arc::clone(&inner), reader));
        Ok(Client { inner })
    }

    /// CONNECT handshake for the HTTP transport, then the normal protocol
    /// on the same socket.
    pub async fn new_http(stream: TcpStream, options: Options) -> Result<Client, RpcError> {
        let mut stream = BufReader::new(stream);
        stream
            .write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\r\n\r\n").as_bytes())
            .await
            .map_err(RpcError::Io)?;

        let mut status_line = String::new();
        stream.read_line(&mut status_line).await.map_err(RpcError::Io)?;
        let status = status_line
            .trim_end()
            .strip_prefix("HTTP/1.0 ")
            .unwrap_or_default();
        if status != CONNECTED_MESSAGE {
            return Err(RpcError::Protocol(format!(
                "unexpected CONNECT response {:?}",
                status_line.trim_end(),
            )));
        }
        loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await.map_err(RpcError::Io)? == 0 || line == "\r\n" {
                break;
            }
        }

        Client::new(Box::new(stream), options).await
    }

    /// Dials the raw TCP transport, bounded by the connect timeout.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use ika::rpc::{Client, Options};
    ///
    /// # async fn example() -> Result<(), ika::rpc::RpcError> {
    /// let client = Client::dial("127.0.0.1:7000", Options::default()).await?;
    /// assert!(client.is_available());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn dial(addr: &str, options: Options) -> Result<Client, RpcError> {
        Self::dial_with(
            |stream, options| Client::new(Box::new(stream) as BoxStream, options),
            addr,
            options,
        )
        .await
    }

    /// Dials the HTTP transport, bounded by the connect timeout.
    pub async fn dial_http(addr: &str, options: Options) -> Result<Client, RpcError> {
        Self::dial_with(Client::new_http, addr, options).await
    }

    /// Dials an `protocol@address` target, choosing the transport by the
    /// protocol prefix: `http` uses the CONNECT hijack, anything else the
    /// raw framed protocol.
    pub async fn xdial(rpc_addr: &str, options: Options) -> Result<Client, RpcError> {
        let (protocol, addr) = rpc_addr.split_once('@').ok_or_else(|| {
            RpcError::Protocol(format!("rpc address {rpc_addr:?} wants protocol@addr"))
        })?;
        match protocol {
            "http" => Self::dial_http(addr, options).await,
            _ => Self::dial(addr, options).await,
        }
    }

    /// Dials with an injectable constructor, so transports (and tests) can
    /// wrap the handshake. `connect_timeout` caps connect plus
    /// construction; zero waits indefinitely.
    pub async fn dial_with<F, Fut>(
        construct: F,
        addr: &str,
        options: Options,
    ) -> Result<Client, RpcError>
    where
        F: FnOnce(TcpStream, Options) -> Fut,
        Fut: Future<Output = Result<Client, RpcError>>,
    {
        let deadline = options.connect_timeout;
        let dial = async {
            let stream = TcpStream::connect(addr).await.map_err(RpcError::Io)?;
            construct(stream, options).await
        };

        if deadline.is_zero() {
            dial.await
        } else {
            match tokio::time::timeout(deadline, dial).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::ConnectTimeout(deadline)),
            }
        }
    }

    /// Sends a request and returns a handle on the eventual reply.
    ///
    /// The send lock is taken first, then the call is registered (sequence
    /// assigned, pending entry inserted) and the header+body pair written.
    /// A write failure unregisters the call and surfaces here.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use ika::rpc::{Client, Options};
    ///
    /// # async fn example() -> Result<(), ika::rpc::RpcError> {
    /// # let client = Client::dial("127.0.0.1:7000", Options::default()).await?;
    /// // Issue two calls back to back, then collect both replies.
    /// let first = client.go("Arith.Sum", &(1, 2)).await?;
    /// let second = client.go("Arith.Sum", &(3, 4)).await?;
    /// let (a, b): (i64, i64) = (first.recv().await?, second.recv().await?);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn go<Req: Serialize>(
        &self,
        service_method: &str,
        args: &Req,
    ) -> Result<PendingReply, RpcError> {
        let inner = &self.inner;
        let mut writer = inner.writer.lock().await;

        let (seq, rx) = inner.register()?;
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        let body = match inner.kind.encode(args) {
            Ok(body) => body,
            Err(err) => {
                inner.unregister(seq);
                return Err(err);
            }
        };
        if let Err(err) = writer.write(&header, body).await {
            inner.unregister(seq);
            return Err(err);
        }
        drop(writer);

        Ok(PendingReply { seq, kind: inner.kind, rx, inner: Arc::clone(inner) })
    }

    /// Round trip: send, await the reply, decode it.
    ///
    /// Cancellation composes the usual way: wrapping this future in
    /// `tokio::time::timeout` (or selecting against anything else) and
    /// dropping it unregisters the pending call, and a reply arriving
    /// later is discarded by the receive task.
    pub async fn call<Req, Resp>(&self, service_method: &str, args: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.go(service_method, args).await?.recv().await
    }

    /// Whether the connection can still carry calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closing && !state.shutdown
    }

    /// Closes the connection. Fails with [`RpcError::Shutdown`] if it is
    /// already closed or has already failed.
    pub async fn close(&self) -> Result<(), RpcError> {
        {
            let mut state = self.inner.state.lock();
            if state.closing || state.shutdown {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        self.inner.writer.lock().await.close().await
    }
}

impl ClientInner {
    fn register(&self) -> Result<(u64, oneshot::Receiver<Result<Bytes, RpcError>>), RpcError> {
        let mut state = self.state.lock();
        if state.closing || state.shutdown {
            return Err(RpcError::Shutdown);
        }
        let seq = state.seq;
        state.seq += 1;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(seq, tx);
        Ok((seq, rx))
    }

    fn unregister(&self, seq: u64) -> Option<oneshot::Sender<Result<Bytes, RpcError>>> {
        self.state.lock().pending.remove(&seq)
    }

    /// Fails every pending call and marks the connection dead.
    fn terminate(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(RpcError::Shutdown));
        }
    }
}

/// Drains reply frames, correlating them with pending calls by sequence.
async fn receive_loop(inner: Arc<ClientInner>, mut reader: WireReader) {
    loop {
        let header = match reader.read_header().await {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!("rpc client: read header: {err}");
                break;
            }
        };
        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!("rpc client: read body: {err}");
                break;
            }
        };

        match inner.unregister(header.seq) {
            // Cancelled or already failed on the send path; body discarded.
            None => {}
            Some(tx) => {
                let outcome = if header.error.is_empty() {
                    Ok(body)
                } else {
                    Err(RpcError::Remote(header.error))
                };
                let _ = tx.send(outcome);
            }
        }
    }
    inner.terminate();
}

/// An in-flight call. Await [`recv`](PendingReply::recv) for the typed
/// reply; dropping the handle instead abandons the call and unregisters it.
pub struct PendingReply {
    seq: u64,
    kind: CodecKind,
    rx: oneshot::Receiver<Result<Bytes, RpcError>>,
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("seq", &self.seq)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl PendingReply {
    /// Sequence number assigned to this call.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Waits for the reply and decodes it.
    pub async fn recv<Resp: DeserializeOwned>(mut self) -> Result<Resp, RpcError> {
        let outcome = (&mut self.rx).await;
        match outcome {
            Ok(Ok(body)) => self.kind.decode(&body),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RpcError::Shutdown),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.inner.unregister(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::rpc::server::Server;
    use crate::rpc::service::Service;

    #[derive(Serialize, Deserialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    async fn connected_pair() -> Client {
        let server = Server::new();
        server
            .register(Service::new("Arith").method("Sum", |args: Args| async move {
                Ok(args.a + args.b)
            }))
            .unwrap();

        let (client_io, server_io) = tokio::io::duplex(16 << 10);
        tokio::spawn(async move { server.serve_conn(Box::new(server_io)).await });
        Client::new(Box::new(client_io), Options::default()).await.unwrap()
    }

    #[tokio::test]
    async fn calls_round_trip() {
        let client = connected_pair().await;
        let sum: i64 = client.call("Arith.Sum", &Args { a: 1, b: 3 }).await.unwrap();
        assert_eq!(sum, 4);
    }

    #[tokio::test]
    async fn sequences_are_monotonic_and_replies_correlate() {
        let client = connected_pair().await;

        let first = client.go("Arith.Sum", &Args { a: 1, b: 1 }).await.unwrap();
        let second = client.go("Arith.Sum", &Args { a: 2, b: 2 }).await.unwrap();
        assert!(second.seq() > first.seq());

        // Await out of order; correlation is by sequence, not arrival.
        assert_eq!(second.recv::<i64>().await.unwrap(), 4);
        assert_eq!(first.recv::<i64>().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn remote_errors_carry_the_header_text() {
        let client = connected_pair().await;
        let err = client
            .call::<_, i64>("Arith.Missing", &Args { a: 0, b: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref text) if text.contains("Missing")));
    }

    #[tokio::test]
    async fn close_rejects_new_calls_and_double_close() {
        let client = connected_pair().await;
        assert!(client.is_available());

        client.close().await.unwrap();
        assert!(!client.is_available());
        assert!(matches!(
            client.go("Arith.Sum", &Args { a: 1, b: 1 }).await.unwrap_err(),
            RpcError::Shutdown,
        ));
        assert!(matches!(client.close().await.unwrap_err(), RpcError::Shutdown));
    }

    #[tokio::test]
    async fn concurrent_calls_multiplex_over_one_connection() {
        let client = connected_pair().await;

        let mut handles = Vec::new();
        for i in 0..10i64 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let sum: i64 = client.call("Arith.Sum", &Args { a: i, b: i }).await.unwrap();
                (i, sum)
            }));
        }

        for handle in handles {
            let (i, sum) = handle.await.unwrap();
            assert_eq!(sum, 2 * i, "reply for call {i} landed on the wrong caller");
        }
        assert!(client.inner.state.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn dropped_calls_are_unregistered() {
        let client = connected_pair().await;
        let pending = client.go("Arith.Sum", &Args { a: 1, b: 1 }).await.unwrap();
        let seq = pending.seq();
        drop(pending);
        assert!(client.inner.state.lock().pending.get(&seq).is_none());
    }
}
