//! Discovery-aware client with connection reuse and broadcast.
//!
//! An [`XClient`] sits on top of a [`Discovery`] and a pool of cached
//! [`Client`]s keyed by `protocol@address`. Unicast calls pick one server
//! per the configured mode; [`broadcast`](XClient::broadcast) fans a call
//! out to every known server, keeps the first successful reply, and
//! cancels the rest as soon as any branch fails.

use std::collections::HashMap;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::rpc::client::Client;
use crate::rpc::codec::Options;
use crate::rpc::discovery::{Discovery, SelectMode};
use crate::rpc::RpcError;

/// Load-balancing, connection-caching client front end.
///
/// # Examples
///
/// ```rust,no_run
/// use ika::rpc::{MultiServersDiscovery, Options, SelectMode, XClient};
///
/// # async fn example() -> Result<(), ika::rpc::RpcError> {
/// let discovery = MultiServersDiscovery::new(vec![
///     "tcp@10.0.0.1:7000".to_string(),
///     "tcp@10.0.0.2:7000".to_string(),
/// ]);
/// let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());
///
/// // Unicast: one server per the select mode.
/// let sum: i64 = xclient.call("Arith.Sum", &(1, 2)).await?;
///
/// // Broadcast: every server, first success wins.
/// let max: i64 = xclient.broadcast("Stats.Max", &()).await?;
/// # Ok(())
/// # }
/// ```
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    options: Options,
    clients: Mutex<HashMap<String, Client>>,
}

impl<D: Discovery> XClient<D> {
    pub fn new(discovery: D, mode: SelectMode, options: Options) -> Self {
        Self {
            discovery,
            mode,
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a healthy cached client for the address, dialing (and
    /// caching) a fresh one when there is none or the cached one has died.
    async fn client_for(&self, rpc_addr: &str) -> Result<Client, RpcError> {
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            let stale = clients.remove(rpc_addr);
            if let Some(stale) = stale {
                let _ = stale.close().await;
            }
        }

        let client = Client::xdial(rpc_addr, self.options.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr<Req, Resp>(
        &self,
        rpc_addr: &str,
        service_method: &str,
        args: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let client = self.client_for(rpc_addr).await?;
        client.call(service_method, args).await
    }

    /// Calls one server chosen by the discovery and select mode.
    pub async fn call<Req, Resp>(&self, service_method: &str, args: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, service_method, args).await
    }

    /// Fans the call out to every known server.
    ///
    /// The first successful reply becomes the result; later successes are
    /// dropped. The first failure cancels the remaining branches and is
    /// the error returned, even if some branch succeeded.
    pub async fn broadcast<Req, Resp>(
        &self,
        service_method: &str,
        args: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned + Send,
    {
        let servers = self.discovery.get_all().await?;
        let cancel = CancellationToken::new();

        let mut branches: FuturesUnordered<_> = servers
            .iter()
            .map(|rpc_addr| {
                let cancel = cancel.clone();
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(RpcError::Cancelled),
                        outcome = self.call_addr::<Req, Resp>(rpc_addr, service_method, args) => outcome,
                    }
                }
            })
            .collect();

        let mut reply = None;
        let mut first_error = None;
        while let Some(outcome) = branches.next().await {
            match outcome {
                Ok(value) => {
                    if reply.is_none() {
                        reply = Some(value);
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                        cancel.cancel();
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => reply.ok_or(RpcError::NoAvailableServers),
        }
    }

    /// Closes and drops every cached client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
    }
}
