//! Server discovery and selection.
//!
//! [`Discovery`] enumerates candidate servers and picks one per call,
//! either uniformly at random or round-robin. [`MultiServersDiscovery`]
//! holds a hand-maintained list; [`RegistryDiscovery`] keeps the list
//! fresh from a [`Registry`](crate::rpc::Registry) with a coarse refresh
//! window.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::Method;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::rpc::registry::{self, SERVERS_HEADER};
use crate::rpc::RpcError;

/// How `get` picks among the known servers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniform choice from a seeded RNG.
    Random,
    /// `i = (i + 1) mod n`, index persisted across calls.
    RoundRobin,
}

/// Enumerates candidate servers and picks one per call.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-fetches the server list from wherever it originates.
    async fn refresh(&self) -> Result<(), RpcError>;
    /// Replaces the server list.
    async fn update(&self, servers: Vec<String>) -> Result<(), RpcError>;
    /// Picks one server.
    async fn get(&self, mode: SelectMode) -> Result<String, RpcError>;
    /// Snapshot of every known server.
    async fn get_all(&self) -> Result<Vec<String>, RpcError>;
}

struct Roster {
    servers: Vec<String>,
    index: usize,
    rng: StdRng,
}

/// Discovery over a hand-maintained server list; no registry involved.
///
/// # Examples
///
/// ```rust
/// use ika::rpc::{Discovery, MultiServersDiscovery, SelectMode};
///
/// # async fn example() -> Result<(), ika::rpc::RpcError> {
/// let discovery = MultiServersDiscovery::new(vec![
///     "tcp@10.0.0.1:7000".to_string(),
///     "tcp@10.0.0.2:7000".to_string(),
/// ]);
/// let one = discovery.get(SelectMode::RoundRobin).await?;
/// let all = discovery.get_all().await?;
/// assert_eq!(all.len(), 2);
/// # Ok(())
/// # }
/// ```
pub struct MultiServersDiscovery {
    roster: Mutex<Roster>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = StdRng::from_entropy();
        // Random starting point so fleets of clients don't all walk the
        // list in phase.
        let index = rng.gen_range(0..usize::MAX / 2);
        Self {
            roster: Mutex::new(Roster { servers, index, rng }),
        }
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<(), RpcError> {
        Ok(()) // nothing upstream of a static list
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), RpcError> {
        self.roster.lock().servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, RpcError> {
        let mut roster = self.roster.lock();
        let count = roster.servers.len();
        if count == 0 {
            return Err(RpcError::NoAvailableServers);
        }

        match mode {
            SelectMode::Random => {
                let pick = roster.rng.gen_range(0..count);
                Ok(roster.servers[pick].clone())
            }
            SelectMode::RoundRobin => {
                let pick = roster.servers[roster.index % count].clone();
                roster.index = (roster.index + 1) % count;
                Ok(pick)
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>, RpcError> {
        Ok(self.roster.lock().servers.clone())
    }
}

/// How long a fetched server list stays fresh.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery backed by a registry's HTTP surface.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use ika::rpc::{Discovery, RegistryDiscovery, SelectMode};
///
/// # async fn example() -> Result<(), ika::rpc::RpcError> {
/// let discovery = RegistryDiscovery::new(
///     "http://127.0.0.1:9999/_ika_/registry",
///     Duration::ZERO, // default ten-second freshness window
/// );
/// let server = discovery.get(SelectMode::Random).await?;
/// # Ok(())
/// # }
/// ```
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry: String,
    timeout: Duration,
    last_update: Mutex<Option<Instant>>,
}

impl RegistryDiscovery {
    /// `registry` is the registry's full URL, for example
    /// `http://127.0.0.1:9999/_ika_/registry`. A zero timeout uses the
    /// default ten-second window.
    pub fn new(registry: impl Into<String>, timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() { DEFAULT_UPDATE_TIMEOUT } else { timeout };
        Self {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry: registry.into(),
            timeout,
            last_update: Mutex::new(None),
        }
    }

    fn fresh(&self) -> bool {
        self.last_update
            .lock()
            .map_or(false, |at| at + self.timeout > Instant::now())
    }

    fn stamp(&self) {
        *self.last_update.lock() = Some(Instant::now());
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    /// No-op inside the freshness window; otherwise asks the registry and
    /// replaces the list with the parsed, whitespace-trimmed entries.
    async fn refresh(&self) -> Result<(), RpcError> {
        if self.fresh() {
            return Ok(());
        }

        tracing::debug!(registry = %self.registry, "refreshing server list");
        let response = registry::simple_request(Method::GET, &self.registry, &[]).await?;
        let listed = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        let servers: Vec<String> = listed
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .collect();

        self.servers.update(servers).await?;
        self.stamp();
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), RpcError> {
        self.servers.update(servers).await?;
        self.stamp();
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, RpcError> {
        self.refresh().await?;
        self.servers.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>, RpcError> {
        self.refresh().await?;
        self.servers.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn three_servers() -> Vec<String> {
        vec![
            "tcp@127.0.0.1:7001".to_string(),
            "tcp@127.0.0.1:7002".to_string(),
            "tcp@127.0.0.1:7003".to_string(),
        ]
    }

    #[tokio::test]
    async fn empty_roster_has_no_pick() {
        let discovery = MultiServersDiscovery::new(Vec::new());
        assert!(matches!(
            discovery.get(SelectMode::Random).await.unwrap_err(),
            RpcError::NoAvailableServers,
        ));
    }

    #[tokio::test]
    async fn round_robin_cycles_through_every_server() {
        let discovery = MultiServersDiscovery::new(three_servers());

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(discovery.get(SelectMode::RoundRobin).await.unwrap());
        }

        // Two full cycles: each server exactly twice, in a stable order.
        assert_eq!(seen[..3].iter().collect::<HashSet<_>>().len(), 3);
        assert_eq!(seen[..3], seen[3..]);
    }

    #[tokio::test]
    async fn random_picks_stay_in_roster() {
        let discovery = MultiServersDiscovery::new(three_servers());
        let roster: HashSet<String> = three_servers().into_iter().collect();
        for _ in 0..20 {
            assert!(roster.contains(&discovery.get(SelectMode::Random).await.unwrap()));
        }
    }

    #[tokio::test]
    async fn update_replaces_the_roster() {
        let discovery = MultiServersDiscovery::new(three_servers());
        discovery.update(vec!["tcp@10.0.0.9:7001".to_string()]).await.unwrap();
        assert_eq!(discovery.get_all().await.unwrap(), ["tcp@10.0.0.9:7001"]);
    }

    #[tokio::test]
    async fn registry_discovery_honors_the_freshness_window() {
        // An unreachable registry URL: refresh would fail if attempted.
        let discovery =
            RegistryDiscovery::new("http://127.0.0.1:1/_ika_/registry", Duration::from_secs(60));
        discovery.update(three_servers()).await.unwrap();

        // update stamped the list fresh, so get() must not refresh.
        assert_eq!(discovery.get_all().await.unwrap().len(), 3);
    }
}
