//! Cache peering over real HTTP listeners.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use ika::cache::{CacheError, GetterFn, Group, HttpPool, PeerPicker, WireFormat};

fn seed_db() -> HashMap<&'static str, &'static str> {
    HashMap::from([("Tom", "630"), ("Jack", "589"), ("Sam", "567")])
}

/// Group backed by the seed db, counting loader invocations per key.
fn counting_group(name: &'static str, loads: Arc<Mutex<HashMap<String, usize>>>) -> Arc<Group> {
    Group::new(
        name,
        2 << 10,
        GetterFn(move |key: String| {
            let loads = Arc::clone(&loads);
            async move {
                match seed_db().get(key.as_str()) {
                    Some(value) => {
                        *loads.lock().entry(key).or_insert(0) += 1;
                        Ok(value.as_bytes().to_vec())
                    }
                    None => Err(CacheError::NotFound { group: name.to_string(), key }),
                }
            }
        }),
    )
}

async fn spawn_pool(pool: HttpPool) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = format!("http://{}", listener.local_addr()?);
    tokio::spawn(HttpPool::serve(Arc::new(pool), listener));
    Ok(addr)
}

#[tokio::test]
async fn peers_fetch_protobuf_values_over_http() -> Result<()> {
    let loads = Arc::new(Mutex::new(HashMap::new()));
    let _group = counting_group("e2e-scores", Arc::clone(&loads));

    // The serving node; every key maps to itself, so it loads locally.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = format!("http://{}", listener.local_addr()?);
    let server_pool = Arc::new(HttpPool::new(&server_addr));
    server_pool.set_peers([server_addr.as_str()]);
    tokio::spawn(HttpPool::serve(Arc::clone(&server_pool), listener));

    // A second node whose ring points every key at the serving node.
    let client_pool = HttpPool::new("http://127.0.0.1:1");
    client_pool.set_peers([server_addr.as_str()]);
    let peer = client_pool.pick_peer("Tom").expect("remote owner expected");

    let value = peer.get("e2e-scores", "Tom").await?;
    assert_eq!(value.as_ref(), b"630");
    assert_eq!(loads.lock().get("Tom"), Some(&1));

    // Second fetch is served from the remote node's cache.
    let again = peer.get("e2e-scores", "Tom").await?;
    assert_eq!(again.as_ref(), b"630");
    assert_eq!(loads.lock().get("Tom"), Some(&1));
    Ok(())
}

#[tokio::test]
async fn legacy_mode_serves_raw_octets() -> Result<()> {
    let loads = Arc::new(Mutex::new(HashMap::new()));
    let _group = counting_group("e2e-scores-raw", loads);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = format!("http://{}", listener.local_addr()?);
    let server_pool = Arc::new(HttpPool::with_options(
        &server_addr,
        ika::cache::DEFAULT_BASE_PATH,
        WireFormat::Raw,
    ));
    tokio::spawn(HttpPool::serve(Arc::clone(&server_pool), listener));

    let client_pool =
        HttpPool::with_options("http://127.0.0.1:1", ika::cache::DEFAULT_BASE_PATH, WireFormat::Raw);
    client_pool.set_peers([server_addr.as_str()]);
    let peer = client_pool.pick_peer("Jack").expect("remote owner expected");

    let value = peer.get("e2e-scores-raw", "Jack").await?;
    assert_eq!(value.as_ref(), b"589");
    Ok(())
}

#[tokio::test]
async fn keys_with_reserved_characters_survive_the_path() -> Result<()> {
    let group_name = "e2e-echo";
    let _group = Group::new(
        group_name,
        2 << 10,
        GetterFn(|key: String| async move { Ok(key.into_bytes()) }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = format!("http://{}", listener.local_addr()?);
    let server_pool = Arc::new(HttpPool::new(&server_addr));
    tokio::spawn(HttpPool::serve(Arc::clone(&server_pool), listener));

    let client_pool = HttpPool::new("http://127.0.0.1:1");
    client_pool.set_peers([server_addr.as_str()]);
    let peer = client_pool.pick_peer("anything").expect("remote owner expected");

    for key in ["with space", "a/b", "tr%icky"] {
        let value = peer.get(group_name, key).await?;
        assert_eq!(value.as_ref(), key.as_bytes(), "key {key:?}");
    }
    Ok(())
}

#[tokio::test]
async fn unknown_groups_and_keys_fail_the_single_fetch() -> Result<()> {
    let server_addr = spawn_pool(HttpPool::new("http://placeholder")).await?;

    let client_pool = HttpPool::new("http://127.0.0.1:1");
    client_pool.set_peers([server_addr.as_str()]);
    let peer = client_pool.pick_peer("anything").expect("remote owner expected");

    let missing_group = peer.get("e2e-no-such-group", "k").await.unwrap_err();
    assert!(matches!(missing_group, CacheError::Peer(ref msg) if msg.contains("404")));
    Ok(())
}
