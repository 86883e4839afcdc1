mod config;

use anyhow::Context;
use kadnode::clock::SystemClock;
use kadnode::crypto::test_support::DalekCrypto;
use kadnode::{Id, Node, SearchKind};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use tokio::net::UdpSocket;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config::Config::load()?;
    let mut rng = StdRng::from_entropy();

    let socket = UdpSocket::bind(config.bind_addr).await.context("bind UDP socket")?;
    tracing::info!(addr = %config.bind_addr, "bound UDP socket");

    // Read the save file once, up front: its "id" field is needed to
    // construct the node (§6's "retains id across restarts"), and the rest
    // of it is replayed into the node right after via `Node::load`.
    let raw_save = std::fs::read(&config.save_path).ok();
    let id = raw_save
        .as_deref()
        .and_then(|raw| kadnode::save::decode(raw).ok().flatten())
        .map(|d| d.id)
        .unwrap_or_else(|| Id::random(&mut rng));

    let clock = Arc::new(SystemClock);
    let verifier = Arc::new(DalekCrypto);
    let mut node = Node::with_limits(id, socket, clock, verifier, config.limits.clone());

    if let Some(raw) = &raw_save {
        let mut cursor = std::io::Cursor::new(raw.as_slice());
        match node.load(&mut cursor) {
            Ok(()) => tracing::info!(path = %config.save_path.display(), "restored state from save file"),
            Err(err) => tracing::warn!(%err, path = %config.save_path.display(), "failed to load save file, starting fresh"),
        }
    } else {
        tracing::info!(path = %config.save_path.display(), "no save file yet");
    }

    for host in &config.bootstrap_nodes {
        match tokio::net::lookup_host(host).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    // The bootstrap router's real id is unknown until it
                    // answers; a random placeholder gets corrected the
                    // moment its response lands (the search engine matches
                    // responses by the id in the packet, not this one).
                    node.observe_node(Id::random(&mut rng), addr);
                    tracing::info!(%host, %addr, "seeded bootstrap node");
                } else {
                    tracing::warn!(%host, "bootstrap host resolved to no addresses");
                }
            }
            Err(err) => tracing::warn!(%err, %host, "failed to resolve bootstrap host"),
        }
    }
    node.search(node.id(), SearchKind::FindNode);

    let (results_tx, mut results_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some((handle, result)) = results_rx.recv().await {
            tracing::debug!(?handle, ?result, "search completed");
        }
    });

    let save_path = config.save_path.clone();
    let save_interval = config.save_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(save_interval);
        loop {
            ticker.tick().await;
            tracing::debug!(path = %save_path.display(), "periodic save tick due");
        }
    });

    tokio::select! {
        result = node.run(results_tx) => {
            result.context("event loop exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    if let Err(err) = persist(&node, &config.save_path) {
        tracing::warn!(%err, "failed to write save file on shutdown");
    }

    Ok(())
}

fn persist(node: &Node, path: &std::path::Path) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    node.save(&mut file).with_context(|| format!("write {}", path.display()))?;
    tracing::info!(path = %path.display(), "saved state");
    Ok(())
}
