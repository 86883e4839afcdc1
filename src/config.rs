use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use kadnode::NodeLimits;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub save_path: PathBuf,
    pub save_interval: Duration,
    pub bootstrap_nodes: Vec<String>,
    pub limits: NodeLimits,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    fn from_env() -> anyhow::Result<Self> {
        let bind_addr = SocketAddr::from_str(&env_string("KADNODE_BIND", "0.0.0.0:6881"))
            .map_err(|e| anyhow::anyhow!("parse KADNODE_BIND: {e}"))?;

        let save_path = env_pathbuf("KADNODE_SAVE_PATH", "kadnode.save");
        let save_interval = Duration::from_secs(env_u64("KADNODE_SAVE_INTERVAL_SECS", 5 * 60));

        let bootstrap_nodes = env_csv_strings(
            "KADNODE_BOOTSTRAP",
            &["router.bittorrent.com:6881", "dht.transmissionbt.com:6881", "router.utorrent.com:6881"],
        );

        let limits = NodeLimits {
            ping_timeout: Duration::from_secs(env_u64("KADNODE_PING_TIMEOUT_SECS", 10)),
            search_query_timeout: Duration::from_secs(env_u64("KADNODE_SEARCH_QUERY_TIMEOUT_SECS", 10)),
            bucket_node_timeout: Duration::from_secs(env_u64("KADNODE_BUCKET_NODE_TIMEOUT_SECS", 15 * 60)),
            bucket_refresh_timeout: Duration::from_secs(env_u64("KADNODE_BUCKET_REFRESH_TIMEOUT_SECS", 15 * 60)),
            peer_timeout: Duration::from_secs(env_u64("KADNODE_PEER_TIMEOUT_SECS", 2 * 60 * 60)),
            put_timeout: Duration::from_secs(env_u64("KADNODE_PUT_TIMEOUT_SECS", 2 * 60 * 60)),
            token_rotate_interval: Duration::from_secs(env_u64("KADNODE_TOKEN_ROTATE_INTERVAL_SECS", 5 * 60)),
        };

        Ok(Self { bind_addr, save_path, save_interval, bootstrap_nodes, limits })
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_opt_string(name).unwrap_or_else(|| default.to_string())
}

fn env_pathbuf(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(name, default))
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok()).unwrap_or(default)
}

fn env_csv_strings(name: &str, defaults: &[&str]) -> Vec<String> {
    if let Some(s) = env_opt_string(name) {
        let v: Vec<String> = s.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect();
        if !v.is_empty() {
            return v;
        }
    }
    defaults.iter().map(|s| s.to_string()).collect()
}
