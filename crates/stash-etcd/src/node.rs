//! Self-hosted etcd member.
//!
//! Peers are found by resolving a load-balancer DNS name. This host's own
//! address is appended, members are named `node<N>` by their position in
//! that list, and the cluster state is `existing` once the data directory
//! holds anything.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};

use stash_core::{Logger, StoreError, StoreResult};

use crate::client::check_health;

pub const DEFAULT_CLIENT_PORT: u16 = 2379;
pub const DEFAULT_PEER_PORT: u16 = 2380;
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DNS_TIMEOUT: Duration = Duration::from_millis(100);

const HEALTH_POLL: Duration = Duration::from_millis(200);

/// How to launch the local etcd member.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// DNS name resolving to the other members. May be empty.
    pub load_balancer: String,
    pub cluster_token: String,
    pub data_dir: PathBuf,
    /// Path to the `etcd` executable.
    pub binary: PathBuf,
    pub startup_timeout: Duration,
    pub client_port: u16,
    pub peer_port: u16,
    /// Address to advertise instead of the detected one.
    pub advertise_ip: Option<Ipv4Addr>,
}

impl NodeConfig {
    pub fn new(
        load_balancer: impl Into<String>,
        cluster_token: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            load_balancer: load_balancer.into(),
            cluster_token: cluster_token.into(),
            data_dir: data_dir.into(),
            binary: PathBuf::from("etcd"),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            client_port: DEFAULT_CLIENT_PORT,
            peer_port: DEFAULT_PEER_PORT,
            advertise_ip: None,
        }
    }
}

/// A running member. Killed when dropped.
#[derive(Debug)]
pub struct EtcdNode {
    name: String,
    client_urls: Vec<String>,
    child: Child,
}

impl EtcdNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Client URLs of every known member, this one included.
    pub fn client_urls(&self) -> &[String] {
        &self.client_urls
    }

    pub async fn stop(&mut self) -> StoreResult<()> {
        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

/// IPv4 addresses of `name`, sorted as strings. Empty on any failure.
pub async fn resolve_peers(name: &str) -> Vec<Ipv4Addr> {
    if name.is_empty() {
        return Vec::new();
    }
    let lookup = tokio::net::lookup_host((name, 0));
    let Ok(Ok(addrs)) = tokio::time::timeout(DNS_TIMEOUT, lookup).await else {
        return Vec::new();
    };
    let mut ips: Vec<Ipv4Addr> = addrs
        .filter_map(|a| match a.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();
    ips.sort_by_key(|ip| ip.to_string());
    ips.dedup();
    ips
}

/// This host's outbound non-loopback IPv4 address.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Resolved peers followed by `local`, without duplicates.
pub fn member_list(resolved: &[Ipv4Addr], local: Ipv4Addr) -> Vec<Ipv4Addr> {
    let mut members = Vec::with_capacity(resolved.len() + 1);
    for ip in resolved.iter().copied().chain(std::iter::once(local)) {
        if !members.contains(&ip) {
            members.push(ip);
        }
    }
    members
}

/// `node<N>` where N is the position of `local` in `members`.
pub fn node_name(members: &[Ipv4Addr], local: Ipv4Addr) -> StoreResult<String> {
    members
        .iter()
        .position(|ip| *ip == local)
        .map(|i| format!("node{i}"))
        .ok_or_else(|| {
            StoreError::Configuration(format!("{local} is not among the members {members:?}"))
        })
}

/// `node0=http://ip0:port,node1=http://ip1:port,...`
pub fn initial_cluster(members: &[Ipv4Addr], peer_port: u16) -> String {
    members
        .iter()
        .enumerate()
        .map(|(i, ip)| format!("node{i}=http://{ip}:{peer_port}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// `existing` when `dir` has entries, `new` otherwise.
pub fn cluster_state(dir: &Path) -> &'static str {
    match std::fs::read_dir(dir).map(|mut entries| entries.next().is_some()) {
        Ok(true) => "existing",
        _ => "new",
    }
}

/// Command-line flags for the member.
pub fn command_args(config: &NodeConfig, members: &[Ipv4Addr], local: Ipv4Addr) -> StoreResult<Vec<String>> {
    let client = format!("http://{local}:{}", config.client_port);
    let peer = format!("http://{local}:{}", config.peer_port);
    Ok(vec![
        "--name".into(),
        node_name(members, local)?,
        "--data-dir".into(),
        config.data_dir.display().to_string(),
        "--listen-client-urls".into(),
        client.clone(),
        "--advertise-client-urls".into(),
        client,
        "--listen-peer-urls".into(),
        peer.clone(),
        "--initial-advertise-peer-urls".into(),
        peer,
        "--initial-cluster".into(),
        initial_cluster(members, config.peer_port),
        "--initial-cluster-token".into(),
        config.cluster_token.clone(),
        "--initial-cluster-state".into(),
        cluster_state(&config.data_dir).into(),
    ])
}

/// Launch the member and wait until it reports healthy.
///
/// Gives up after `startup_timeout`, killing the process.
pub async fn start(config: &NodeConfig, logger: &Arc<dyn Logger>) -> StoreResult<EtcdNode> {
    let local = match config.advertise_ip.or_else(local_ip) {
        Some(ip) => ip,
        None => {
            return Err(StoreError::Configuration(
                "cannot determine a local IPv4 address to advertise".into(),
            ))
        }
    };
    let resolved = resolve_peers(&config.load_balancer).await;
    let members = member_list(&resolved, local);
    let args = command_args(config, &members, local)?;
    let name = node_name(&members, local)?;
    logger.info(format_args!(
        "starting etcd {name}, cluster state {}",
        cluster_state(&config.data_dir)
    ));
    logger.debug(format_args!("etcd args: {args:?}"));

    std::fs::create_dir_all(&config.data_dir)?;
    let mut child = Command::new(&config.binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            StoreError::BackendUnavailable(format!("spawn {}: {e}", config.binary.display()))
        })?;

    let own_url = format!("http://{local}:{}", config.client_port);
    let http = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + config.startup_timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(StoreError::BackendUnavailable(format!(
                "etcd exited during startup: {status}"
            )));
        }
        if check_health(&http, &own_url, HEALTH_POLL * 5).await {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            // Best effort; kill_on_drop covers a failed kill.
            let _ = child.kill().await;
            return Err(StoreError::BackendUnavailable(format!(
                "etcd {name} took longer than {:?} to start",
                config.startup_timeout
            )));
        }
        tokio::time::sleep(HEALTH_POLL).await;
    }
    logger.info(format_args!("etcd {name} is ready"));

    let client_urls = members
        .iter()
        .map(|ip| format!("http://{ip}:{}", config.client_port))
        .collect();
    Ok(EtcdNode {
        name,
        client_urls,
        child,
    })
}
