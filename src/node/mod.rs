//! Ledger node supervision.
//!
//! In managed mode the agent owns the node process: it stops a stale node
//! left behind by a previous run, initialises a fresh test chain when asked
//! to, spawns the node and waits for its RPC endpoint. The child is killed
//! when the returned [`NodeEndpoint`] is dropped.

use alloy::providers::{Provider, RootProvider};
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, NodeConfig, OpMode};
use crate::error::{AgentError, Result};

/// A reachable node, and its process when we started it
#[derive(Debug)]
pub struct NodeEndpoint {
    pub rpc_url: String,
    child: Option<Child>,
}

impl NodeEndpoint {
    /// Process id of the managed node
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Stop the managed node, if any
    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.kill().await {
                Ok(()) => info!("Node process stopped"),
                Err(e) => warn!("Failed to stop node process: {}", e),
            }
        }
    }
}

/// Make sure a node answers on `node_rpc_url`, starting one if configured
pub async fn ensure_node_running(config: &AgentConfig) -> Result<NodeEndpoint> {
    let node = &config.node;
    let rpc_url = config.node_rpc_url.clone();
    let provider = probe_provider(&rpc_url)?;

    let child = if node.managed {
        Some(start_node(node, config.op_mode, &provider).await?)
    } else {
        wait_for_rpc(&provider, node).await?;
        None
    };

    let endpoint = NodeEndpoint { rpc_url, child };
    if let Some(enode) = &node.enode {
        connect_peer(&provider, enode, node).await?;
    }

    info!("Node ready at {}", endpoint.rpc_url);
    Ok(endpoint)
}

fn probe_provider(rpc_url: &str) -> Result<RootProvider> {
    let url: url::Url = rpc_url
        .parse()
        .map_err(|e| AgentError::InvalidConfig(format!("Invalid RPC URL {}: {}", rpc_url, e)))?;
    Ok(RootProvider::new_http(url))
}

async fn start_node(node: &NodeConfig, op_mode: OpMode, provider: &RootProvider) -> Result<Child> {
    stop_stale_node(&node.lock_file()).await;

    if op_mode == OpMode::Test && prepare_test_chain(node)? {
        init_chain(node).await?;
    }

    let mut child = spawn_node(node)?;
    let pid = child.id().unwrap_or_default();

    tokio::time::sleep(Duration::from_millis(node.startup_wait_ms)).await;
    if let Some(status) = child.try_wait()? {
        return Err(AgentError::NodeStartup(format!(
            "node exited during startup with {}; see {}",
            status,
            node.log_file.display()
        )));
    }

    if let Some(parent) = node.lock_file().parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(node.lock_file(), pid.to_string())?;
    info!("Node running, PID {}", pid);

    wait_for_rpc(provider, node).await?;
    Ok(child)
}

/// Terminate the node recorded in the lock file by a previous run
async fn stop_stale_node(lock_file: &Path) {
    let Ok(contents) = fs::read_to_string(lock_file) else {
        return;
    };

    match contents.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => {
            if terminate(pid) {
                debug!("Old node was running at PID {}, terminated", pid);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        _ => warn!("Ignoring unreadable lock file {}", lock_file.display()),
    }

    if let Err(e) = fs::remove_file(lock_file) {
        warn!("Failed to remove stale lock file {}: {}", lock_file.display(), e);
    }
}

#[cfg(unix)]
fn terminate(pid: i32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // ESRCH means the process is already gone
    kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn terminate(pid: i32) -> bool {
    warn!("Cannot signal stale node PID {} on this platform", pid);
    false
}

/// Fresh test chain: wipe the data dir and write the genesis file.
///
/// Returns true when the chain needs `init`; an existing genesis file means
/// the chain was initialised by an earlier run.
fn prepare_test_chain(node: &NodeConfig) -> Result<bool> {
    let Some(genesis_file) = &node.genesis_file else {
        return Ok(false);
    };
    if genesis_file.exists() {
        return Ok(false);
    }

    let genesis = node.genesis.as_deref().ok_or_else(|| {
        AgentError::NodeStartup(format!(
            "{} does not exist and node.genesis is not set",
            genesis_file.display()
        ))
    })?;
    let genesis: serde_json::Value = serde_json::from_str(genesis)
        .map_err(|e| AgentError::NodeStartup(format!("node.genesis is not valid JSON: {}", e)))?;

    warn!("Fresh start, removing chain data in {}", node.data_dir.display());
    match fs::remove_dir_all(&node.data_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = genesis_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(genesis_file, serde_json::to_vec_pretty(&genesis)?)?;
    Ok(true)
}

async fn init_chain(node: &NodeConfig) -> Result<()> {
    let Some(genesis_file) = &node.genesis_file else {
        return Ok(());
    };
    info!("Initializing chain in {}", node.data_dir.display());

    let log = node_log(&node.log_file)?;
    let status = Command::new(&node.geth)
        .arg("--datadir")
        .arg(&node.data_dir)
        .arg("init")
        .arg(genesis_file)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .status()
        .await
        .map_err(|e| AgentError::NodeStartup(format!("failed to run {} init: {}", node.geth, e)))?;

    if !status.success() {
        return Err(AgentError::NodeStartup(format!(
            "{} init exited with {}",
            node.geth, status
        )));
    }
    Ok(())
}

fn spawn_node(node: &NodeConfig) -> Result<Child> {
    let (program, args) = node
        .command
        .split_first()
        .ok_or_else(|| AgentError::InvalidConfig("node.command is empty".to_string()))?;

    debug!("Running node: {}", node.command.join(" "));
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(node_log(&node.log_file)?))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::NodeStartup(format!("failed to spawn {}: {}", program, e)))
}

fn node_log(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

async fn wait_for_rpc(provider: &RootProvider, node: &NodeConfig) -> Result<u64> {
    poll_until(node.rpc_retries, node.poll_interval(), || async {
        provider.get_block_number().await.ok()
    })
    .await
    .ok_or_else(|| {
        AgentError::NodeStartup(format!(
            "RPC endpoint did not answer after {} attempts",
            node.rpc_retries
        ))
    })
}

async fn connect_peer(provider: &RootProvider, enode: &str, node: &NodeConfig) -> Result<()> {
    let added: bool = provider
        .raw_request("admin_addPeer".into(), (enode.to_string(),))
        .await
        .map_err(|e| AgentError::NodeStartup(format!("admin_addPeer failed: {}", e)))?;
    if !added {
        warn!("Node refused peer {}", enode);
    }

    let peers = poll_until(node.peer_retries, node.poll_interval(), || async {
        provider
            .raw_request::<_, Vec<serde_json::Value>>(
                "admin_peers".into(),
                Vec::<serde_json::Value>::new(),
            )
            .await
            .ok()
            .filter(|peers| !peers.is_empty())
    })
    .await
    .ok_or_else(|| AgentError::NodeStartup("no peers connected".to_string()))?;

    info!("Connected peers: {}", peers.len());
    Ok(())
}

/// Run `probe` up to `attempts` times, `interval` apart, until it yields
async fn poll_until<T, F, Fut>(attempts: u32, interval: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for attempt in 1..=attempts.max(1) {
        if let Some(value) = probe().await {
            return Some(value);
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    None
}
