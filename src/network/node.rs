// src/network/node.rs
use crate::utils::error::MinerError;
use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Read access to account state and the transaction pool
pub trait Ledger: Send + Sync {
    /// Balance of `address` in atomic units
    fn balance<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<u64, MinerError>>;

    /// Number of transactions waiting in the mempool
    fn pending_transactions(&self) -> BoxFuture<'_, Result<usize, MinerError>>;
}

/// Changes observed on the consensus layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// The node reached consensus with the network
    Established,
    /// The node lost consensus
    Lost,
    /// A new chain head
    HeadChanged {
        /// Height of the new head
        height: u32,
    },
    /// A peer connected; carries its address
    PeerJoined(String),
    /// A peer disconnected; carries its address
    PeerLeft(String),
}

/// Configuration for connecting to a node's RPC interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// URL of the node's JSON-RPC endpoint (e.g., "http://127.0.0.1:8648")
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Username for RPC authentication (if required)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_user: Option<String>,
    /// Password for RPC authentication (if required)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_password: Option<String>,
    /// Seconds between consensus polls
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8648".into()
}

fn default_poll_secs() -> u64 {
    5
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            rpc_url: default_rpc_url(),
            rpc_user: None,
            rpc_password: None,
            poll_secs: default_poll_secs(),
        }
    }
}

/// One poll worth of node state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Whether consensus is established
    pub established: bool,
    /// Current head height
    pub height: u32,
    /// Addresses of connected peers
    pub peers: BTreeSet<String>,
}

/// Last known node state, turned into events by diffing snapshots
#[derive(Debug, Default)]
pub struct ChainView {
    established: bool,
    height: Option<u32>,
    peers: BTreeSet<String>,
}

impl ChainView {
    /// Applies a snapshot and returns what changed
    ///
    /// Peer changes come first, then the head, then the consensus change.
    pub fn apply(&mut self, snapshot: NodeSnapshot) -> Vec<ConsensusEvent> {
        let mut events = Vec::new();

        for peer in self.peers.difference(&snapshot.peers) {
            events.push(ConsensusEvent::PeerLeft(peer.clone()));
        }
        for peer in snapshot.peers.difference(&self.peers) {
            events.push(ConsensusEvent::PeerJoined(peer.clone()));
        }
        if self.height != Some(snapshot.height) {
            events.push(ConsensusEvent::HeadChanged {
                height: snapshot.height,
            });
        }
        if snapshot.established != self.established {
            events.push(if snapshot.established {
                ConsensusEvent::Established
            } else {
                ConsensusEvent::Lost
            });
        }

        self.established = snapshot.established;
        self.height = Some(snapshot.height);
        self.peers = snapshot.peers;
        events
    }

    /// Treats the node as unreachable: consensus is gone, peers unknown
    pub fn lose(&mut self) -> Vec<ConsensusEvent> {
        if !self.established {
            return Vec::new();
        }
        self.established = false;
        vec![ConsensusEvent::Lost]
    }
}

/// Client for interacting with a node's RPC interface
pub struct NodeClient {
    /// Configuration for the node connection
    config: NodeConfig,
    /// HTTP client for making RPC requests
    client: Client,
}

impl NodeClient {
    /// Creates a new NodeClient with the given configuration
    ///
    /// # Arguments
    /// * `config` - Node configuration containing RPC connection details
    pub fn new(config: NodeConfig) -> Self {
        NodeClient {
            config,
            client: Client::new(),
        }
    }

    /// Queries consensus state, head height and peers in one go
    ///
    /// # Returns
    /// * `Ok(NodeSnapshot)` - Current node state
    /// * `Err(MinerError)` - If any of the RPC calls failed
    pub async fn snapshot(&self) -> Result<NodeSnapshot, MinerError> {
        let consensus = self.rpc_call("consensus", json!([])).await?;
        let height = self.rpc_call("blockNumber", json!([])).await?;
        let peers = self.rpc_call("peerList", json!([])).await?;

        Ok(NodeSnapshot {
            established: consensus.as_str() == Some("established"),
            height: height
                .as_u64()
                .and_then(|h| u32::try_from(h).ok())
                .ok_or_else(|| MinerError::LedgerError("Invalid blockNumber result".into()))?,
            peers: peers
                .as_array()
                .map(|list| {
                    list.iter()
                        .filter_map(|peer| peer["address"].as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Polls the node and publishes consensus changes
    ///
    /// Runs until `cancel` fires or the receiver goes away. An unreachable
    /// node counts as lost consensus; polling continues.
    ///
    /// # Arguments
    /// * `events` - Channel receiving the consensus events
    /// * `cancel` - Stops the watcher
    pub async fn watch_consensus(
        &self,
        events: mpsc::UnboundedSender<ConsensusEvent>,
        cancel: CancellationToken,
    ) -> Result<(), MinerError> {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.poll_secs.max(1)));
        let mut view = ChainView::default();
        let mut reachable = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }

            let changes = match self.snapshot().await {
                Ok(snapshot) => {
                    if !reachable {
                        log::info!("Node at {} is reachable again", self.config.rpc_url);
                        reachable = true;
                    }
                    view.apply(snapshot)
                }
                Err(e) => {
                    if reachable {
                        log::warn!("Node at {} unreachable: {}", self.config.rpc_url, e);
                        reachable = false;
                    }
                    view.lose()
                }
            };

            for event in changes {
                if events.send(event).is_err() {
                    return Ok(());
                }
            }
        }
    }

    /// Makes an RPC call to the node
    ///
    /// # Arguments
    /// * `method` - The RPC method to call
    /// * `params` - Parameters for the RPC call
    ///
    /// # Returns
    /// * `Ok(Value)` - The `result` member of the response
    /// * `Err(MinerError)` - If the call failed or the node returned an error
    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, MinerError> {
        let mut request = self.client.post(&self.config.rpc_url).json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        }));
        if let Some(user) = &self.config.rpc_user {
            request = request.basic_auth(user, self.config.rpc_password.as_ref());
        }

        let mut response: Value = request
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            return Err(MinerError::LedgerError(format!(
                "{} failed: {}",
                method,
                error["message"].as_str().unwrap_or("unknown error")
            )));
        }
        Ok(response
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

impl Ledger for NodeClient {
    fn balance<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<u64, MinerError>> {
        Box::pin(async move {
            let result = self.rpc_call("getBalance", json!([address])).await?;
            result
                .as_u64()
                .ok_or_else(|| MinerError::LedgerError(format!("Invalid balance: {}", result)))
        })
    }

    fn pending_transactions(&self) -> BoxFuture<'_, Result<usize, MinerError>> {
        Box::pin(async move {
            let result = self.rpc_call("mempool", json!([])).await?;
            result["total"]
                .as_u64()
                .map(|total| total as usize)
                .ok_or_else(|| MinerError::LedgerError(format!("Invalid mempool: {}", result)))
        })
    }
}
