// tests/common/mod.rs
//! In-memory pool server and connector shared by the integration tests
#![allow(dead_code)]

use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pool_miner_rs::network::transport::{Connector, PoolLink};
use pool_miner_rs::{MinerError, MinerIdentity, Network};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

pub const ADDRESS: &str = "NQ19 G07J 7K8P B3F3 H1X5 XT1X D2NR RJ8X JXBP";

pub fn identity() -> MinerIdentity {
    MinerIdentity::new(Network::Test, ADDRESS, "integration".into())
}

/// What the next connection attempt does
#[derive(Debug, Clone, Copy)]
pub enum Attempt {
    Fail,
    Accept,
}

/// Server side of one accepted connection
pub struct ServerEnd {
    from_client: fmpsc::UnboundedReceiver<String>,
    to_client: fmpsc::UnboundedSender<Result<String, MinerError>>,
}

impl ServerEnd {
    /// Next frame from the client, parsed
    pub async fn recv(&mut self) -> Option<Value> {
        let frame = self.from_client.next().await?;
        Some(serde_json::from_str(&frame).expect("client sent invalid JSON"))
    }

    /// Next frame that is not a keepalive ping
    pub async fn recv_skipping_pings(&mut self) -> Option<Value> {
        loop {
            let message = self.recv().await?;
            if message["message"] != "ping" {
                return Some(message);
            }
        }
    }

    pub fn send(&self, message: Value) {
        self.send_raw(&message.to_string());
    }

    pub fn send_raw(&self, frame: &str) {
        self.to_client
            .unbounded_send(Ok(frame.to_string()))
            .expect("client side is gone");
    }

    /// Reads the registration and acknowledges it
    pub async fn accept_registration(&mut self) -> Value {
        let register = self.recv().await.expect("no registration");
        assert_eq!(register["message"], "register");
        self.send(serde_json::json!({"message": "registered"}));
        register
    }
}

/// Connector that follows a script, then accepts every attempt
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Attempt>>,
    connects: AtomicUsize,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl ScriptedConnector {
    pub fn new(
        script: impl IntoIterator<Item = Attempt>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(ScriptedConnector {
            script: Mutex::new(script.into_iter().collect()),
            connects: AtomicUsize::new(0),
            servers,
        });
        (connector, accepted)
    }

    /// Connector accepting every attempt
    pub fn accepting() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        Self::new(std::iter::empty::<Attempt>())
    }

    /// Connection attempts so far, failed ones included
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<PoolLink, MinerError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let attempt = self.script.lock().pop_front().unwrap_or(Attempt::Accept);
            if let Attempt::Fail = attempt {
                return Err(MinerError::ConnectionError(format!(
                    "{}:{} refused",
                    host, port
                )));
            }

            let (client_tx, from_client) = fmpsc::unbounded::<String>();
            let (to_client, client_rx) = fmpsc::unbounded::<Result<String, MinerError>>();
            let _ = self.servers.send(ServerEnd {
                from_client,
                to_client,
            });

            let sink = client_tx.sink_map_err(|e| MinerError::ConnectionError(e.to_string()));
            Ok::<_, MinerError>(PoolLink {
                sink: Box::pin(sink),
                stream: Box::pin(client_rx),
            })
        })
    }
}
