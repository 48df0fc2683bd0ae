// tests/end_to_end.rs
//! Consensus, pool session and workers driven together by the controller

mod common;

use common::{ScriptedConnector, identity};
use futures::future::BoxFuture;
use pool_miner_rs::network::pool::{PoolConfig, SessionSettings};
use pool_miner_rs::{
    Algorithm, Blake2sAlgo, ConsensusEvent, ControllerSettings, Ledger, MinerController,
    MinerError, PoolSettings, WorkerPool,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const HEADER: [u8; 4] = [0x0a, 0x0b, 0x0c, 0x0d];

struct FixedLedger;

impl Ledger for FixedLedger {
    fn balance<'a>(&'a self, _address: &'a str) -> BoxFuture<'a, Result<u64, MinerError>> {
        Box::pin(async { Ok(1_250_000) })
    }

    fn pending_transactions(&self) -> BoxFuture<'_, Result<usize, MinerError>> {
        Box::pin(async { Ok(3) })
    }
}

fn controller(connector: Arc<ScriptedConnector>) -> MinerController {
    let settings = ControllerSettings {
        threads: 2,
        pool: PoolConfig::default(),
        session: SessionSettings::default(),
        stats_samples: 5,
    };
    let pool = WorkerPool::new(Arc::new(Blake2sAlgo::new()), PoolSettings::default()).unwrap();
    MinerController::new(identity(), settings, pool, connector, Arc::new(FixedLedger))
}

/// A template whose only nonce meets the (trivial) target
fn single_nonce_block(template_id: &str) -> serde_json::Value {
    json!({
        "message": "new-block",
        "templateId": template_id,
        "header": hex::encode(HEADER),
        "target": "ff".repeat(32),
        "height": 7,
        "nonceStart": 0,
        "nonceEnd": 1,
    })
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn single_share_reaches_the_pool() {
    let (connector, mut servers) = ScriptedConnector::accepting();
    let controller = controller(connector.clone());
    let pool = controller.worker_pool();
    let (consensus_tx, consensus_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(controller.run(consensus_rx, async move {
        let _ = stop_rx.await;
    }));

    consensus_tx.send(ConsensusEvent::Established).unwrap();
    let mut server = timeout(Duration::from_secs(5), servers.recv())
        .await
        .unwrap()
        .unwrap();
    server.accept_registration().await;
    server.send(single_nonce_block("tpl-e2e"));

    let share = timeout(Duration::from_secs(10), server.recv_skipping_pings())
        .await
        .expect("no share submitted")
        .unwrap();
    let expected = Blake2sAlgo::new().hash(&HEADER, 0).unwrap();
    assert_eq!(share["message"], "share");
    assert_eq!(share["templateId"], "tpl-e2e");
    assert_eq!(share["nonce"], 0);
    assert_eq!(share["hash"], hex::encode(expected));

    // The range holds a single nonce, so nothing else may follow
    assert!(
        timeout(Duration::from_millis(500), server.recv_skipping_pings())
            .await
            .is_err()
    );

    // Pausing and resuming searches the same template again without resubmitting
    consensus_tx.send(ConsensusEvent::Lost).unwrap();
    eventually("workers to pause", || !pool.is_running()).await;
    consensus_tx.send(ConsensusEvent::Established).unwrap();
    eventually("workers to resume", || pool.is_running()).await;
    assert!(
        timeout(Duration::from_millis(500), server.recv_skipping_pings())
            .await
            .is_err(),
        "share submitted twice"
    );

    stop_tx.send(()).unwrap();
    timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn consensus_gates_the_workers() {
    let (connector, mut servers) = ScriptedConnector::accepting();
    let controller = controller(connector.clone());
    let pool = controller.worker_pool();
    let (consensus_tx, consensus_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(controller.run(consensus_rx, async move {
        let _ = stop_rx.await;
    }));

    // No pool connection before consensus
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.connects(), 0);
    assert!(!pool.is_running());

    consensus_tx.send(ConsensusEvent::Established).unwrap();
    let mut server = timeout(Duration::from_secs(5), servers.recv())
        .await
        .unwrap()
        .unwrap();
    server.accept_registration().await;
    eventually("workers to start", || pool.is_running()).await;
    assert_eq!(pool.active_workers(), 2);

    consensus_tx.send(ConsensusEvent::Lost).unwrap();
    eventually("workers to pause", || !pool.is_running()).await;
    assert!(pool.assignments().is_empty());

    consensus_tx.send(ConsensusEvent::Established).unwrap();
    eventually("workers to resume", || pool.is_running()).await;
    assert_eq!(connector.connects(), 1, "consensus changes keep the session");

    stop_tx.send(()).unwrap();
    timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!pool.is_running());
}
