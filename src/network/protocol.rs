// src/network/protocol.rs
//! Pool wire protocol
//!
//! JSON text frames tagged by a `message` field. The client registers its
//! identity, the pool pushes `new-block` work notifications, the client answers
//! with `share` submissions, and both sides exchange `ping`/`pong`.

use crate::miner::template::{DEFAULT_NONCE_RANGE, HASH_SIZE, Share, WorkTemplate};
use crate::types::Network;
use crate::utils::error::MinerError;
use blake2::{Blake2s256, Digest};
use serde::{Deserialize, Serialize};

/// Version of the message set below
pub const PROTOCOL_VERSION: u32 = 1;

/// Identity of this miner, fixed for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerIdentity {
    /// Payout address
    pub wallet_address: String,
    /// Stable numeric device id
    pub device_id: u32,
    /// Human readable device name
    pub device_name: String,
}

impl MinerIdentity {
    /// Identity with a device id derived from `network` and the address
    pub fn new(network: Network, wallet_address: &str, device_name: String) -> Self {
        MinerIdentity {
            wallet_address: wallet_address.trim().to_string(),
            device_id: derive_device_id(network, wallet_address),
            device_name,
        }
    }
}

/// Address without spaces, upper case
pub fn normalize_address(address: &str) -> String {
    address
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Stable device id for this wallet on this network
///
/// First four bytes (big-endian) of Blake2s-256 over the network tag and the
/// normalized address. Formatting differences in the address do not change
/// the id.
pub fn derive_device_id(network: Network, wallet_address: &str) -> u32 {
    let mut hasher = Blake2s256::new();
    hasher.update(network.tag().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_address(wallet_address).as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Messages sent to the pool
#[derive(Debug, Serialize)]
#[serde(tag = "message", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage<'a> {
    /// Handshake
    Register {
        /// Payout address
        address: &'a str,
        /// Device id
        device_id: u32,
        /// Device name
        device_name: &'a str,
        /// Work distribution mode
        mode: &'static str,
        /// Client software version
        miner_version: String,
        /// [`PROTOCOL_VERSION`]
        protocol_version: u32,
    },
    /// Share submission
    Share {
        /// Template the share was found for
        template_id: &'a str,
        /// Winning nonce
        nonce: u64,
        /// Resulting hash, hex
        hash: String,
    },
    /// Liveness probe
    Ping,
    /// Liveness answer
    Pong,
}

impl<'a> ClientMessage<'a> {
    /// Registration message for `identity`
    pub fn register(identity: &'a MinerIdentity) -> Self {
        ClientMessage::Register {
            address: &identity.wallet_address,
            device_id: identity.device_id,
            device_name: &identity.device_name,
            mode: "smart",
            miner_version: format!("pool_miner-rs/{}", env!("CARGO_PKG_VERSION")),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Submission message for `share`
    pub fn share(share: &'a Share) -> Self {
        ClientMessage::Share {
            template_id: &share.template_id,
            nonce: share.nonce,
            hash: hex::encode(share.result_hash),
        }
    }

    /// Serialized frame
    pub fn to_frame(&self) -> Result<String, MinerError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages received from the pool
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Handshake accepted
    Registered,
    /// New work
    NewBlock(WorkTemplate),
    /// A share was credited
    ShareAccepted {
        /// Template of the share, when echoed
        template_id: Option<String>,
        /// Nonce of the share, when echoed
        nonce: Option<u64>,
    },
    /// A share was refused
    ShareRejected {
        /// Template of the share, when echoed
        template_id: Option<String>,
        /// Nonce of the share, when echoed
        nonce: Option<u64>,
        /// Pool-supplied reason
        reason: String,
    },
    /// Account balance held by the pool
    Balance {
        /// Total balance in atomic units
        balance: u64,
        /// Confirmed part of it
        confirmed_balance: u64,
    },
    /// Liveness probe
    Ping,
    /// Liveness answer
    Pong,
    /// Pool-side error notice
    Error {
        /// Pool-supplied reason
        reason: String,
    },
}

impl ServerMessage {
    /// Parses one text frame
    ///
    /// Unknown message types, missing fields and invalid work notifications
    /// all yield [`MinerError::ProtocolError`].
    pub fn parse(frame: &str) -> Result<Self, MinerError> {
        let wire: WireMessage = serde_json::from_str(frame)
            .map_err(|e| MinerError::ProtocolError(format!("Unparseable message: {}", e)))?;

        Ok(match wire {
            WireMessage::Registered => ServerMessage::Registered,
            WireMessage::NewBlock(block) => ServerMessage::NewBlock(block.try_into()?),
            WireMessage::ShareAccepted(result) => ServerMessage::ShareAccepted {
                template_id: result.template_id,
                nonce: result.nonce,
            },
            WireMessage::ShareRejected(result) => ServerMessage::ShareRejected {
                template_id: result.template_id,
                nonce: result.nonce,
                reason: result.reason.unwrap_or_else(|| "unspecified".into()),
            },
            WireMessage::Balance(update) => ServerMessage::Balance {
                balance: update.balance,
                confirmed_balance: update.confirmed_balance.unwrap_or(update.balance),
            },
            WireMessage::Ping => ServerMessage::Ping,
            WireMessage::Pong => ServerMessage::Pong,
            WireMessage::Error(notice) => ServerMessage::Error {
                reason: notice.reason.unwrap_or_else(|| "unspecified".into()),
            },
        })
    }
}

#[derive(Deserialize)]
#[serde(tag = "message", rename_all = "kebab-case")]
enum WireMessage {
    Registered,
    NewBlock(NewBlock),
    ShareAccepted(ShareResult),
    ShareRejected(ShareResult),
    Balance(BalanceUpdate),
    Ping,
    Pong,
    Error(ErrorNotice),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewBlock {
    template_id: String,
    header: String,
    target: String,
    block_target: Option<String>,
    height: u32,
    nonce_start: Option<u64>,
    nonce_end: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShareResult {
    template_id: Option<String>,
    nonce: Option<u64>,
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceUpdate {
    balance: u64,
    confirmed_balance: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorNotice {
    reason: Option<String>,
}

impl TryFrom<NewBlock> for WorkTemplate {
    type Error = MinerError;

    fn try_from(block: NewBlock) -> Result<Self, Self::Error> {
        if block.template_id.is_empty() {
            return Err(MinerError::ProtocolError("Empty templateId".into()));
        }

        let header = hex::decode(&block.header).map_err(|e| {
            MinerError::ProtocolError(format!("Template {}: bad header: {}", block.template_id, e))
        })?;
        if header.is_empty() {
            return Err(MinerError::ProtocolError(format!(
                "Template {}: empty header",
                block.template_id
            )));
        }

        let target = decode_target(&block.template_id, "target", &block.target)?;
        let block_target = block
            .block_target
            .as_deref()
            .map(|hex| decode_target(&block.template_id, "blockTarget", hex))
            .transpose()?;

        let start = block.nonce_start.unwrap_or(DEFAULT_NONCE_RANGE.start);
        let end = block.nonce_end.unwrap_or(DEFAULT_NONCE_RANGE.end);
        if start >= end {
            return Err(MinerError::ProtocolError(format!(
                "Template {}: empty nonce range {}..{}",
                block.template_id, start, end
            )));
        }

        Ok(WorkTemplate {
            template_id: block.template_id,
            header,
            target,
            block_target,
            height: block.height,
            nonce_range: start..end,
        })
    }
}

fn decode_target(template_id: &str, field: &str, hex: &str) -> Result<[u8; HASH_SIZE], MinerError> {
    let bytes = hex::decode(hex).map_err(|e| {
        MinerError::ProtocolError(format!("Template {}: bad {}: {}", template_id, field, e))
    })?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        MinerError::ProtocolError(format!(
            "Template {}: {} must be {} bytes, got {}",
            template_id,
            field,
            HASH_SIZE,
            bytes.len()
        ))
    })
}
