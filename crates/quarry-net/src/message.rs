//! Typed peer-to-peer messages.
//!
//! The wire codec and framing live in the session layer injected through
//! [`crate::DialFn`]; this module only defines the decoded message values
//! that cross the session boundary.

use quarry_chain::{Block, BlockHash};

use crate::services::ServiceFlags;

/// Protocol version announced in our version message.
pub const PROTOCOL_VERSION: u32 = 70016;

/// User agent announced in our version message.
pub const USER_AGENT: &str = concat!("/quarry:", env!("CARGO_PKG_VERSION"), "/");

/// Maximum number of inventory vectors a single message may carry.
pub const MAX_INV_PER_MSG: usize = 50_000;

/// The kind of object an inventory vector refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvType {
    /// A transaction.
    Tx,
    /// A block.
    Block,
    /// A block including witness data.
    WitnessBlock,
}

/// A `(type, hash)` pair identifying an object to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvVect {
    /// Referenced object kind.
    pub inv_type: InvType,
    /// Content hash of the object.
    pub hash: BlockHash,
}

impl InvVect {
    /// Inventory vector for a block.
    pub fn block(hash: BlockHash) -> Self {
        Self {
            inv_type: InvType::Block,
            hash,
        }
    }
}

/// The version message opening the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// Highest protocol version the sender speaks.
    pub protocol_version: u32,
    /// Services the sender offers.
    pub services: ServiceFlags,
    /// Sender's clock in unix seconds.
    pub timestamp: i64,
    /// Random nonce used to detect self connections.
    pub nonce: u64,
    /// Free-form client identifier.
    pub user_agent: String,
    /// Sender's best block height.
    pub start_height: i32,
    /// Whether the sender wants transaction announcements.
    pub relay_txs: bool,
}

/// A bulk data request carrying up to [`MAX_INV_PER_MSG`] inventory vectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetDataMessage {
    /// Requested inventory.
    pub inventory: Vec<InvVect>,
}

impl GetDataMessage {
    /// An empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an inventory vector. Fails once the protocol limit is reached.
    pub fn add_inv(&mut self, inv: InvVect) -> Result<(), InvVect> {
        if self.inventory.len() >= MAX_INV_PER_MSG {
            return Err(inv);
        }
        self.inventory.push(inv);
        Ok(())
    }

    /// Number of inventory vectors carried.
    pub fn len(&self) -> usize {
        self.inventory.len()
    }

    /// Whether the request carries no inventory.
    pub fn is_empty(&self) -> bool {
        self.inventory.is_empty()
    }
}

/// A decoded message exchanged with a remote peer.
#[derive(Debug, Clone)]
pub enum NetworkMessage {
    /// Handshake opener.
    Version(VersionMessage),
    /// Handshake acknowledgement.
    VerAck,
    /// Bulk data request.
    GetData(GetDataMessage),
    /// A full block, witness data included.
    Block(Block),
    /// Unsolicited inventory announcement.
    Inv(Vec<InvVect>),
    /// Keepalive probe.
    Ping(u64),
    /// Keepalive answer.
    Pong(u64),
}

impl NetworkMessage {
    /// The wire command name, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::VerAck => "verack",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::Block(_) => "block",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
        }
    }
}
