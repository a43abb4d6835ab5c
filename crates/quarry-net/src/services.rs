//! Service-flag advertisements and backend peer descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use tracing::debug;

use crate::error::NetError;

/// Bitfield of services a peer advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    /// No services.
    pub const NONE: ServiceFlags = ServiceFlags(0);
    /// Serves the full block chain.
    pub const NETWORK: ServiceFlags = ServiceFlags(1 << 0);
    /// Serves witness data in blocks and transactions.
    pub const WITNESS: ServiceFlags = ServiceFlags(1 << 3);
    /// Has discarded historical block bodies.
    pub const PRUNED: ServiceFlags = ServiceFlags(1 << 11);

    /// Whether every flag in `other` is set.
    pub fn has(self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Decode the backend's hex form: a 64-bit value, big-endian, as
    /// reported per peer by the backend's connection list.
    pub fn from_hex(s: &str) -> Result<Self, NetError> {
        let bytes = hex::decode(s).map_err(|e| NetError::InvalidServices {
            value: s.to_string(),
            reason: e.to_string(),
        })?;
        let bytes: [u8; 8] = bytes.try_into().map_err(|_| NetError::InvalidServices {
            value: s.to_string(),
            reason: "expected 8 bytes".to_string(),
        })?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl BitOr for ServiceFlags {
    type Output = ServiceFlags;

    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Services a peer must offer to serve us historical blocks.
pub const REQUIRED_SERVICES: ServiceFlags =
    ServiceFlags(ServiceFlags::NETWORK.0 | ServiceFlags::WITNESS.0);

/// One row of the backend's peer list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Peer address as the backend dials it (may be an onion address).
    pub addr: String,
    /// Hex-encoded service flags.
    pub services: String,
}

/// Keep only candidates able to serve arbitrary witness blocks: full nodes
/// signalling witness support that have not pruned their block store.
///
/// Candidates whose flag string does not decode are dropped individually;
/// one malformed row should not cost the whole refresh pass.
pub fn filter_eligible(peers: Vec<PeerDescriptor>) -> Vec<PeerDescriptor> {
    peers
        .into_iter()
        .filter(|peer| match ServiceFlags::from_hex(&peer.services) {
            Ok(services) => {
                services.has(REQUIRED_SERVICES) && !services.has(ServiceFlags::PRUNED)
            }
            Err(err) => {
                debug!(addr = %peer.addr, error = %err, "Dropping peer with undecodable services");
                false
            }
        })
        .collect()
}
