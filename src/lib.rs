#![no_std]
#![warn(missing_docs)]
//! L2CAP signaling and Security Manager core for a BLE stack.
//!
//! Two fixed L2CAP channels of an established ACL connection are handled
//! here: connection parameter update negotiation on the signaling channel
//! (CID 0x0005, [`signaling::SignalingManager`]) and LE Secure Connections
//! pairing on the security channel (CID 0x0006,
//! [`security_manager::SecurityManager`]).
//!
//! The enclosing stack demultiplexes inbound ACL payloads by channel id and
//! feeds them to the matching manager. Outbound traffic, controller commands
//! and user interaction go through capability traits
//! ([`signaling::SignalingOps`], [`security_manager::pairing::PairingOps`])
//! implemented by the embedder; controller completions re-enter the core via
//! [`security_manager::pairing::Event`]. All entry points run to completion
//! on the caller's thread and never block internally.

use bt_hci::param::{AddrKind, BdAddr};

pub use crate::security_manager::crypto::{IdentityResolvingKey, LongTermKey};
pub use crate::security_manager::{PassKey, Reason, SecurityLevel};
pub use crate::types::capabilities::IoCapabilities;

mod fmt;

pub(crate) mod codec;
pub mod config;
pub mod security_manager;
pub mod signaling;
pub mod types;

pub mod prelude {
    //! Convenience include of most commonly used types.
    pub use bt_hci::param::{AddrKind, BdAddr, ConnHandle, LeConnRole as Role};

    pub use crate::config::{ConnParamConfig, PairingMode};
    pub use crate::security_manager::pairing::{Event, PairingOps};
    pub use crate::security_manager::{BondInformation, PassKey, Reason, SecurityLevel, SecurityManager, TxPacket};
    pub use crate::signaling::{SignalFrame, SignalingManager, SignalingOps};
    pub use crate::types::capabilities::IoCapabilities;
    pub use crate::types::l2cap::{L2CAP_CID_LE_U_SECURITY_MANAGER, L2CAP_CID_LE_U_SIGNAL};
    pub use crate::{Address, Error, Identity, IdentityResolvingKey, LongTermKey};
}

/// A BLE address.
///
/// Every BLE device is identified by a unique *Bluetooth Device Address*, a
/// 48-bit identifier similar to a MAC address, qualified by an address kind
/// (*Public* or *Random*).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Address {
    /// Address type.
    pub kind: AddrKind,
    /// Address value.
    pub addr: BdAddr,
}

impl Address {
    /// Create a new random address.
    pub fn random(val: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::RANDOM,
            addr: BdAddr::new(val),
        }
    }

    /// Create a new public address.
    pub fn public(val: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::PUBLIC,
            addr: BdAddr::new(val),
        }
    }

    /// The 7-byte form used as input to the f5 and f6 functions: one type
    /// byte (0 = public, 1 = random) followed by the address in
    /// cryptographic byte order.
    pub fn to_bytes(&self) -> [u8; 7] {
        let mut bytes = [0; 7];
        bytes[0] = self.kind.into_inner();
        let mut addr_bytes = self.addr.into_inner();
        addr_bytes.reverse();
        bytes[1..].copy_from_slice(&addr_bytes);
        bytes
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let a = self.addr.into_inner();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[5], a[4], a[3], a[2], a[1], a[0]
        )
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Address {
    fn format(&self, fmt: defmt::Formatter) {
        let a = self.addr.into_inner();
        defmt::write!(
            fmt,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[5],
            a[4],
            a[3],
            a[2],
            a[1],
            a[0]
        )
    }
}

/// Identity of a peer device.
///
/// Both the address and the IRK are kept, because a peer may keep using its
/// static or public address even though an IRK was distributed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    /// Random static or public address
    pub bd_addr: BdAddr,
    /// Identity Resolving Key
    pub irk: Option<IdentityResolvingKey>,
}

#[cfg(feature = "defmt")]
impl defmt::Format for Identity {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "BdAddr({:X}) Irk({})", self.bd_addr, self.irk.is_some());
    }
}

impl Identity {
    /// Check whether the address matches the identity
    pub fn match_address(&self, address: &BdAddr) -> bool {
        if self.bd_addr == *address {
            return true;
        }
        if let Some(irk) = self.irk {
            return irk.resolve_address(address);
        }
        false
    }

    /// Check whether the given identity matches current identity
    pub fn match_identity(&self, identity: &Identity) -> bool {
        if self.match_address(&identity.bd_addr) {
            return true;
        }
        if let Some(irk) = identity.irk {
            if let Some(current_irk) = self.irk {
                return irk == current_irk;
            } else {
                return irk.resolve_address(&self.bd_addr);
            }
        }
        false
    }
}

/// Errors returned by the core.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Error from the security manager, carrying the SMP reason code.
    Security(Reason),
    /// Insufficient space in the buffer.
    InsufficientSpace,
    /// Invalid value.
    InvalidValue,
    /// Invalid state.
    InvalidState,
    /// Resource not found.
    NotFound,
    /// Out of memory.
    OutOfMemory,
    /// Unsupported operation.
    NotSupported,
    /// Connection is disconnected.
    Disconnected,
    /// Codec error.
    CodecError(codec::Error),
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        match error {
            codec::Error::InsufficientSpace => Error::InsufficientSpace,
            codec::Error::InvalidValue => Error::CodecError(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_to_bytes_is_type_plus_reversed_addr() {
        let addr = Address::public([0x56, 0x12, 0x37, 0x37, 0xbf, 0xce]);
        assert_eq!(addr.to_bytes(), [0x00, 0xce, 0xbf, 0x37, 0x37, 0x12, 0x56]);

        let addr = Address::random([0x56, 0x12, 0x37, 0x37, 0xbf, 0xce]);
        assert_eq!(addr.to_bytes()[0], 0x01);
    }

    #[test]
    fn identity_matches_own_address() {
        let identity = Identity {
            bd_addr: BdAddr::new([1, 2, 3, 4, 5, 6]),
            irk: None,
        };
        assert!(identity.match_address(&BdAddr::new([1, 2, 3, 4, 5, 6])));
        assert!(!identity.match_address(&BdAddr::new([6, 5, 4, 3, 2, 1])));
    }

    #[test]
    fn identity_resolves_private_address_via_irk() {
        let identity = Identity {
            bd_addr: BdAddr::new([1, 2, 3, 4, 5, 6]),
            irk: Some(IdentityResolvingKey::new(0x8b3958c158ed64467bd27bc90d3cf54d)),
        };
        // Resolvable private address generated from the same IRK.
        assert!(identity.match_address(&BdAddr::new([0x92, 0xF2, 0x8F, 0x84, 0x72, 0x4F])));
    }
}
