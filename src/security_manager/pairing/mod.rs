//! LE Secure Connections pairing state machines, split by role.

use bt_hci::param::ConnHandle;
use rand_core::{CryptoRng, RngCore};

use crate::security_manager::crypto::{DhKey, IdentityResolvingKey, PublicKey};
use crate::security_manager::types::{Command, PassKey, SecurityLevel};
use crate::security_manager::{BondInformation, TxPacket};
use crate::{Address, Error, IoCapabilities, LongTermKey};

pub(crate) mod initiator;
pub(crate) mod responder;
mod util;

/// Capabilities the pairing state machine needs from the enclosing stack.
///
/// One implementation per connection; all SMP traffic and controller
/// commands for the pairing attempt flow through it.
pub trait PairingOps {
    /// The ACL connection this pairing attempt runs on.
    fn connection_handle(&self) -> ConnHandle;
    /// Address of the peer on this connection.
    fn peer_address(&self) -> Address;
    /// Send an SMP PDU on the security channel (CID 0x0006).
    fn try_send_packet(&mut self, packet: TxPacket) -> Result<(), Error>;
    /// Issue `LE Read Local P-256 Public Key`. The result re-enters the
    /// state machine as [`Event::LocalPublicKey`].
    fn request_local_public_key(&mut self) -> Result<(), Error>;
    /// Issue `LE Generate DHKey` for the peer's public key. The result
    /// re-enters the state machine as [`Event::DhKey`].
    fn request_dh_key(&mut self, peer_public_key: &PublicKey) -> Result<(), Error>;
    /// The LTK is ready for link encryption. As initiator, issue
    /// `LE Start Encryption`; as responder, hold the key for the imminent
    /// `LE Long Term Key Request` from the controller.
    fn try_enable_encryption(&mut self, ltk: &LongTermKey) -> Result<(), Error>;
    /// Show the 6-digit numeric comparison code to the user.
    fn display_pass_key(&mut self, pass_key: PassKey);
    /// Ask the user to confirm the numeric comparison code. May block; the
    /// handshake does not proceed until it returns.
    fn confirm_pass_key(&mut self, pass_key: PassKey) -> bool;
    /// Persist a completed bond. Implementations may queue the write.
    fn store_bond(&mut self, bond: BondInformation) -> Result<(), Error>;
}

/// Controller completions and link state changes that drive the pairing
/// state machine forward.
pub enum Event {
    /// `LE Read Local P-256 Public Key Complete`.
    LocalPublicKey(PublicKey),
    /// `LE Generate DHKey Complete`.
    DhKey(DhKey),
    /// Encryption change event, true when the link is now encrypted.
    EncryptionChanged(bool),
}

/// A pairing attempt in flight on a connection. The role is frozen when the
/// attempt is created and never changes.
pub(crate) enum Pairing {
    Initiator(initiator::Pairing),
    Responder(responder::Pairing),
}

impl Pairing {
    pub(crate) fn new_responder(
        local_address: Address,
        peer_address: Address,
        local_io: IoCapabilities,
        local_irk: IdentityResolvingKey,
    ) -> Pairing {
        Pairing::Responder(responder::Pairing::new(local_address, peer_address, local_io, local_irk))
    }

    pub(crate) fn initiate<OPS: PairingOps>(
        local_address: Address,
        peer_address: Address,
        ops: &mut OPS,
        local_io: IoCapabilities,
        local_irk: IdentityResolvingKey,
    ) -> Result<Self, Error> {
        Ok(Pairing::Initiator(initiator::Pairing::initiate(
            local_address,
            peer_address,
            ops,
            local_io,
            local_irk,
        )?))
    }

    pub(crate) fn is_initiator(&self) -> bool {
        matches!(self, Pairing::Initiator(_))
    }

    /// Whether the attempt already reached a terminal state (success or
    /// failure).
    pub(crate) fn is_settled(&self) -> bool {
        match self {
            Pairing::Initiator(initiator) => initiator.is_settled(),
            Pairing::Responder(responder) => responder.is_settled(),
        }
    }

    pub(crate) fn peer_address(&self) -> Address {
        match self {
            Pairing::Initiator(initiator) => initiator.peer_address(),
            Pairing::Responder(responder) => responder.peer_address(),
        }
    }

    pub(crate) fn security_level(&self) -> SecurityLevel {
        match self {
            Pairing::Initiator(initiator) => initiator.security_level(),
            Pairing::Responder(responder) => responder.security_level(),
        }
    }

    pub(crate) fn handle_l2cap_command<OPS: PairingOps, RNG: CryptoRng + RngCore>(
        &self,
        command: Command,
        payload: &[u8],
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        match self {
            Pairing::Initiator(initiator) => initiator.handle_l2cap_command(command, payload, ops, rng),
            Pairing::Responder(responder) => responder.handle_l2cap_command(command, payload, ops, rng),
        }
    }

    pub(crate) fn handle_event<OPS: PairingOps, RNG: CryptoRng + RngCore>(
        &self,
        event: Event,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        match self {
            Pairing::Initiator(initiator) => initiator.handle_event(event, ops, rng),
            Pairing::Responder(responder) => responder.handle_event(event, ops, rng),
        }
    }
}
