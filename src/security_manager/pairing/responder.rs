use core::cell::RefCell;
use core::ops::DerefMut;

use bt_hci::param::BdAddr;
use rand_core::{CryptoRng, RngCore};

use crate::codec::{Decode, Encode};
use crate::security_manager::constants::ENCRYPTION_KEY_SIZE_128_BITS;
use crate::security_manager::crypto::{Check, Confirm, DhKey, IdentityResolvingKey, MacKey, Nonce, PublicKey};
use crate::security_manager::pairing::util::{
    make_confirm_packet, make_dhkey_check_packet, make_identity_address_packet, make_identity_information_packet,
    make_pairing_random, make_public_key_packet, prepare_packet, use_numeric_comparison, CommandAndPayload,
};
use crate::security_manager::pairing::{Event, PairingOps};
use crate::security_manager::types::{Command, PairingFeatures, PassKey, SecurityLevel};
use crate::security_manager::{BondInformation, Reason};
use crate::{Address, Error, Identity, IoCapabilities, LongTermKey};

/// Responder progress through the handshake. Steps only ever advance; a
/// failed attempt lands in `Error` and stays there.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Step {
    WaitingPairingRequest,
    WaitingPeerPublicKey,
    WaitingLocalPublicKey,
    WaitingPairingRandom,
    WaitingDhKeyCheck,
    WaitingLinkEncrypted,
    ReceivingKeys,
    Success,
    Error(Error),
}

struct PairingData {
    local_address: Address,
    peer_address: Address,
    local_features: PairingFeatures,
    peer_features: PairingFeatures,
    local_irk: IdentityResolvingKey,
    peer_irk: Option<IdentityResolvingKey>,
    numeric_comparison: bool,
    local_public_key: Option<PublicKey>,
    peer_public_key: Option<PublicKey>,
    dh_key: Option<DhKey>,
    confirm: Confirm,
    local_nonce: Nonce,
    peer_nonce: Nonce,
    mac_key: Option<MacKey>,
    long_term_key: LongTermKey,
    // Ea received before the controller delivered the DHKey
    remote_check: Option<Check>,
}

impl PairingData {
    fn clear_ephemerals(&mut self) {
        self.local_public_key = None;
        self.peer_public_key = None;
        self.dh_key = None;
        self.confirm = Confirm(0);
        self.local_nonce = Nonce(0);
        self.peer_nonce = Nonce(0);
        self.mac_key = None;
        self.long_term_key = LongTermKey(0);
        self.remote_check = None;
    }

    /// Keys the initiator will send us, from the agreed distribution sets.
    fn peer_sends_identity(&self) -> bool {
        self.peer_features.initiator_key_distribution.identity_key()
            && self.local_features.initiator_key_distribution.identity_key()
    }

    /// Keys we send to the initiator.
    fn local_sends_identity(&self) -> bool {
        self.peer_features.responder_key_distribution.identity_key()
            && self.local_features.responder_key_distribution.identity_key()
    }

    fn security_level(&self) -> SecurityLevel {
        if self.numeric_comparison {
            SecurityLevel::EncryptedAuthenticated
        } else {
            SecurityLevel::Encrypted
        }
    }
}

/// Pairing state machine for the responder role: the side that received the
/// Pairing Request.
pub struct Pairing {
    current_step: RefCell<Step>,
    pairing_data: RefCell<PairingData>,
}

impl Pairing {
    pub(crate) fn new(
        local_address: Address,
        peer_address: Address,
        local_io: IoCapabilities,
        local_irk: IdentityResolvingKey,
    ) -> Self {
        Self {
            current_step: RefCell::new(Step::WaitingPairingRequest),
            pairing_data: RefCell::new(PairingData {
                local_address,
                peer_address,
                local_features: PairingFeatures {
                    io_capabilities: local_io,
                    ..Default::default()
                },
                peer_features: PairingFeatures::default(),
                local_irk,
                peer_irk: None,
                numeric_comparison: false,
                local_public_key: None,
                peer_public_key: None,
                dh_key: None,
                confirm: Confirm(0),
                local_nonce: Nonce(0),
                peer_nonce: Nonce(0),
                mac_key: None,
                long_term_key: LongTermKey(0),
                remote_check: None,
            }),
        }
    }

    pub(crate) fn peer_address(&self) -> Address {
        self.pairing_data.borrow().peer_address
    }

    pub(crate) fn security_level(&self) -> SecurityLevel {
        match *self.current_step.borrow() {
            Step::ReceivingKeys | Step::Success => self.pairing_data.borrow().security_level(),
            _ => SecurityLevel::NoEncryption,
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        matches!(*self.current_step.borrow(), Step::Success | Step::Error(_))
    }

    pub(crate) fn handle_l2cap_command<OPS: PairingOps, RNG: CryptoRng + RngCore>(
        &self,
        command: Command,
        payload: &[u8],
        ops: &mut OPS,
        _rng: &mut RNG,
    ) -> Result<(), Error> {
        match self.handle_impl(CommandAndPayload { command, payload }, ops) {
            Ok(()) => Ok(()),
            Err(error) => {
                error!("[smp] failed to handle command {:?}: {:?}", command, error);
                self.fail(error.clone());
                Err(error)
            }
        }
    }

    pub(crate) fn handle_event<OPS: PairingOps, RNG: CryptoRng + RngCore>(
        &self,
        event: Event,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        match self.handle_event_impl(event, ops, rng) {
            Ok(()) => Ok(()),
            Err(error) => {
                error!("[smp] failed to handle event: {:?}", error);
                self.fail(error.clone());
                Err(error)
            }
        }
    }

    fn fail(&self, error: Error) {
        self.pairing_data.borrow_mut().clear_ephemerals();
        self.current_step.replace(Step::Error(error));
    }

    fn handle_impl<OPS: PairingOps>(&self, command: CommandAndPayload, ops: &mut OPS) -> Result<(), Error> {
        let current_step = self.current_step.borrow().clone();
        let mut pairing_data = self.pairing_data.borrow_mut();
        let pairing_data = pairing_data.deref_mut();
        trace!("[smp] responder handling {:?} in step {:?}", command.command, current_step);
        let next_step = match (current_step, command.command) {
            (Step::WaitingPairingRequest, Command::PairingRequest) => {
                Self::handle_pairing_request(command.payload, pairing_data)?;
                Self::send_pairing_response(ops, pairing_data)?;
                Step::WaitingPeerPublicKey
            }
            (Step::WaitingPeerPublicKey, Command::PairingPublicKey) => {
                let payload: &[u8; 64] = command.payload.try_into().map_err(|_| Error::InvalidValue)?;
                pairing_data.peer_public_key = Some(PublicKey::from_bytes(payload));
                ops.request_local_public_key()?;
                Step::WaitingLocalPublicKey
            }
            (Step::WaitingPairingRandom, Command::PairingRandom) => {
                Self::handle_pairing_random(command.payload, ops, pairing_data)?
            }
            (Step::WaitingDhKeyCheck, Command::PairingDhKeyCheck) => {
                let ea = Check(u128::from_le_bytes(
                    command.payload.try_into().map_err(|_| Error::InvalidValue)?,
                ));
                if pairing_data.dh_key.is_some() {
                    Self::verify_ea_and_reply(ea, ops, pairing_data)?
                } else {
                    trace!("[smp] dh key not ready, buffering peer check");
                    pairing_data.remote_check = Some(ea);
                    Step::WaitingDhKeyCheck
                }
            }
            (Step::ReceivingKeys, Command::IdentityInformation) => {
                pairing_data.peer_irk = Some(IdentityResolvingKey::from_le_bytes(
                    command.payload.try_into().map_err(|_| Error::InvalidValue)?,
                ));
                Step::ReceivingKeys
            }
            (Step::ReceivingKeys, Command::IdentityAddressInformation) => {
                Self::finish_key_distribution(command.payload, ops, pairing_data)?
            }
            _ => return Err(Error::InvalidState),
        };

        self.current_step.replace(next_step);
        Ok(())
    }

    fn handle_event_impl<OPS: PairingOps, RNG: CryptoRng + RngCore>(
        &self,
        event: Event,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        let current_step = self.current_step.borrow().clone();
        let mut pairing_data = self.pairing_data.borrow_mut();
        let pairing_data = pairing_data.deref_mut();
        let next_step = match (current_step, event) {
            (Step::WaitingLocalPublicKey, Event::LocalPublicKey(public_key)) => {
                Self::handle_local_public_key(public_key, ops, pairing_data, rng)?
            }
            (step @ (Step::WaitingPairingRandom | Step::WaitingDhKeyCheck), Event::DhKey(dh_key)) => {
                pairing_data.dh_key = Some(dh_key);
                match (step, pairing_data.remote_check.take()) {
                    (Step::WaitingDhKeyCheck, Some(ea)) => Self::verify_ea_and_reply(ea, ops, pairing_data)?,
                    (step, _) => step,
                }
            }
            (Step::WaitingLinkEncrypted, Event::EncryptionChanged(true)) => {
                info!("[smp] link encrypted");
                Self::distribute_keys(ops, pairing_data)?
            }
            (Step::WaitingLinkEncrypted, Event::EncryptionChanged(false)) => {
                return Err(Error::Security(Reason::KeyRejected))
            }
            _ => return Err(Error::InvalidState),
        };

        self.current_step.replace(next_step);
        Ok(())
    }

    fn handle_pairing_request(payload: &[u8], pairing_data: &mut PairingData) -> Result<(), Error> {
        let peer_features = PairingFeatures::decode(payload).map_err(|_| Error::Security(Reason::InvalidParameters))?;
        if peer_features.maximum_encryption_key_size < ENCRYPTION_KEY_SIZE_128_BITS {
            return Err(Error::Security(Reason::EncryptionKeySize));
        }
        if !peer_features.security_properties.secure_connection() {
            return Err(Error::Security(Reason::UnspecifiedReason));
        }

        pairing_data.peer_features = peer_features;
        pairing_data.numeric_comparison =
            use_numeric_comparison(&pairing_data.peer_features, &pairing_data.local_features);
        info!("[smp] numeric comparison: {}", pairing_data.numeric_comparison);
        Ok(())
    }

    fn send_pairing_response<OPS: PairingOps>(ops: &mut OPS, pairing_data: &mut PairingData) -> Result<(), Error> {
        let mut packet = prepare_packet(Command::PairingResponse);
        pairing_data
            .local_features
            .encode(packet.payload_mut())
            .map_err(|_| Error::InvalidValue)?;
        ops.try_send_packet(packet)
    }

    /// The controller produced the local key pair: send our public key, ask
    /// for the shared secret and commit to Nb with the Pairing Confirm.
    fn handle_local_public_key<OPS: PairingOps, RNG: CryptoRng + RngCore>(
        public_key: PublicKey,
        ops: &mut OPS,
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<Step, Error> {
        let peer_public_key = pairing_data.peer_public_key.ok_or(Error::InvalidValue)?;
        pairing_data.local_public_key = Some(public_key);
        ops.try_send_packet(make_public_key_packet(&public_key))?;
        ops.request_dh_key(&peer_public_key)?;

        // SUBTLE: the confirm must be sent after our own public key. See the
        // last paragraph of Section 2.3.5.6.2.
        pairing_data.local_nonce = Nonce::new(rng);
        let cb = pairing_data
            .local_nonce
            .f4(public_key.x(), peer_public_key.x(), 0);
        pairing_data.confirm = cb;
        ops.try_send_packet(make_confirm_packet(&cb))?;
        Ok(Step::WaitingPairingRandom)
    }

    fn handle_pairing_random<OPS: PairingOps>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        pairing_data.peer_nonce = Nonce(u128::from_le_bytes(
            payload.try_into().map_err(|_| Error::Security(Reason::InvalidParameters))?,
        ));
        ops.try_send_packet(make_pairing_random(&pairing_data.local_nonce))?;

        let peer_public_key = pairing_data.peer_public_key.ok_or(Error::InvalidValue)?;
        let local_public_key = pairing_data.local_public_key.ok_or(Error::InvalidValue)?;
        let vb = pairing_data
            .peer_nonce
            .g2(peer_public_key.x(), local_public_key.x(), &pairing_data.local_nonce);

        if pairing_data.numeric_comparison {
            let pass_key = PassKey(vb.0);
            info!("[smp] numeric comparison code {}", pass_key);
            ops.display_pass_key(pass_key);
            if !ops.confirm_pass_key(pass_key) {
                warn!("[smp] user rejected numeric comparison");
                return Err(Error::Security(Reason::NumericComparisonFailed));
            }
        }
        Ok(Step::WaitingDhKeyCheck)
    }

    /// Authentication stage 2 ([Vol 3] Part H, Section 2.3.5.6.5): derive
    /// MacKey and LTK, verify the initiator's Ea and answer with Eb.
    fn verify_ea_and_reply<OPS: PairingOps>(
        ea: Check,
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        let dh_key = pairing_data.dh_key.as_ref().ok_or(Error::InvalidValue)?;
        let (mac_key, long_term_key) = dh_key.f5(
            pairing_data.peer_nonce,
            pairing_data.local_nonce,
            pairing_data.peer_address,
            pairing_data.local_address,
        );

        let expected_ea = mac_key.f6(
            pairing_data.peer_nonce,
            pairing_data.local_nonce,
            0,
            pairing_data.peer_features.as_io_cap(),
            pairing_data.peer_address,
            pairing_data.local_address,
        );
        if expected_ea != ea {
            return Err(Error::Security(Reason::DHKeyCheckFailed));
        }

        let eb = mac_key.f6(
            pairing_data.local_nonce,
            pairing_data.peer_nonce,
            0,
            pairing_data.local_features.as_io_cap(),
            pairing_data.local_address,
            pairing_data.peer_address,
        );
        ops.try_send_packet(make_dhkey_check_packet(&eb))?;

        pairing_data.mac_key = Some(mac_key);
        pairing_data.long_term_key = long_term_key;
        // The controller will ask for the LTK when the initiator starts
        // encryption.
        ops.try_enable_encryption(&long_term_key)?;
        Ok(Step::WaitingLinkEncrypted)
    }

    /// The responder distributes its keys first.
    fn distribute_keys<OPS: PairingOps>(ops: &mut OPS, pairing_data: &mut PairingData) -> Result<Step, Error> {
        if pairing_data.local_sends_identity() {
            ops.try_send_packet(make_identity_information_packet(&pairing_data.local_irk))?;
            ops.try_send_packet(make_identity_address_packet(&pairing_data.local_address))?;
        }
        if pairing_data.peer_sends_identity() {
            Ok(Step::ReceivingKeys)
        } else {
            Self::store_bond(None, ops, pairing_data)?;
            Ok(Step::Success)
        }
    }

    fn finish_key_distribution<OPS: PairingOps>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        let addr: [u8; 6] = payload[1..7].try_into().map_err(|_| Error::InvalidValue)?;
        Self::store_bond(Some(BdAddr::new(addr)), ops, pairing_data)?;
        Ok(Step::Success)
    }

    fn store_bond<OPS: PairingOps>(
        identity_address: Option<BdAddr>,
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<(), Error> {
        let identity = Identity {
            bd_addr: identity_address.unwrap_or(pairing_data.peer_address.addr),
            irk: pairing_data.peer_irk,
        };
        let bond = BondInformation::new(identity, pairing_data.long_term_key, pairing_data.security_level());
        info!("[smp] pairing complete, storing bond for {:?}", identity.bd_addr);
        ops.store_bond(bond)?;
        pairing_data.clear_ephemerals();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::ChaCha12Rng;
    use rand_core::SeedableRng;

    use super::*;
    use crate::security_manager::pairing::tests::{test_dh_key, test_public_key_a, test_public_key_b, TestOps};
    use crate::security_manager::pairing::Event;
    use crate::IoCapabilities;

    fn new_responder() -> (Pairing, TestOps, ChaCha12Rng) {
        let local = Address::random([0xff, 1, 2, 3, 4, 5]);
        let peer = Address::random([0xff, 2, 2, 3, 4, 5]);
        let pairing = Pairing::new(local, peer, IoCapabilities::DisplayYesNo, IdentityResolvingKey::new(7));
        (pairing, TestOps::new(peer), ChaCha12Rng::seed_from_u64(1))
    }

    #[test]
    fn pairing_request_yields_response_with_own_features() {
        let (pairing, mut ops, mut rng) = new_responder();
        pairing
            .handle_l2cap_command(Command::PairingRequest, &[0x01, 0, 0x0d, 16, 2, 2], &mut ops, &mut rng)
            .unwrap();
        assert_eq!(ops.sent_packets.len(), 1);
        let response = &ops.sent_packets[0];
        assert_eq!(response.command(), Command::PairingResponse);
        assert_eq!(response.payload(), &[0x01, 0, 0x0d, 16, 2, 2]);
    }

    #[test]
    fn small_key_size_is_rejected() {
        let (pairing, mut ops, mut rng) = new_responder();
        let result =
            pairing.handle_l2cap_command(Command::PairingRequest, &[0x01, 0, 0x0d, 7, 2, 2], &mut ops, &mut rng);
        assert_eq!(result, Err(Error::Security(Reason::EncryptionKeySize)));
        assert!(ops.sent_packets.is_empty());
    }

    #[test]
    fn legacy_only_peer_is_rejected() {
        let (pairing, mut ops, mut rng) = new_responder();
        // AuthReq without the SC bit
        let result =
            pairing.handle_l2cap_command(Command::PairingRequest, &[0x01, 0, 0x05, 16, 2, 2], &mut ops, &mut rng);
        assert_eq!(result, Err(Error::Security(Reason::UnspecifiedReason)));
    }

    #[test]
    fn public_key_is_requested_then_confirm_follows_own_key() {
        let (pairing, mut ops, mut rng) = new_responder();
        pairing
            .handle_l2cap_command(Command::PairingRequest, &[0x01, 0, 0x0d, 16, 2, 2], &mut ops, &mut rng)
            .unwrap();
        pairing
            .handle_l2cap_command(
                Command::PairingPublicKey,
                &test_public_key_a().to_bytes(),
                &mut ops,
                &mut rng,
            )
            .unwrap();
        assert_eq!(ops.local_public_key_requests, 1);

        pairing
            .handle_event(Event::LocalPublicKey(test_public_key_b()), &mut ops, &mut rng)
            .unwrap();
        // Own public key, then the confirm
        assert_eq!(ops.sent_packets.len(), 3);
        assert_eq!(ops.sent_packets[1].command(), Command::PairingPublicKey);
        assert_eq!(ops.sent_packets[2].command(), Command::PairingConfirm);
        assert_eq!(ops.dh_key_requests.len(), 1);
        assert_eq!(ops.dh_key_requests[0], test_public_key_a());
    }

    #[test]
    fn early_dh_key_check_is_buffered_until_key_arrives() {
        let (pairing, mut ops, mut rng) = new_responder();
        ops.confirm_answer = true;
        pairing
            .handle_l2cap_command(Command::PairingRequest, &[0x01, 0, 0x0d, 16, 2, 2], &mut ops, &mut rng)
            .unwrap();
        pairing
            .handle_l2cap_command(
                Command::PairingPublicKey,
                &test_public_key_a().to_bytes(),
                &mut ops,
                &mut rng,
            )
            .unwrap();
        pairing
            .handle_event(Event::LocalPublicKey(test_public_key_b()), &mut ops, &mut rng)
            .unwrap();
        pairing
            .handle_l2cap_command(Command::PairingRandom, &[1u8; 16], &mut ops, &mut rng)
            .unwrap();

        let before = ops.sent_packets.len();
        // Ea arrives before the controller finished the DHKey. It cannot be
        // verified yet so nothing must be sent.
        let bogus_ea = [0u8; 16];
        pairing
            .handle_l2cap_command(Command::PairingDhKeyCheck, &bogus_ea, &mut ops, &mut rng)
            .unwrap();
        assert_eq!(ops.sent_packets.len(), before);

        // The buffered check is verified once the key arrives; the bogus Ea
        // must now fail the f6 comparison.
        let result = pairing.handle_event(Event::DhKey(test_dh_key()), &mut ops, &mut rng);
        assert_eq!(result, Err(Error::Security(Reason::DHKeyCheckFailed)));
        assert!(matches!(*pairing.current_step.borrow(), Step::Error(_)));
    }

    #[test]
    fn user_rejection_fails_with_numeric_comparison_reason() {
        let (pairing, mut ops, mut rng) = new_responder();
        ops.confirm_answer = false;
        pairing
            .handle_l2cap_command(Command::PairingRequest, &[0x01, 0, 0x0d, 16, 2, 2], &mut ops, &mut rng)
            .unwrap();
        pairing
            .handle_l2cap_command(
                Command::PairingPublicKey,
                &test_public_key_a().to_bytes(),
                &mut ops,
                &mut rng,
            )
            .unwrap();
        pairing
            .handle_event(Event::LocalPublicKey(test_public_key_b()), &mut ops, &mut rng)
            .unwrap();
        let result = pairing.handle_l2cap_command(Command::PairingRandom, &[1u8; 16], &mut ops, &mut rng);
        assert_eq!(result, Err(Error::Security(Reason::NumericComparisonFailed)));
        assert_eq!(ops.displayed.len(), 1);
    }

    #[test]
    fn out_of_order_command_is_a_protocol_violation() {
        let (pairing, mut ops, mut rng) = new_responder();
        let result = pairing.handle_l2cap_command(Command::PairingRandom, &[1u8; 16], &mut ops, &mut rng);
        assert_eq!(result, Err(Error::InvalidState));
    }
}
