use core::cell::RefCell;
use core::ops::DerefMut;

use bt_hci::param::BdAddr;
use rand_core::{CryptoRng, RngCore};

use crate::codec::{Decode, Encode};
use crate::security_manager::constants::ENCRYPTION_KEY_SIZE_128_BITS;
use crate::security_manager::crypto::{Check, Confirm, DhKey, IdentityResolvingKey, MacKey, Nonce, PublicKey};
use crate::security_manager::pairing::util::{
    make_dhkey_check_packet, make_identity_address_packet, make_identity_information_packet, make_pairing_random,
    make_public_key_packet, prepare_packet, use_numeric_comparison, CommandAndPayload,
};
use crate::security_manager::pairing::{Event, PairingOps};
use crate::security_manager::types::{Command, PairingFeatures, PassKey, SecurityLevel};
use crate::security_manager::{BondInformation, Reason};
use crate::{Address, Error, Identity, IoCapabilities, LongTermKey};

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Step {
    WaitingPairingResponse,
    WaitingLocalPublicKey,
    WaitingPeerPublicKey,
    WaitingPairingConfirm,
    WaitingPairingRandom,
    // User confirmed, controller still computing the shared secret
    WaitingDhKey,
    // Ea sent, waiting for the responder's Eb
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
    // Cb received from the responder, validated against Nb
    confirm: Confirm,
    local_nonce: Nonce,
    peer_nonce: Nonce,
    mac_key: Option<MacKey>,
    long_term_key: LongTermKey,
    // Eb received before the controller delivered the DHKey
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

    fn peer_sends_identity(&self) -> bool {
        self.peer_features.responder_key_distribution.identity_key()
            && self.local_features.responder_key_distribution.identity_key()
    }

    fn local_sends_identity(&self) -> bool {
        self.peer_features.initiator_key_distribution.identity_key()
            && self.local_features.initiator_key_distribution.identity_key()
    }

    fn security_level(&self) -> SecurityLevel {
        if self.numeric_comparison {
            SecurityLevel::EncryptedAuthenticated
        } else {
            SecurityLevel::Encrypted
        }
    }
}

/// Pairing state machine for the initiator role: the side that sent the
/// Pairing Request.
pub struct Pairing {
    current_step: RefCell<Step>,
    pairing_data: RefCell<PairingData>,
}

impl Pairing {
    /// Start a pairing attempt by sending the Pairing Request.
    pub(crate) fn initiate<OPS: PairingOps>(
        local_address: Address,
        peer_address: Address,
        ops: &mut OPS,
        local_io: IoCapabilities,
        local_irk: IdentityResolvingKey,
    ) -> Result<Self, Error> {
        let ret = Self {
            current_step: RefCell::new(Step::WaitingPairingResponse),
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
        };
        {
            let pairing_data = ret.pairing_data.borrow();
            let mut packet = prepare_packet(Command::PairingRequest);
            pairing_data
                .local_features
                .encode(packet.payload_mut())
                .map_err(|_| Error::InvalidValue)?;
            ops.try_send_packet(packet)?;
        }
        Ok(ret)
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
        rng: &mut RNG,
    ) -> Result<(), Error> {
        match self.handle_impl(CommandAndPayload { command, payload }, ops, rng) {
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
        _rng: &mut RNG,
    ) -> Result<(), Error> {
        match self.handle_event_impl(event, ops) {
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

    fn handle_impl<OPS: PairingOps, RNG: CryptoRng + RngCore>(
        &self,
        command: CommandAndPayload,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        let current_step = self.current_step.borrow().clone();
        let mut pairing_data = self.pairing_data.borrow_mut();
        let pairing_data = pairing_data.deref_mut();
        trace!("[smp] initiator handling {:?} in step {:?}", command.command, current_step);
        let next_step = match (current_step, command.command) {
            (Step::WaitingPairingResponse, Command::PairingResponse) => {
                Self::handle_pairing_response(command.payload, pairing_data)?;
                ops.request_local_public_key()?;
                Step::WaitingLocalPublicKey
            }
            (Step::WaitingPeerPublicKey, Command::PairingPublicKey) => {
                let payload: &[u8; 64] = command.payload.try_into().map_err(|_| Error::InvalidValue)?;
                let peer_public_key = PublicKey::from_bytes(payload);
                pairing_data.peer_public_key = Some(peer_public_key);
                ops.request_dh_key(&peer_public_key)?;
                Step::WaitingPairingConfirm
            }
            (Step::WaitingPairingConfirm, Command::PairingConfirm) => {
                pairing_data.confirm = Confirm(u128::from_le_bytes(
                    command.payload.try_into().map_err(|_| Error::InvalidValue)?,
                ));
                pairing_data.local_nonce = Nonce::new(rng);
                ops.try_send_packet(make_pairing_random(&pairing_data.local_nonce))?;
                Step::WaitingPairingRandom
            }
            (Step::WaitingPairingRandom, Command::PairingRandom) => {
                Self::handle_pairing_random(command.payload, ops, pairing_data)?
            }
            (Step::WaitingDhKey, Command::PairingDhKeyCheck) => {
                trace!("[smp] dh key not ready, buffering peer check");
                pairing_data.remote_check = Some(Check(u128::from_le_bytes(
                    command.payload.try_into().map_err(|_| Error::InvalidValue)?,
                )));
                Step::WaitingDhKey
            }
            (Step::WaitingDhKeyCheck, Command::PairingDhKeyCheck) => {
                let eb = Check(u128::from_le_bytes(
                    command.payload.try_into().map_err(|_| Error::InvalidValue)?,
                ));
                Self::verify_eb(eb, ops, pairing_data)?
            }
            (Step::ReceivingKeys, Command::IdentityInformation) => {
                pairing_data.peer_irk = Some(IdentityResolvingKey::from_le_bytes(
                    command.payload.try_into().map_err(|_| Error::InvalidValue)?,
                ));
                Step::ReceivingKeys
            }
            (Step::ReceivingKeys, Command::IdentityAddressInformation) => {
                let addr: [u8; 6] = command.payload[1..7].try_into().map_err(|_| Error::InvalidValue)?;
                Self::finish_key_distribution(Some(BdAddr::new(addr)), ops, pairing_data)?
            }
            _ => return Err(Error::InvalidState),
        };

        self.current_step.replace(next_step);
        Ok(())
    }

    fn handle_event_impl<OPS: PairingOps>(&self, event: Event, ops: &mut OPS) -> Result<(), Error> {
        let current_step = self.current_step.borrow().clone();
        let mut pairing_data = self.pairing_data.borrow_mut();
        let pairing_data = pairing_data.deref_mut();
        let next_step = match (current_step, event) {
            (Step::WaitingLocalPublicKey, Event::LocalPublicKey(public_key)) => {
                pairing_data.local_public_key = Some(public_key);
                ops.try_send_packet(make_public_key_packet(&public_key))?;
                Step::WaitingPeerPublicKey
            }
            (step @ (Step::WaitingPairingConfirm | Step::WaitingPairingRandom), Event::DhKey(dh_key)) => {
                pairing_data.dh_key = Some(dh_key);
                step
            }
            (Step::WaitingDhKey, Event::DhKey(dh_key)) => {
                pairing_data.dh_key = Some(dh_key);
                Self::send_ea(ops, pairing_data)?;
                match pairing_data.remote_check.take() {
                    Some(eb) => Self::verify_eb(eb, ops, pairing_data)?,
                    None => Step::WaitingDhKeyCheck,
                }
            }
            (Step::WaitingLinkEncrypted, Event::EncryptionChanged(true)) => {
                info!("[smp] link encrypted");
                if pairing_data.peer_sends_identity() {
                    Step::ReceivingKeys
                } else {
                    Self::finish_key_distribution(None, ops, pairing_data)?
                }
            }
            (Step::WaitingLinkEncrypted, Event::EncryptionChanged(false)) => {
                return Err(Error::Security(Reason::KeyRejected))
            }
            _ => return Err(Error::InvalidState),
        };

        self.current_step.replace(next_step);
        Ok(())
    }

    fn handle_pairing_response(payload: &[u8], pairing_data: &mut PairingData) -> Result<(), Error> {
        let peer_features = PairingFeatures::decode(payload).map_err(|_| Error::Security(Reason::InvalidParameters))?;
        if peer_features.maximum_encryption_key_size < ENCRYPTION_KEY_SIZE_128_BITS {
            return Err(Error::Security(Reason::EncryptionKeySize));
        }
        if !peer_features.security_properties.secure_connection() {
            return Err(Error::Security(Reason::UnspecifiedReason));
        }

        pairing_data.peer_features = peer_features;
        pairing_data.numeric_comparison =
            use_numeric_comparison(&pairing_data.local_features, &pairing_data.peer_features);
        info!("[smp] numeric comparison: {}", pairing_data.numeric_comparison);
        Ok(())
    }

    /// Validate the responder's commitment, then run the numeric comparison.
    fn handle_pairing_random<OPS: PairingOps>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        let peer_nonce = Nonce(u128::from_le_bytes(
            payload.try_into().map_err(|_| Error::Security(Reason::InvalidParameters))?,
        ));
        let peer_public_key = pairing_data.peer_public_key.ok_or(Error::InvalidValue)?;
        let local_public_key = pairing_data.local_public_key.ok_or(Error::InvalidValue)?;

        let expected_cb = peer_nonce.f4(peer_public_key.x(), local_public_key.x(), 0);
        if pairing_data.confirm != expected_cb {
            warn!("[smp] confirm value mismatch");
            return Err(Error::Security(Reason::ConfirmValueFailed));
        }
        pairing_data.peer_nonce = peer_nonce;

        let va = pairing_data
            .local_nonce
            .g2(local_public_key.x(), peer_public_key.x(), &pairing_data.peer_nonce);

        if pairing_data.numeric_comparison {
            let pass_key = PassKey(va.0);
            info!("[smp] numeric comparison code {}", pass_key);
            ops.display_pass_key(pass_key);
            if !ops.confirm_pass_key(pass_key) {
                warn!("[smp] user rejected numeric comparison");
                return Err(Error::Security(Reason::NumericComparisonFailed));
            }
        }

        if pairing_data.dh_key.is_some() {
            Self::send_ea(ops, pairing_data)?;
            Ok(Step::WaitingDhKeyCheck)
        } else {
            Ok(Step::WaitingDhKey)
        }
    }

    /// Authentication stage 2 ([Vol 3] Part H, Section 2.3.5.6.5): derive
    /// MacKey and LTK and send our check value.
    fn send_ea<OPS: PairingOps>(ops: &mut OPS, pairing_data: &mut PairingData) -> Result<(), Error> {
        let dh_key = pairing_data.dh_key.as_ref().ok_or(Error::InvalidValue)?;
        let (mac_key, long_term_key) = dh_key.f5(
            pairing_data.local_nonce,
            pairing_data.peer_nonce,
            pairing_data.local_address,
            pairing_data.peer_address,
        );

        let ea = mac_key.f6(
            pairing_data.local_nonce,
            pairing_data.peer_nonce,
            0,
            pairing_data.local_features.as_io_cap(),
            pairing_data.local_address,
            pairing_data.peer_address,
        );
        ops.try_send_packet(make_dhkey_check_packet(&ea))?;

        pairing_data.mac_key = Some(mac_key);
        pairing_data.long_term_key = long_term_key;
        Ok(())
    }

    fn verify_eb<OPS: PairingOps>(eb: Check, ops: &mut OPS, pairing_data: &mut PairingData) -> Result<Step, Error> {
        let mac_key = pairing_data.mac_key.as_ref().ok_or(Error::InvalidValue)?;
        let expected_eb = mac_key.f6(
            pairing_data.peer_nonce,
            pairing_data.local_nonce,
            0,
            pairing_data.peer_features.as_io_cap(),
            pairing_data.peer_address,
            pairing_data.local_address,
        );
        if expected_eb != eb {
            return Err(Error::Security(Reason::DHKeyCheckFailed));
        }

        ops.try_enable_encryption(&pairing_data.long_term_key)?;
        Ok(Step::WaitingLinkEncrypted)
    }

    /// The initiator distributes its keys after the responder's.
    fn finish_key_distribution<OPS: PairingOps>(
        identity_address: Option<BdAddr>,
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        if pairing_data.local_sends_identity() {
            ops.try_send_packet(make_identity_information_packet(&pairing_data.local_irk))?;
            ops.try_send_packet(make_identity_address_packet(&pairing_data.local_address))?;
        }

        let identity = Identity {
            bd_addr: identity_address.unwrap_or(pairing_data.peer_address.addr),
            irk: pairing_data.peer_irk,
        };
        let bond = BondInformation::new(identity, pairing_data.long_term_key, pairing_data.security_level());
        info!("[smp] pairing complete, storing bond for {:?}", identity.bd_addr);
        ops.store_bond(bond)?;
        pairing_data.clear_ephemerals();
        Ok(Step::Success)
    }
}
