//! # Bluetooth Security Manager
// ([Vol 3] Part H).

pub(crate) mod constants;
pub mod crypto;
pub mod pairing;
pub(crate) mod types;

use core::cell::{Cell, RefCell};
use core::ops::DerefMut;

use heapless::Vec;
use rand_chacha::ChaCha12Rng;
use rand_core::SeedableRng;

pub use types::{PassKey, Reason, SecurityLevel};

use crate::config::PairingMode;
use crate::security_manager::crypto::{IdentityResolvingKey, LongTermKey};
use crate::security_manager::pairing::{Event, Pairing, PairingOps};
use crate::security_manager::types::Command;
use crate::{Address, Error, Identity, IoCapabilities};

/// Bond Information
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BondInformation {
    /// Peer identity
    pub identity: Identity,
    /// Long Term Key (LTK)
    pub ltk: LongTermKey,
    /// Security level the pairing reached
    pub security_level: SecurityLevel,
}

impl BondInformation {
    /// Create a BondInformation
    pub fn new(identity: Identity, ltk: LongTermKey, security_level: SecurityLevel) -> Self {
        Self {
            identity,
            ltk,
            security_level,
        }
    }
}

impl core::fmt::Display for BondInformation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Identity {:?} LTK {}", self.identity, self.ltk)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BondInformation {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Identity {} LTK {}", self.identity, self.ltk);
    }
}

/// Outgoing SMP PDU: the command octet followed by its fixed-size payload.
#[derive(Clone)]
pub struct TxPacket {
    buf: [u8; Self::MAX_SIZE],
    command: Command,
}

impl TxPacket {
    /// The largest SMP PDU is the 64-byte public key plus the command octet.
    const MAX_SIZE: usize = 65;

    pub(crate) fn new(command: Command) -> Self {
        let mut buf = [0u8; Self::MAX_SIZE];
        buf[0] = command.into();
        Self { buf, command }
    }

    pub(crate) fn command(&self) -> Command {
        self.command
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.buf[1..1 + usize::from(self.command.payload_size())]
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[1..1 + usize::from(self.command.payload_size())]
    }

    /// Complete PDU bytes, to be carried in an L2CAP frame on the security
    /// channel (CID 0x0006).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..1 + usize::from(self.command.payload_size())]
    }
}

/// Security manager data
struct SecurityManagerData<const BOND_COUNT: usize> {
    /// Local device address
    local_address: Option<Address>,
    /// Local identity resolving key, distributed during bonding
    local_irk: IdentityResolvingKey,
    /// Current bonds with other devices
    bond: Vec<BondInformation, BOND_COUNT>,
    /// Random generator seeded
    random_generator_seeded: bool,
}

impl<const BOND_COUNT: usize> SecurityManagerData<BOND_COUNT> {
    fn new() -> Self {
        Self {
            local_address: None,
            local_irk: IdentityResolvingKey::new(0),
            bond: Vec::new(),
            random_generator_seeded: false,
        }
    }
}

/// Security manager handling the SMP protocol on the security channel.
///
/// At most one pairing attempt is in flight at a time. Inbound PDUs enter
/// through [`handle_security_channel`](Self::handle_security_channel),
/// controller completions through [`handle_event`](Self::handle_event).
///
/// The random generator must be seeded from a cryptographically secure
/// source (for example controller `LE Rand` output) via
/// [`set_random_generator_seed`](Self::set_random_generator_seed) before any
/// pairing can start.
pub struct SecurityManager<const BOND_COUNT: usize> {
    /// Random generator
    rng: RefCell<ChaCha12Rng>,
    /// Security manager data
    state: RefCell<SecurityManagerData<BOND_COUNT>>,
    /// State of the ongoing pairing attempt
    pairing_sm: RefCell<Option<Pairing>>,
    /// Io capabilities
    io_capabilities: Cell<IoCapabilities>,
    /// Whether incoming pairing requests are accepted
    pairing_mode: Cell<PairingMode>,
}

impl<const BOND_COUNT: usize> SecurityManager<BOND_COUNT> {
    /// Create a new SecurityManager
    pub fn new(io_capabilities: IoCapabilities) -> Self {
        let random_seed = [0u8; 32];
        Self {
            rng: RefCell::new(ChaCha12Rng::from_seed(random_seed)),
            state: RefCell::new(SecurityManagerData::new()),
            pairing_sm: RefCell::new(None),
            io_capabilities: Cell::new(io_capabilities),
            pairing_mode: Cell::new(PairingMode::Enabled),
        }
    }

    /// Seed the random generator from a cryptographically secure source.
    pub fn set_random_generator_seed(&self, random_seed: [u8; 32]) {
        self.rng.replace(ChaCha12Rng::from_seed(random_seed));
        self.state.borrow_mut().random_generator_seeded = true;
    }

    /// Set the current local address
    pub fn set_local_address(&self, address: Address) {
        self.state.borrow_mut().local_address = Some(address);
    }

    /// Set the local identity resolving key
    pub fn set_local_irk(&self, irk: IdentityResolvingKey) {
        self.state.borrow_mut().local_irk = irk;
    }

    /// Set the IO capabilities advertised in pairing requests and responses
    pub fn set_io_capabilities(&self, io_capabilities: IoCapabilities) {
        self.io_capabilities.set(io_capabilities);
    }

    /// Control whether incoming pairing requests are accepted
    pub fn set_pairing_mode(&self, mode: PairingMode) {
        self.pairing_mode.set(mode);
    }

    /// Get the long term key for a peer
    pub fn get_long_term_key(&self, identity: &Identity) -> Option<LongTermKey> {
        trace!("[smp] find long term key for {:?}", identity);
        self.state.borrow().bond.iter().find_map(|bond| {
            if bond.identity.match_identity(identity) {
                Some(bond.ltk)
            } else {
                None
            }
        })
    }

    /// Add a bonded device
    pub fn add_bond_information(&self, bond_information: BondInformation) -> Result<(), Error> {
        trace!("[smp] add bond for {:?}", bond_information.identity);
        let index = self
            .state
            .borrow()
            .bond
            .iter()
            .position(|bond| bond_information.identity.match_identity(&bond.identity));
        match index {
            Some(index) => {
                // Replace existing bond if it exists
                self.state.borrow_mut().bond[index] = bond_information;
                Ok(())
            }
            None => self
                .state
                .borrow_mut()
                .bond
                .push(bond_information)
                .map_err(|_| Error::OutOfMemory),
        }
    }

    /// Remove a bonded device
    pub fn remove_bond_information(&self, identity: Identity) -> Result<(), Error> {
        trace!("[smp] remove bond for {:?}", identity);
        let index = self
            .state
            .borrow()
            .bond
            .iter()
            .position(|bond| bond.identity.match_identity(&identity));
        match index {
            Some(index) => {
                self.state.borrow_mut().bond.remove(index);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Security level reached by the current pairing attempt.
    pub fn security_level(&self) -> SecurityLevel {
        self.pairing_sm
            .borrow()
            .as_ref()
            .map(|sm| sm.security_level())
            .unwrap_or(SecurityLevel::NoEncryption)
    }

    /// Handle an inbound PDU received on the security channel (CID 0x0006).
    ///
    /// `payload` is the L2CAP payload: the SMP command octet followed by the
    /// command parameters. Malformed input is dropped without a response.
    pub fn handle_security_channel<OPS: PairingOps>(&self, payload: &[u8], ops: &mut OPS) -> Result<(), Error> {
        let Some((command, data)) = Self::parse(payload) else {
            return Ok(());
        };

        let result = self.handle_impl(command, data, ops);
        if let Err(error) = &result {
            if let Err(send_error) = self.send_pairing_failed(error, ops) {
                error!("[smp] failed to send pairing failed: {:?}", send_error);
            }
            self.pairing_sm.replace(None);
        }
        result
    }

    /// Start pairing towards the peer of `ops`, taking the initiator role.
    pub fn initiate_pairing<OPS: PairingOps>(&self, ops: &mut OPS) -> Result<(), Error> {
        if !self.state.borrow().random_generator_seeded {
            error!("[smp] random generator not seeded, refusing to pair");
            return Err(Error::InvalidState);
        }
        let mut pairing_sm = self.pairing_sm.borrow_mut();
        if pairing_sm.as_ref().is_some_and(|sm| !sm.is_settled()) {
            return Err(Error::InvalidState);
        }
        let local_address = self.state.borrow().local_address.ok_or(Error::InvalidValue)?;
        let local_irk = self.state.borrow().local_irk;
        *pairing_sm = Some(Pairing::initiate(
            local_address,
            ops.peer_address(),
            ops,
            self.io_capabilities.get(),
            local_irk,
        )?);
        Ok(())
    }

    /// Handle a controller completion or link state change.
    ///
    /// Events with no pairing attempt in flight are dropped.
    pub fn handle_event<OPS: PairingOps>(&self, event: Event, ops: &mut OPS) -> Result<(), Error> {
        let result = {
            let sm = self.pairing_sm.borrow();
            match sm.as_ref() {
                Some(pairing) if !pairing.is_settled() => {
                    let mut rng = self.rng.borrow_mut();
                    pairing.handle_event(event, ops, rng.deref_mut())
                }
                _ => {
                    trace!("[smp] event with no pairing in flight, dropped");
                    return Ok(());
                }
            }
        };
        if let Err(error) = &result {
            if let Err(send_error) = self.send_pairing_failed(error, ops) {
                error!("[smp] failed to send pairing failed: {:?}", send_error);
            }
            self.pairing_sm.replace(None);
        }
        result
    }

    /// ACL disconnect: tear down the pairing attempt unconditionally.
    pub fn disconnect(&self) {
        self.pairing_sm.replace(None);
    }

    fn parse(payload: &[u8]) -> Option<(Command, &[u8])> {
        if payload.is_empty() {
            warn!("[smp] empty payload dropped");
            return None;
        }
        let Ok(command) = Command::try_from(payload[0]) else {
            trace!("[smp] unknown command {:02x} dropped", payload[0]);
            return None;
        };
        let data = &payload[1..];
        if data.len() != usize::from(command.payload_size()) {
            warn!("[smp] length mismatch for {:?} dropped", command);
            return None;
        }
        Some((command, data))
    }

    fn handle_impl<OPS: PairingOps>(&self, command: Command, payload: &[u8], ops: &mut OPS) -> Result<(), Error> {
        match command {
            Command::PairingFailed => {
                if let Ok(reason) = Reason::try_from(payload[0]) {
                    warn!("[smp] peer reported pairing failed: {}", reason);
                }
                self.pairing_sm.replace(None);
                Ok(())
            }
            Command::PairingRequest => {
                self.abort_stale_attempt(ops);
                if !self.pairing_mode.get().accepts_pairing() {
                    return Err(Error::Security(Reason::PairingNotSupported));
                }
                if !self.state.borrow().random_generator_seeded {
                    error!("[smp] random generator not seeded, refusing to pair");
                    return Err(Error::Security(Reason::UnspecifiedReason));
                }
                let local_address = self.state.borrow().local_address.ok_or(Error::InvalidValue)?;
                let local_irk = self.state.borrow().local_irk;
                let pairing = Pairing::new_responder(
                    local_address,
                    ops.peer_address(),
                    self.io_capabilities.get(),
                    local_irk,
                );
                {
                    let mut rng = self.rng.borrow_mut();
                    pairing.handle_l2cap_command(command, payload, ops, rng.deref_mut())?;
                }
                self.pairing_sm.replace(Some(pairing));
                if self.pairing_mode.get() == PairingMode::PairOnce {
                    self.pairing_mode.set(PairingMode::Disabled);
                }
                Ok(())
            }
            Command::PairingResponse
            | Command::PairingConfirm
            | Command::PairingRandom
            | Command::PairingPublicKey
            | Command::PairingDhKeyCheck
            | Command::IdentityInformation
            | Command::IdentityAddressInformation => {
                let sm = self.pairing_sm.borrow();
                match sm.as_ref() {
                    Some(pairing) if !pairing.is_settled() => {
                        let mut rng = self.rng.borrow_mut();
                        pairing.handle_l2cap_command(command, payload, ops, rng.deref_mut())
                    }
                    _ => {
                        trace!("[smp] {:?} with no pairing in flight, dropped", command);
                        Ok(())
                    }
                }
            }
            _ => {
                trace!("[smp] {:?} not handled by this core, dropped", command);
                Ok(())
            }
        }
    }

    /// A repeated Pairing Request aborts the attempt in flight before a
    /// fresh one starts.
    fn abort_stale_attempt<OPS: PairingOps>(&self, ops: &mut OPS) {
        let stale = {
            let sm = self.pairing_sm.borrow();
            sm.as_ref().is_some_and(|pairing| !pairing.is_settled())
        };
        if stale {
            warn!("[smp] pairing request while pairing in flight, aborting previous attempt");
            if let Err(error) = self.send_pairing_failed(&Error::Security(Reason::UnspecifiedReason), ops) {
                error!("[smp] failed to send pairing failed: {:?}", error);
            }
        }
        self.pairing_sm.replace(None);
    }

    fn send_pairing_failed<OPS: PairingOps>(&self, error: &Error, ops: &mut OPS) -> Result<(), Error> {
        let reason = if let Error::Security(reason) = error {
            *reason
        } else {
            Reason::UnspecifiedReason
        };
        let mut packet = TxPacket::new(Command::PairingFailed);
        packet.payload_mut()[0] = u8::from(reason);
        ops.try_send_packet(packet)
    }
}
