use crate::security_manager::crypto::{Check, Confirm, IdentityResolvingKey, Nonce, PublicKey};
use crate::security_manager::types::{Command, PairingFeatures};
use crate::security_manager::TxPacket;
use crate::{Address, IoCapabilities};

/// Whether the authenticated numeric comparison protocol is used instead of
/// just works ([Vol 3] Part H, Section 2.3.5.1, restricted to the methods
/// this stack supports).
pub(crate) fn use_numeric_comparison(initiator: &PairingFeatures, responder: &PairingFeatures) -> bool {
    let wants_mitm = initiator.security_properties.man_in_the_middle()
        || responder.security_properties.man_in_the_middle();
    let can_compare = |io: IoCapabilities| matches!(io, IoCapabilities::DisplayYesNo | IoCapabilities::KeyboardDisplay);
    wants_mitm && can_compare(initiator.io_capabilities) && can_compare(responder.io_capabilities)
}

pub(crate) fn prepare_packet(command: Command) -> TxPacket {
    TxPacket::new(command)
}

pub(crate) fn make_pairing_random(nonce: &Nonce) -> TxPacket {
    let mut packet = prepare_packet(Command::PairingRandom);
    packet.payload_mut().copy_from_slice(&nonce.0.to_le_bytes());
    packet
}

pub(crate) fn make_public_key_packet(public_key: &PublicKey) -> TxPacket {
    let mut packet = prepare_packet(Command::PairingPublicKey);
    packet.payload_mut().copy_from_slice(&public_key.to_bytes());
    packet
}

pub(crate) fn make_confirm_packet(confirm: &Confirm) -> TxPacket {
    let mut packet = prepare_packet(Command::PairingConfirm);
    packet.payload_mut().copy_from_slice(&confirm.0.to_le_bytes());
    packet
}

pub(crate) fn make_dhkey_check_packet(check: &Check) -> TxPacket {
    let mut packet = prepare_packet(Command::PairingDhKeyCheck);
    packet.payload_mut().copy_from_slice(&check.0.to_le_bytes());
    packet
}

pub(crate) fn make_identity_information_packet(irk: &IdentityResolvingKey) -> TxPacket {
    let mut packet = prepare_packet(Command::IdentityInformation);
    packet.payload_mut().copy_from_slice(&irk.to_le_bytes());
    packet
}

pub(crate) fn make_identity_address_packet(address: &Address) -> TxPacket {
    let mut packet = prepare_packet(Command::IdentityAddressInformation);
    let payload = packet.payload_mut();
    payload[0] = address.kind.into_inner();
    payload[1..7].copy_from_slice(&address.addr.into_inner());
    packet
}

#[derive(Debug, Clone)]
pub(crate) struct CommandAndPayload<'a> {
    pub command: Command,
    pub payload: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security_manager::types::AuthReq;
    use crate::security_manager::types::BondingFlag;

    #[test]
    fn numeric_comparison_needs_mitm_and_displays() {
        let yes_no = PairingFeatures {
            io_capabilities: IoCapabilities::DisplayYesNo,
            ..Default::default()
        };
        let headless = PairingFeatures {
            io_capabilities: IoCapabilities::NoInputNoOutput,
            ..Default::default()
        };
        assert!(use_numeric_comparison(&yes_no, &yes_no));
        assert!(!use_numeric_comparison(&yes_no, &headless));
        assert!(!use_numeric_comparison(&headless, &headless));

        // MITM cleared on both sides falls back to just works
        let mut quiet = yes_no;
        quiet.security_properties = AuthReq::from(u8::from(AuthReq::new(BondingFlag::Bonding)) & !0b0000_0100);
        assert!(!use_numeric_comparison(&quiet, &quiet));
    }

    #[test]
    fn pairing_random_is_little_endian_on_the_wire() {
        let nonce = Nonce(0x0102030405060708090a0b0c0d0e0f10);
        let packet = make_pairing_random(&nonce);
        assert_eq!(packet.as_bytes()[0], 0x04);
        assert_eq!(
            packet.payload(),
            &[0x10, 0x0f, 0x0e, 0x0d, 0x0c, 0x0b, 0x0a, 0x09, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn identity_address_layout() {
        let packet = make_identity_address_packet(&Address::public([1, 2, 3, 4, 5, 6]));
        assert_eq!(packet.as_bytes()[0], 0x09);
        assert_eq!(packet.payload(), &[0x00, 1, 2, 3, 4, 5, 6]);
    }
}
