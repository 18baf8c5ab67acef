//! Connection parameter update engine on the L2CAP signaling channel.

use core::cell::RefCell;

use bt_hci::param::{ConnHandle, LeConnRole};

use crate::codec::{Decode, Encode, FixedSize};
use crate::config::ConnParamConfig;
use crate::types::l2cap::{
    ConnParamUpdateReq, ConnParamUpdateRes, SignalCode, SignalHeader, CONN_PARAM_UPDATE_ACCEPTED,
    CONN_PARAM_UPDATE_REJECTED,
};
use crate::Error;

/// Identifier used for locally originated update requests.
const LOCAL_REQUEST_IDENTIFIER: u8 = 0x01;

/// An encoded signaling channel frame: header plus payload, ready to be
/// carried in an L2CAP frame on CID 0x0005.
pub struct SignalFrame {
    buf: [u8; Self::MAX_SIZE],
    len: usize,
}

impl SignalFrame {
    // Largest frame emitted here is the 8-byte update request
    const MAX_SIZE: usize = SignalHeader::SIZE + ConnParamUpdateReq::SIZE;

    fn new<P: Encode>(code: SignalCode, identifier: u8, payload: &P) -> Result<Self, Error> {
        let mut buf = [0u8; Self::MAX_SIZE];
        let header = SignalHeader {
            code: code as u8,
            identifier,
            length: payload.size() as u16,
        };
        header.encode(&mut buf[..SignalHeader::SIZE])?;
        payload.encode(&mut buf[SignalHeader::SIZE..])?;
        Ok(Self {
            buf,
            len: SignalHeader::SIZE + payload.size(),
        })
    }

    /// Complete frame bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Capabilities the parameter update engine needs from the enclosing stack.
pub trait SignalingOps {
    /// The ACL connection the frame belongs to.
    fn connection_handle(&self) -> ConnHandle;
    /// Send a frame on the signaling channel (CID 0x0005).
    fn try_send_signal(&mut self, frame: SignalFrame) -> Result<(), Error>;
    /// Forward accepted parameters to the controller as an
    /// `LE Connection Update` command.
    fn request_connection_update(&mut self, params: &ConnParamUpdateReq) -> Result<(), Error>;
}

/// Handles connection parameter updates for connections where the local
/// device cannot issue controller-level updates directly.
///
/// With no bounds configured the engine accepts everything and requests
/// nothing.
pub struct SignalingManager {
    config: RefCell<ConnParamConfig>,
}

impl Default for SignalingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingManager {
    /// Create a new manager with no parameter bounds configured.
    pub fn new() -> Self {
        Self {
            config: RefCell::new(ConnParamConfig::default()),
        }
    }

    /// Set the acceptable connection interval range, in 1.25 ms units.
    pub fn set_connection_interval(&self, min_interval: u16, max_interval: u16) {
        let mut config = self.config.borrow_mut();
        config.min_interval = min_interval;
        config.max_interval = max_interval;
    }

    /// Set the required supervision timeout, in 10 ms units.
    pub fn set_supervision_timeout(&self, supervision_timeout: u16) {
        self.config.borrow_mut().supervision_timeout = supervision_timeout;
    }

    /// A new ACL connection came up with the given controller-granted
    /// parameters. In the peripheral role, a parameter update request is
    /// emitted when the grant falls outside the configured bounds. Central
    /// connections update the controller directly and emit nothing here.
    pub fn connection_established<OPS: SignalingOps>(
        &self,
        role: LeConnRole,
        interval: u16,
        _latency: u16,
        supervision_timeout: u16,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        if role != LeConnRole::Peripheral {
            return Ok(());
        }

        let config = *self.config.borrow();
        let mut update = false;
        let mut request = ConnParamUpdateReq {
            interval_min: interval,
            interval_max: interval,
            latency: 0,
            timeout: supervision_timeout,
        };

        if let Some((min, max)) = config.interval_bounds() {
            if interval < min || interval > max {
                request.interval_min = min;
                request.interval_max = max;
                update = true;
            }
        }
        if let Some(timeout) = config.required_timeout() {
            if supervision_timeout != timeout {
                request.timeout = timeout;
                update = true;
            }
        }

        if update {
            debug!(
                "[l2cap][conn = {:?}] requesting connection parameter update",
                ops.connection_handle()
            );
            ops.try_send_signal(SignalFrame::new(
                SignalCode::ConnParamUpdateReq,
                LOCAL_REQUEST_IDENTIFIER,
                &request,
            )?)?;
        }
        Ok(())
    }

    /// Handle an inbound frame received on the signaling channel
    /// (CID 0x0005). Malformed frames are dropped without a response.
    pub fn handle_signaling_channel<OPS: SignalingOps>(&self, data: &[u8], ops: &mut OPS) -> Result<(), Error> {
        let Ok(header) = SignalHeader::decode(data) else {
            // too short, ignore
            return Ok(());
        };
        if data.len() != SignalHeader::SIZE + usize::from(header.length) {
            // invalid length, ignore
            return Ok(());
        }
        let payload = &data[SignalHeader::SIZE..];

        let Ok(code) = SignalCode::try_from(header.code) else {
            trace!("[l2cap] unknown signal code {:02x} dropped", header.code);
            return Ok(());
        };
        match code {
            SignalCode::ConnParamUpdateReq => {
                let Ok(request) = ConnParamUpdateReq::decode(payload) else {
                    return Ok(());
                };
                self.handle_update_request(header.identifier, &request, ops)
            }
            SignalCode::ConnParamUpdateRes => {
                if let Ok(response) = ConnParamUpdateRes::decode(payload) {
                    debug!(
                        "[l2cap][conn = {:?}] connection param update response: {}",
                        ops.connection_handle(),
                        response.result
                    );
                }
                Ok(())
            }
            code => {
                warn!("[l2cap] unsupported signal {:?} dropped", code);
                Ok(())
            }
        }
    }

    fn handle_update_request<OPS: SignalingOps>(
        &self,
        identifier: u8,
        request: &ConnParamUpdateReq,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let config = *self.config.borrow();
        let mut result = CONN_PARAM_UPDATE_ACCEPTED;

        if let Some((min, max)) = config.interval_bounds() {
            if request.interval_min < min || request.interval_max > max {
                result = CONN_PARAM_UPDATE_REJECTED;
            }
        }
        if let Some(timeout) = config.required_timeout() {
            if request.timeout != timeout {
                result = CONN_PARAM_UPDATE_REJECTED;
            }
        }

        debug!(
            "[l2cap][conn = {:?}] connection param update request, result {}",
            ops.connection_handle(),
            result
        );
        ops.try_send_signal(SignalFrame::new(
            SignalCode::ConnParamUpdateRes,
            identifier,
            &ConnParamUpdateRes { result },
        )?)?;

        if result == CONN_PARAM_UPDATE_ACCEPTED {
            ops.request_connection_update(request)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestOps {
        sent_frames: heapless::Vec<heapless::Vec<u8, 16>, 4>,
        conn_updates: heapless::Vec<ConnParamUpdateReq, 4>,
    }

    impl TestOps {
        fn new() -> Self {
            Self {
                sent_frames: heapless::Vec::new(),
                conn_updates: heapless::Vec::new(),
            }
        }
    }

    impl SignalingOps for TestOps {
        fn connection_handle(&self) -> ConnHandle {
            ConnHandle::new(3)
        }

        fn try_send_signal(&mut self, frame: SignalFrame) -> Result<(), Error> {
            let mut bytes = heapless::Vec::new();
            bytes.extend_from_slice(frame.as_bytes()).unwrap();
            self.sent_frames.push(bytes).map_err(|_| Error::OutOfMemory)
        }

        fn request_connection_update(&mut self, params: &ConnParamUpdateReq) -> Result<(), Error> {
            self.conn_updates.push(*params).map_err(|_| Error::OutOfMemory)
        }
    }

    fn configured_manager() -> SignalingManager {
        let manager = SignalingManager::new();
        manager.set_connection_interval(0x0018, 0x0028);
        manager.set_supervision_timeout(0x01f4);
        manager
    }

    #[test]
    fn in_range_request_is_accepted_and_forwarded() {
        let manager = configured_manager();
        let mut ops = TestOps::new();
        // id 0x2a, min 0x0020, max 0x0024, latency 0, timeout 0x01f4
        let frame = [
            0x12, 0x2a, 0x08, 0x00, 0x20, 0x00, 0x24, 0x00, 0x00, 0x00, 0xf4, 0x01,
        ];
        manager.handle_signaling_channel(&frame, &mut ops).unwrap();

        assert_eq!(ops.sent_frames.len(), 1);
        assert_eq!(ops.sent_frames[0].as_slice(), &[0x13, 0x2a, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(ops.conn_updates.len(), 1);
        assert_eq!(
            ops.conn_updates[0],
            ConnParamUpdateReq {
                interval_min: 0x0020,
                interval_max: 0x0024,
                latency: 0,
                timeout: 0x01f4,
            }
        );
    }

    #[test]
    fn out_of_range_request_is_rejected() {
        let manager = configured_manager();
        let mut ops = TestOps::new();
        // min 0x0010 is below the configured lower bound
        let frame = [
            0x12, 0x2a, 0x08, 0x00, 0x10, 0x00, 0x24, 0x00, 0x00, 0x00, 0xf4, 0x01,
        ];
        manager.handle_signaling_channel(&frame, &mut ops).unwrap();

        assert_eq!(ops.sent_frames.len(), 1);
        assert_eq!(ops.sent_frames[0].as_slice(), &[0x13, 0x2a, 0x02, 0x00, 0x01, 0x00]);
        assert!(ops.conn_updates.is_empty());
    }

    #[test]
    fn timeout_mismatch_is_rejected() {
        let manager = configured_manager();
        let mut ops = TestOps::new();
        let frame = [
            0x12, 0x01, 0x08, 0x00, 0x20, 0x00, 0x24, 0x00, 0x00, 0x00, 0xf5, 0x01,
        ];
        manager.handle_signaling_channel(&frame, &mut ops).unwrap();
        assert_eq!(ops.sent_frames[0].as_slice(), &[0x13, 0x01, 0x02, 0x00, 0x01, 0x00]);
        assert!(ops.conn_updates.is_empty());
    }

    #[test]
    fn unconfigured_manager_accepts_everything() {
        let manager = SignalingManager::new();
        let mut ops = TestOps::new();
        let frame = [
            0x12, 0x07, 0x08, 0x00, 0x01, 0x00, 0xff, 0xff, 0x10, 0x00, 0x01, 0x00,
        ];
        manager.handle_signaling_channel(&frame, &mut ops).unwrap();
        assert_eq!(ops.sent_frames[0].as_slice(), &[0x13, 0x07, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(ops.conn_updates.len(), 1);
    }

    #[test]
    fn malformed_frames_are_silently_dropped() {
        let manager = configured_manager();
        let mut ops = TestOps::new();
        // Short header
        manager.handle_signaling_channel(&[0x12, 0x01], &mut ops).unwrap();
        // Header length disagrees with the frame length
        manager
            .handle_signaling_channel(&[0x12, 0x01, 0x08, 0x00, 0x20, 0x00], &mut ops)
            .unwrap();
        // Unknown code
        manager
            .handle_signaling_channel(&[0x7f, 0x01, 0x00, 0x00], &mut ops)
            .unwrap();
        assert!(ops.sent_frames.is_empty());
        assert!(ops.conn_updates.is_empty());
    }

    #[test]
    fn response_requires_no_action() {
        let manager = configured_manager();
        let mut ops = TestOps::new();
        manager
            .handle_signaling_channel(&[0x13, 0x01, 0x02, 0x00, 0x00, 0x00], &mut ops)
            .unwrap();
        assert!(ops.sent_frames.is_empty());
        assert!(ops.conn_updates.is_empty());
    }

    #[test]
    fn peripheral_with_out_of_range_grant_requests_update() {
        let manager = configured_manager();
        let mut ops = TestOps::new();
        manager
            .connection_established(LeConnRole::Peripheral, 0x0050, 0, 0x01f4, &mut ops)
            .unwrap();
        assert_eq!(ops.sent_frames.len(), 1);
        // code, id 0x01, length 8, then the preferred parameters
        assert_eq!(
            ops.sent_frames[0].as_slice(),
            &[0x12, 0x01, 0x08, 0x00, 0x18, 0x00, 0x28, 0x00, 0x00, 0x00, 0xf4, 0x01]
        );
    }

    #[test]
    fn peripheral_with_acceptable_grant_stays_quiet() {
        let manager = configured_manager();
        let mut ops = TestOps::new();
        manager
            .connection_established(LeConnRole::Peripheral, 0x0020, 0, 0x01f4, &mut ops)
            .unwrap();
        assert!(ops.sent_frames.is_empty());
    }

    #[test]
    fn central_connections_never_request_updates() {
        let manager = configured_manager();
        let mut ops = TestOps::new();
        manager
            .connection_established(LeConnRole::Central, 0x0050, 0, 0x0001, &mut ops)
            .unwrap();
        assert!(ops.sent_frames.is_empty());
    }
}
