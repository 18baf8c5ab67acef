//! Runtime configuration values.

/// Preferred connection parameters for the parameter update engine.
///
/// Intervals are in 1.25 ms units, the supervision timeout in 10 ms units.
/// A value of zero means "no bound configured": no update request is emitted
/// for that dimension and incoming requests are not checked against it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParamConfig {
    /// Minimum acceptable connection interval, in 1.25 ms units.
    pub min_interval: u16,
    /// Maximum acceptable connection interval, in 1.25 ms units.
    pub max_interval: u16,
    /// Required supervision timeout, in 10 ms units.
    pub supervision_timeout: u16,
}

impl ConnParamConfig {
    pub(crate) fn interval_bounds(&self) -> Option<(u16, u16)> {
        if self.min_interval != 0 && self.max_interval != 0 {
            Some((self.min_interval, self.max_interval))
        } else {
            None
        }
    }

    pub(crate) fn required_timeout(&self) -> Option<u16> {
        if self.supervision_timeout != 0 {
            Some(self.supervision_timeout)
        } else {
            None
        }
    }
}

/// Whether incoming pairing requests are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PairingMode {
    /// Reject all pairing requests.
    Disabled,
    /// Accept pairing requests.
    Enabled,
    /// Accept one pairing request, then switch to [`PairingMode::Disabled`].
    PairOnce,
}

impl PairingMode {
    /// Whether a pairing request would currently be accepted.
    pub fn accepts_pairing(&self) -> bool {
        !matches!(self, PairingMode::Disabled)
    }
}
