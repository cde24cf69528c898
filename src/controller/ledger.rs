//! Resource ownership ledger.
//!
//! The controller is the only writer. The ledger tracks who currently owns
//! the microphone and the speaker; because a single device drives both, it
//! rejects any assignment that would leave both owned by the device at
//! once. Violations are programming errors, not runtime conditions.

use crate::error::{BridgeError, Result};

/// Ownership state of one device-side resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Nobody holds the resource.
    Available,
    /// The controller holds it (an open cycle owns the mic stream).
    OwnedByController,
    /// The device holds it (the speaker during playback).
    OwnedByDevice,
    /// Forwarding is suspended (the mic while the speaker plays).
    Paused,
}

impl ResourceState {
    /// Stable label for telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::OwnedByController => "owned_by_controller",
            Self::OwnedByDevice => "owned_by_device",
            Self::Paused => "paused",
        }
    }
}

/// Authoritative record of mic and speaker ownership.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLedger {
    mic: ResourceState,
    spk: ResourceState,
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceLedger {
    /// Both resources start available.
    pub fn new() -> Self {
        Self {
            mic: ResourceState::Available,
            spk: ResourceState::Available,
        }
    }

    /// Current mic state.
    pub fn mic(&self) -> ResourceState {
        self.mic
    }

    /// Current speaker state.
    pub fn spk(&self) -> ResourceState {
        self.spk
    }

    /// Assign the mic.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceInvariant` error if the assignment would leave
    /// both resources owned by the device.
    pub fn set_mic(&mut self, state: ResourceState) -> Result<()> {
        if state == ResourceState::OwnedByDevice && self.spk == ResourceState::OwnedByDevice {
            return Err(BridgeError::ResourceInvariant(
                "mic and spk cannot both be owned by the device".to_owned(),
            ));
        }
        self.mic = state;
        Ok(())
    }

    /// Assign the speaker.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceInvariant` error if the assignment would leave
    /// both resources owned by the device.
    pub fn set_spk(&mut self, state: ResourceState) -> Result<()> {
        if state == ResourceState::OwnedByDevice && self.mic == ResourceState::OwnedByDevice {
            return Err(BridgeError::ResourceInvariant(
                "mic and spk cannot both be owned by the device".to_owned(),
            ));
        }
        self.spk = state;
        Ok(())
    }

    /// True when neither resource is held.
    pub fn both_available(&self) -> bool {
        self.mic == ResourceState::Available && self.spk == ResourceState::Available
    }

    /// Entry guard for playback: the mic must not be owned by the device.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceInvariant` error on violation.
    pub fn require_mic_not_device(&self) -> Result<()> {
        if self.mic == ResourceState::OwnedByDevice {
            return Err(BridgeError::ResourceInvariant(
                "cannot start playback while the device owns the mic".to_owned(),
            ));
        }
        Ok(())
    }

    /// Entry guard for capture: the speaker must not be owned by the device.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceInvariant` error on violation.
    pub fn require_spk_not_device(&self) -> Result<()> {
        if self.spk == ResourceState::OwnedByDevice {
            return Err(BridgeError::ResourceInvariant(
                "cannot start capture while the device owns the speaker".to_owned(),
            ));
        }
        Ok(())
    }

    /// Entry guard for idle: both resources must be available.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceInvariant` error on violation.
    pub fn require_both_available(&self) -> Result<()> {
        if !self.both_available() {
            return Err(BridgeError::ResourceInvariant(format!(
                "idle requires free resources, have mic={} spk={}",
                self.mic.as_str(),
                self.spk.as_str()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_available() {
        let ledger = ResourceLedger::new();
        assert!(ledger.both_available());
        assert!(ledger.require_both_available().is_ok());
    }

    #[test]
    fn device_never_owns_both() {
        let mut ledger = ResourceLedger::new();
        ledger.set_spk(ResourceState::OwnedByDevice).expect("spk");
        let err = ledger
            .set_mic(ResourceState::OwnedByDevice)
            .expect_err("both device-owned must be rejected");
        assert!(matches!(err, BridgeError::ResourceInvariant(_)));

        let mut ledger = ResourceLedger::new();
        ledger.set_mic(ResourceState::OwnedByDevice).expect("mic");
        assert!(ledger.set_spk(ResourceState::OwnedByDevice).is_err());
    }

    #[test]
    fn paused_mic_coexists_with_device_speaker() {
        let mut ledger = ResourceLedger::new();
        ledger.set_mic(ResourceState::Paused).expect("mic");
        ledger.set_spk(ResourceState::OwnedByDevice).expect("spk");
        assert!(ledger.require_mic_not_device().is_ok());
        assert!(!ledger.both_available());
    }

    #[test]
    fn entry_guards_fire() {
        let mut ledger = ResourceLedger::new();
        ledger.set_mic(ResourceState::OwnedByDevice).expect("mic");
        assert!(ledger.require_mic_not_device().is_err());
        assert!(ledger.require_both_available().is_err());

        let mut ledger = ResourceLedger::new();
        ledger.set_spk(ResourceState::OwnedByDevice).expect("spk");
        assert!(ledger.require_spk_not_device().is_err());
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(ResourceState::Available.as_str(), "available");
        assert_eq!(ResourceState::OwnedByController.as_str(), "owned_by_controller");
        assert_eq!(ResourceState::OwnedByDevice.as_str(), "owned_by_device");
        assert_eq!(ResourceState::Paused.as_str(), "paused");
    }
}
