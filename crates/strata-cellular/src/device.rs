//! # Modem Collaborators
//!
//! Interfaces the bring-up machine drives. Implementations sit on top of the
//! AT command engine and are out of scope for this crate; [`crate::test_util`]
//! provides an in-memory one.
//!
//! Handles are owned values. Closing a handle means dropping it.
//!
//! All calls are expected to return within the timeout last passed to
//! [`CellularDevice::set_timeout`]; the protocol layer enforces that and
//! reports an expired response as [`CellularError::DeviceError`].
//!
//! [`CellularError::DeviceError`]: crate::CellularError::DeviceError

use std::sync::Arc;
use std::time::Duration;

use crate::error::{CellularError, CellularResult};
use crate::types::{
    AttachStatus, OperatorName, OperatorParams, RadioAccessTechnology, RegistrationParams,
    RegistrationStatus, RegistrationType, SimState,
};

/// Invoked by the power collaborator when the modem announces it is ready.
pub type DeviceReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// Invoked by the network collaborator on every registration URC.
pub type RegistrationCallback = Arc<dyn Fn(RegistrationUrc) + Send + Sync>;

/// Unsolicited registration change pushed by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationUrc {
    pub reg_type: RegistrationType,
    pub status: RegistrationStatus,
    pub error: Option<CellularError>,
}

pub trait Power: Send {
    fn on(&mut self) -> CellularResult<()>;
    fn off(&mut self) -> CellularResult<()>;
    /// `Ok(())` if the modem already answers commands.
    fn is_device_ready(&mut self) -> CellularResult<()>;
    /// Switch the modem into command mode.
    fn set_at_mode(&mut self) -> CellularResult<()>;
    fn set_device_ready_callback(&mut self, callback: DeviceReadyCallback) -> CellularResult<()>;
    fn remove_device_ready_callback(&mut self) -> CellularResult<()>;
}

pub trait Sim: Send {
    fn sim_state(&mut self) -> CellularResult<SimState>;
    fn set_pin(&mut self, pin: &str) -> CellularResult<()>;
}

pub trait Network: Send {
    /// Route registration URCs to `callback`. Replaces any previous callback.
    fn set_registration_callback(&mut self, callback: RegistrationCallback);
    fn set_registration_urc(&mut self, reg_type: RegistrationType, on: bool)
        -> CellularResult<()>;
    /// Automatic registration when `plmn` is `None`, otherwise pinned to it.
    fn set_registration(&mut self, plmn: Option<&str>) -> CellularResult<()>;
    fn registration_params(&mut self, reg_type: RegistrationType)
        -> CellularResult<RegistrationParams>;
    fn operator_params(&mut self) -> CellularResult<OperatorParams>;
    fn operator_names(&mut self) -> CellularResult<Vec<OperatorName>>;
    fn set_attach(&mut self) -> CellularResult<()>;
    fn attach_status(&mut self) -> CellularResult<AttachStatus>;
    fn is_active_context(&mut self) -> CellularResult<bool>;
    fn set_access_technology(&mut self, rat: RadioAccessTechnology) -> CellularResult<()>;
}

/// Factory for the collaborator handles plus the shared response timeout.
pub trait CellularDevice: Send {
    /// Response timeout applied to subsequent collaborator calls.
    fn set_timeout(&mut self, timeout: Duration);
    fn open_power(&mut self) -> CellularResult<Box<dyn Power>>;
    fn open_sim(&mut self) -> CellularResult<Box<dyn Sim>>;
    fn open_network(&mut self) -> CellularResult<Box<dyn Network>>;
}
