//! In-memory modem for tests.
//!
//! [`MockModem`] implements every collaborator trait over one shared,
//! scriptable state. Each operation is appended to a call log, results come
//! from per-operation scripts (a queue of one-shot results, then a default),
//! and handle open/close is counted so tests can check lifecycle rules.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::device::{
    CellularDevice, DeviceReadyCallback, Network, Power, RegistrationCallback, RegistrationUrc,
    Sim,
};
use crate::error::{CellularError, CellularResult};
use crate::types::{
    AttachStatus, OperatorName, OperatorParams, RadioAccessTechnology, RegistrationParams,
    RegistrationStatus, RegistrationType, SimState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemCall {
    SetTimeout(Duration),
    OpenPower,
    OpenSim,
    OpenNetwork,
    PowerOn,
    PowerOff,
    IsDeviceReady,
    SetAtMode,
    SetDeviceReadyCallback,
    RemoveDeviceReadyCallback,
    SimState,
    SetPin(String),
    SetRegistrationUrc(RegistrationType, bool),
    SetRegistration(Option<String>),
    RegistrationParams(RegistrationType),
    OperatorParams,
    OperatorNames,
    SetAttach,
    AttachStatus,
    IsActiveContext,
    SetAccessTechnology(RadioAccessTechnology),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleCounts {
    pub power: usize,
    pub sim: usize,
    pub network: usize,
}

/// One-shot results consumed first, then `default` forever.
#[derive(Debug, Clone)]
pub struct Script<T> {
    pub queued: VecDeque<T>,
    pub default: T,
}

impl<T: Clone> Script<T> {
    pub fn always(default: T) -> Self {
        Script {
            queued: VecDeque::new(),
            default,
        }
    }

    pub fn then(mut self, first: impl IntoIterator<Item = T>) -> Self {
        self.queued.extend(first);
        self
    }

    fn next(&mut self) -> T {
        self.queued
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Scripted modem behaviour. Defaults describe a cold modem with a ready
/// SIM that registers to its home network as soon as registration is
/// requested.
pub struct MockState {
    pub calls: Vec<ModemCall>,
    pub device_ready: Script<CellularResult<()>>,
    pub power_on: Script<CellularResult<()>>,
    pub at_mode: Script<CellularResult<()>>,
    pub remove_ready_callback: CellularResult<()>,
    pub sim_state: Script<CellularResult<SimState>>,
    pub set_pin: CellularResult<()>,
    pub registration_urc: CellularResult<()>,
    /// Status reported on every registration channel without an override.
    pub registration: RegistrationStatus,
    /// Per-channel overrides of `registration`.
    pub channel_registration: HashMap<RegistrationType, RegistrationStatus>,
    /// Status adopted once `set_registration` succeeds. `None` leaves
    /// `registration` untouched.
    pub register_on_request: Option<RegistrationStatus>,
    pub set_registration: CellularResult<()>,
    pub operator: CellularResult<OperatorParams>,
    pub operator_names: CellularResult<Vec<OperatorName>>,
    pub attach: Script<CellularResult<()>>,
    pub attach_status: CellularResult<AttachStatus>,
    pub active_context: CellularResult<bool>,
    pub access_technology: CellularResult<()>,
    pub open_power: CellularResult<()>,
    pub opened: HandleCounts,
    pub closed: HandleCounts,
    pub device_ready_callback: Option<DeviceReadyCallback>,
    pub registration_callback: Option<RegistrationCallback>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            calls: Vec::new(),
            device_ready: Script::always(Err(CellularError::DeviceError)),
            power_on: Script::always(Ok(())),
            at_mode: Script::always(Ok(())),
            remove_ready_callback: Ok(()),
            sim_state: Script::always(Ok(SimState::Ready)),
            set_pin: Ok(()),
            registration_urc: Ok(()),
            registration: RegistrationStatus::NotRegistered,
            channel_registration: HashMap::new(),
            register_on_request: Some(RegistrationStatus::RegisteredHomeNetwork),
            set_registration: Ok(()),
            operator: Ok(OperatorParams::numeric("26201")),
            operator_names: Ok(Vec::new()),
            attach: Script::always(Ok(())),
            attach_status: Ok(AttachStatus::Detached),
            active_context: Ok(false),
            access_technology: Ok(()),
            open_power: Ok(()),
            opened: HandleCounts::default(),
            closed: HandleCounts::default(),
            device_ready_callback: None,
            registration_callback: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct MockModem {
    state: Arc<Mutex<MockState>>,
}

impl MockModem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: ModemCall) {
        self.lock().calls.push(call);
    }

    /// Mutate the script.
    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn calls(&self) -> Vec<ModemCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, call: &ModemCall) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn count_where(&self, pred: impl Fn(&ModemCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Handles currently open (opened minus dropped).
    pub fn open_handles(&self) -> HandleCounts {
        let s = self.lock();
        HandleCounts {
            power: s.opened.power - s.closed.power,
            sim: s.opened.sim - s.closed.sim,
            network: s.opened.network - s.closed.network,
        }
    }

    pub fn device(&self) -> MockDevice {
        MockDevice {
            modem: self.clone(),
        }
    }

    pub fn power(&self) -> Box<dyn Power> {
        self.lock().opened.power += 1;
        Box::new(MockPower {
            modem: self.clone(),
        })
    }

    pub fn sim(&self) -> Box<dyn Sim> {
        self.lock().opened.sim += 1;
        Box::new(MockSim {
            modem: self.clone(),
        })
    }

    pub fn network(&self) -> Box<dyn Network> {
        self.lock().opened.network += 1;
        Box::new(MockNetwork {
            modem: self.clone(),
        })
    }

    /// Invoke the registered device-ready callback. Returns `false` if none.
    pub fn fire_device_ready(&self) -> bool {
        let cb = self.lock().device_ready_callback.clone();
        match cb {
            Some(cb) => {
                cb();
                true
            }
            None => false,
        }
    }

    /// Push a registration URC through the registered callback and adopt its
    /// status. Returns `false` if no callback is registered.
    pub fn fire_registration(&self, status: RegistrationStatus) -> bool {
        let cb = {
            let mut s = self.lock();
            s.registration = status;
            s.registration_callback.clone()
        };
        match cb {
            Some(cb) => {
                cb(RegistrationUrc {
                    reg_type: RegistrationType::Eps,
                    status,
                    error: None,
                });
                true
            }
            None => false,
        }
    }
}

pub struct MockDevice {
    modem: MockModem,
}

impl CellularDevice for MockDevice {
    fn set_timeout(&mut self, timeout: Duration) {
        self.modem.record(ModemCall::SetTimeout(timeout));
    }

    fn open_power(&mut self) -> CellularResult<Box<dyn Power>> {
        self.modem.record(ModemCall::OpenPower);
        self.modem.with(|s| s.open_power)?;
        Ok(self.modem.power())
    }

    fn open_sim(&mut self) -> CellularResult<Box<dyn Sim>> {
        self.modem.record(ModemCall::OpenSim);
        Ok(self.modem.sim())
    }

    fn open_network(&mut self) -> CellularResult<Box<dyn Network>> {
        self.modem.record(ModemCall::OpenNetwork);
        Ok(self.modem.network())
    }
}

pub struct MockPower {
    modem: MockModem,
}

impl Power for MockPower {
    fn on(&mut self) -> CellularResult<()> {
        self.modem.record(ModemCall::PowerOn);
        self.modem.with(|s| s.power_on.next())
    }

    fn off(&mut self) -> CellularResult<()> {
        self.modem.record(ModemCall::PowerOff);
        Ok(())
    }

    fn is_device_ready(&mut self) -> CellularResult<()> {
        self.modem.record(ModemCall::IsDeviceReady);
        self.modem.with(|s| s.device_ready.next())
    }

    fn set_at_mode(&mut self) -> CellularResult<()> {
        self.modem.record(ModemCall::SetAtMode);
        self.modem.with(|s| s.at_mode.next())
    }

    fn set_device_ready_callback(&mut self, callback: DeviceReadyCallback) -> CellularResult<()> {
        self.modem.record(ModemCall::SetDeviceReadyCallback);
        self.modem.with(|s| s.device_ready_callback = Some(callback));
        Ok(())
    }

    fn remove_device_ready_callback(&mut self) -> CellularResult<()> {
        self.modem.record(ModemCall::RemoveDeviceReadyCallback);
        self.modem.with(|s| {
            if s.remove_ready_callback.is_ok() {
                s.device_ready_callback = None;
            }
            s.remove_ready_callback
        })
    }
}

impl Drop for MockPower {
    fn drop(&mut self) {
        self.modem.with(|s| s.closed.power += 1);
    }
}

pub struct MockSim {
    modem: MockModem,
}

impl Sim for MockSim {
    fn sim_state(&mut self) -> CellularResult<SimState> {
        self.modem.record(ModemCall::SimState);
        self.modem.with(|s| s.sim_state.next())
    }

    fn set_pin(&mut self, pin: &str) -> CellularResult<()> {
        self.modem.record(ModemCall::SetPin(pin.to_string()));
        self.modem.with(|s| s.set_pin)
    }
}

impl Drop for MockSim {
    fn drop(&mut self) {
        self.modem.with(|s| s.closed.sim += 1);
    }
}

pub struct MockNetwork {
    modem: MockModem,
}

impl Network for MockNetwork {
    fn set_registration_callback(&mut self, callback: RegistrationCallback) {
        self.modem.with(|s| s.registration_callback = Some(callback));
    }

    fn set_registration_urc(
        &mut self,
        reg_type: RegistrationType,
        on: bool,
    ) -> CellularResult<()> {
        self.modem
            .record(ModemCall::SetRegistrationUrc(reg_type, on));
        self.modem.with(|s| s.registration_urc)
    }

    fn set_registration(&mut self, plmn: Option<&str>) -> CellularResult<()> {
        self.modem
            .record(ModemCall::SetRegistration(plmn.map(str::to_string)));
        self.modem.with(|s| {
            if s.set_registration.is_ok() {
                if let Some(status) = s.register_on_request {
                    s.registration = status;
                }
            }
            s.set_registration
        })
    }

    fn registration_params(
        &mut self,
        reg_type: RegistrationType,
    ) -> CellularResult<RegistrationParams> {
        self.modem.record(ModemCall::RegistrationParams(reg_type));
        Ok(self.modem.with(|s| {
            let status = s
                .channel_registration
                .get(&reg_type)
                .copied()
                .unwrap_or(s.registration);
            RegistrationParams::with_status(status)
        }))
    }

    fn operator_params(&mut self) -> CellularResult<OperatorParams> {
        self.modem.record(ModemCall::OperatorParams);
        self.modem.with(|s| s.operator.clone())
    }

    fn operator_names(&mut self) -> CellularResult<Vec<OperatorName>> {
        self.modem.record(ModemCall::OperatorNames);
        self.modem.with(|s| s.operator_names.clone())
    }

    fn set_attach(&mut self) -> CellularResult<()> {
        self.modem.record(ModemCall::SetAttach);
        self.modem.with(|s| s.attach.next())
    }

    fn attach_status(&mut self) -> CellularResult<AttachStatus> {
        self.modem.record(ModemCall::AttachStatus);
        self.modem.with(|s| s.attach_status)
    }

    fn is_active_context(&mut self) -> CellularResult<bool> {
        self.modem.record(ModemCall::IsActiveContext);
        self.modem.with(|s| s.active_context)
    }

    fn set_access_technology(&mut self, rat: RadioAccessTechnology) -> CellularResult<()> {
        self.modem.record(ModemCall::SetAccessTechnology(rat));
        self.modem.with(|s| s.access_technology)
    }
}

impl Drop for MockNetwork {
    fn drop(&mut self) {
        self.modem.with(|s| s.closed.network += 1);
    }
}
