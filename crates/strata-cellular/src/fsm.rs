//! # Cellular Bring-up State Machine
//!
//! Drives a modem from power-off to network attach, one state handler per
//! queue tick. Each handler sets the collaborator response timeout, runs the
//! state's operations, and then either enters the next state, schedules a
//! retry from the [`RetryTable`], or reports a final-try failure.
//!
//! Progress is tracked as a triple:
//!
//! | Field          | Meaning                                                 |
//! |----------------|---------------------------------------------------------|
//! | `state`        | handler that runs on the next tick                      |
//! | `next_state`   | where the machine goes once that handler returns        |
//! | `target_state` | highest state any caller asked for; never lowered       |
//!
//! Everything here runs on the worker thread that owns the [`Fsm`]; other
//! threads only reach it through messages (see [`crate::runtime`]).

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngExt as _;
use tracing::{debug, error, info, warn};

use crate::config::{CellularConfig, OperationTimeouts};
use crate::device::{CellularDevice, DeviceReadyCallback, Network, Power, RegistrationUrc, Sim};
use crate::error::{ok_or_unsupported, CellularError, CellularResult};
use crate::event::{build_event, EventData, EventKind, StatusCallback, StatusData};
use crate::plmn;
use crate::queue::{EventId, EventQueue};
use crate::retry::RetryTable;
use crate::types::{
    AttachStatus, CellularState, NetworkStatus, RadioAccessTechnology, RegistrationStatus,
    RegistrationType, SimState,
};

/// Unsolicited notifications routed back onto the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Urc {
    DeviceReady,
    Registration(RegistrationUrc),
}

/// Delivers collaborator notifications to the worker, from any thread.
pub(crate) type UrcSink = Arc<dyn Fn(Urc) + Send + Sync>;

/// Consistent snapshot of the machine's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellularStatus {
    pub current_state: CellularState,
    pub next_state: CellularState,
    pub target_state: CellularState,
    /// The last bring-up attempt exhausted its retries and is frozen.
    pub final_try: bool,
    pub last_error: Option<CellularError>,
    pub retry_count: usize,
    pub network_status: NetworkStatus,
    /// Whether the worker thread is servicing the machine.
    pub running: bool,
}

pub(crate) struct Fsm {
    device: Box<dyn CellularDevice>,
    power: Option<Box<dyn Power>>,
    sim: Option<Box<dyn Sim>>,
    network: Option<Box<dyn Network>>,
    urc_sink: UrcSink,
    callback: Option<StatusCallback>,

    sim_pin: Option<String>,
    plmn: Option<String>,
    rat: Option<RadioAccessTechnology>,
    retry: RetryTable,
    timeouts: OperationTimeouts,
    startup_delay_max: Duration,

    pub(crate) queue: EventQueue<CellularState>,
    pub(crate) event_id: Option<EventId>,
    event_timeout: Option<Duration>,
    is_retry: bool,

    state: CellularState,
    next_state: CellularState,
    target_state: CellularState,
    retry_count: usize,
    /// A registration request was accepted in the current state.
    command_success: bool,
    ready_callback_set: bool,
    network_status: NetworkStatus,

    current_event: EventKind,
    error: Option<CellularError>,
    status_data: Option<StatusData>,
    final_try: bool,
}

fn event_kind_for(state: CellularState) -> EventKind {
    match state {
        CellularState::Init | CellularState::PowerOn | CellularState::DeviceReady => {
            EventKind::DeviceReady
        }
        CellularState::SimPin => EventKind::SimStatusChanged,
        CellularState::SignalQuality | CellularState::RegisteringNetwork => {
            EventKind::RegistrationStatusChanged
        }
        CellularState::AttachingNetwork => EventKind::AttachStatusChanged,
    }
}

fn power_cycle_on(power: &mut dyn Power) -> CellularResult<()> {
    match ok_or_unsupported(power.on()) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(error = %e, "modem start failed, power off/on");
            if let Err(e) = power.off() {
                debug!(error = %e, "power off failed");
            }
            ok_or_unsupported(power.on())
        }
    }
}

impl Fsm {
    pub(crate) fn new(
        device: Box<dyn CellularDevice>,
        config: &CellularConfig,
        urc_sink: UrcSink,
    ) -> Self {
        Fsm {
            device,
            power: None,
            sim: None,
            network: None,
            urc_sink,
            callback: None,
            sim_pin: config.sim_pin.clone(),
            plmn: config.plmn.clone(),
            rat: config.radio_access_technology,
            retry: config.retry.clone(),
            timeouts: config.timeouts,
            startup_delay_max: config.startup_delay_max,
            queue: EventQueue::with_capacity(config.queue_capacity),
            event_id: None,
            event_timeout: None,
            is_retry: false,
            state: CellularState::Init,
            next_state: CellularState::Init,
            target_state: CellularState::Init,
            retry_count: 0,
            command_success: false,
            ready_callback_set: false,
            network_status: NetworkStatus::empty(),
            current_event: EventKind::DeviceReady,
            error: None,
            status_data: None,
            final_try: false,
        }
    }

    pub(crate) fn status(&self) -> CellularStatus {
        CellularStatus {
            current_state: self.state,
            next_state: self.next_state,
            target_state: self.target_state,
            final_try: self.final_try,
            last_error: self.error,
            retry_count: self.retry_count,
            network_status: self.network_status,
            running: false,
        }
    }

    // ─── Configuration ──────────────────────────────────────────────────

    pub(crate) fn set_callback(&mut self, callback: Option<StatusCallback>) {
        self.callback = callback;
    }

    pub(crate) fn set_sim_pin(&mut self, pin: Option<String>) {
        self.sim_pin = pin;
    }

    pub(crate) fn set_plmn(&mut self, plmn: Option<String>) {
        self.plmn = plmn;
    }

    pub(crate) fn set_retry_timeouts(&mut self, retry: RetryTable) {
        self.retry = retry;
    }

    // ─── Requests ───────────────────────────────────────────────────────

    /// Target reconciliation. Raises the target and, if the machine is idle,
    /// starts a tick. A request at or below the target is already covered,
    /// unless the machine is frozen after a final-try failure, in which case
    /// it resumes from the failed state.
    pub(crate) fn run_to_state(&mut self, requested: CellularState) {
        let frozen = self.final_try && self.event_id.is_none();
        if requested > self.target_state {
            debug!(from = %self.target_state, to = %requested, "target raised");
            self.target_state = requested;
        } else if !frozen {
            debug!(requested = %requested, target = %self.target_state, "request already covered");
            return;
        }

        if self.event_id.is_some() {
            return;
        }

        let from = if frozen {
            info!(state = %self.state, target = %self.target_state, "resuming failed bring-up");
            self.state
        } else {
            self.next_state
        };
        self.state = from;
        self.enter_to_state(from);
        self.schedule(Duration::ZERO);
    }

    /// Back to `Init` with nothing scheduled. Collaborator handles stay open.
    pub(crate) fn reset(&mut self) {
        self.cancel_pending();
        self.queue.clear();
        self.state = CellularState::Init;
        self.target_state = CellularState::Init;
        self.network_status.clear();
        self.enter_to_state(CellularState::Init);
        info!("cellular state machine reset");
    }

    /// Reset and release every collaborator handle.
    pub(crate) fn stop(&mut self) {
        self.reset();
        self.release_power();
        self.sim = None;
        self.network = None;
        info!("cellular state machine stopped");
    }

    /// Drops the power handle, unhooking the device-ready callback first.
    fn release_power(&mut self) {
        if let Some(mut power) = self.power.take() {
            if self.ready_callback_set {
                if let Err(e) = power.remove_device_ready_callback() {
                    debug!(error = %e, "remove device ready callback failed");
                }
            }
        }
        self.ready_callback_set = false;
    }

    // ─── Ticks ──────────────────────────────────────────────────────────

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.queue.next_deadline()
    }

    /// Run every tick due at `now`.
    pub(crate) fn dispatch_due(&mut self, now: Instant) {
        while let Some((id, _)) = self.queue.pop_due(now) {
            self.on_tick(id);
        }
    }

    pub(crate) fn on_tick(&mut self, id: EventId) {
        if self.event_id != Some(id) {
            debug!(event = %id, "stale tick dropped");
            return;
        }
        self.event_id = None;
        self.event_timeout = None;
        self.is_retry = false;
        self.current_event = event_kind_for(self.state);

        match self.state {
            CellularState::Init => self.state_init(),
            CellularState::PowerOn => self.state_power_on(),
            CellularState::DeviceReady => self.state_device_ready(),
            CellularState::SimPin => self.state_sim_pin(),
            CellularState::SignalQuality => self.state_signal_quality(),
            CellularState::RegisteringNetwork => self.state_registering(),
            CellularState::AttachingNetwork => self.state_attaching(),
        }

        self.finish_tick();
    }

    fn finish_tick(&mut self) {
        if self.final_try {
            return;
        }
        // A handler may skip past the target (a responsive modem jumps from
        // Init straight to DeviceReady); that counts as reaching it.
        let reached = self.state >= self.target_state || self.next_state > self.target_state;
        if reached && self.error.is_none() && !self.is_retry {
            if self.state < self.target_state {
                self.state = self.target_state;
            }
            info!(state = %self.state, "target state reached");
            return;
        }
        if self.next_state == self.state && self.event_timeout.is_none() {
            return;
        }

        if self.next_state != self.state {
            info!(from = %self.state, to = %self.next_state, "cellular state change");
        } else if let Some(delay) = self.event_timeout {
            info!(state = %self.state, delay_ms = delay.as_millis() as u64, "continue after delay");
        }
        self.state = self.next_state;
        let delay = self.event_timeout.unwrap_or(Duration::ZERO);
        self.schedule(delay);
    }

    fn schedule(&mut self, delay: Duration) {
        match self.queue.call_in(delay, self.state) {
            Ok(id) => self.event_id = Some(id),
            Err(e) => {
                self.event_id = None;
                error!(error = %e, "failed to schedule cellular tick");
                self.report_failure(CellularError::NoMemory);
            }
        }
    }

    fn enter_to_state(&mut self, state: CellularState) {
        self.next_state = state;
        self.retry_count = 0;
        self.command_success = false;
        self.error = None;
        self.status_data = None;
        self.final_try = false;
    }

    fn continue_from_state(&mut self, state: CellularState) {
        info!(from = %self.state, to = %state, "continue from state");
        self.state = state;
        self.enter_to_state(state);
        self.schedule(Duration::ZERO);
    }

    fn cancel_pending(&mut self) {
        if let Some(id) = self.event_id.take() {
            if !self.queue.cancel(id) {
                debug!(event = %id, "pending tick already gone");
            }
        }
        self.is_retry = false;
        self.event_timeout = None;
    }

    fn retry_state_or_fail(&mut self) {
        self.retry_count += 1;
        match self.retry.get(self.retry_count) {
            Some(delay) => {
                debug!(
                    state = %self.state,
                    retry = self.retry_count,
                    of = self.retry.len(),
                    error = ?self.error,
                    "retrying"
                );
                self.event_timeout = Some(delay);
                self.is_retry = true;
                self.error = None;
            }
            None => {
                let error = self.error.unwrap_or(CellularError::DeviceError);
                self.report_failure(error);
            }
        }
    }

    fn report_failure(&mut self, error: CellularError) {
        if let Some(id) = self.event_id.take() {
            self.queue.cancel(id);
        }
        self.event_timeout = None;
        self.is_retry = false;
        self.error = Some(error);
        self.final_try = true;
        error!(
            state = %self.state,
            target = %self.target_state,
            error = %error,
            "cellular bring-up failed"
        );
        self.send_event(self.current_event);
    }

    fn send_event(&mut self, kind: EventKind) {
        let event = build_event(
            kind,
            self.status_data,
            EventData {
                error: self.error,
                final_try: self.final_try,
            },
        );
        if let Some(callback) = self.callback.as_mut() {
            callback(event);
        }
    }

    fn startup_delay(&self) -> Duration {
        let max_ms = self.startup_delay_max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }

    // ─── Collaborator Handles ───────────────────────────────────────────

    fn power(&mut self) -> CellularResult<&mut Box<dyn Power>> {
        let power = match self.power.take() {
            Some(power) => power,
            None => self.device.open_power()?,
        };
        Ok(self.power.insert(power))
    }

    fn sim(&mut self) -> CellularResult<&mut Box<dyn Sim>> {
        let sim = match self.sim.take() {
            Some(sim) => sim,
            None => self.device.open_sim()?,
        };
        Ok(self.sim.insert(sim))
    }

    fn network(&mut self) -> CellularResult<&mut Box<dyn Network>> {
        let network = match self.network.take() {
            Some(network) => network,
            None => {
                let mut network = self.device.open_network()?;
                let sink = self.urc_sink.clone();
                network.set_registration_callback(Arc::new(move |urc| {
                    sink(Urc::Registration(urc))
                }));
                network
            }
        };
        Ok(self.network.insert(network))
    }

    // ─── State Handlers ─────────────────────────────────────────────────

    fn state_init(&mut self) {
        self.device.set_timeout(self.timeouts.power_on);
        info!(timeout_ms = self.timeouts.power_on.as_millis() as u64, "start connecting");
        match self.power().and_then(|p| p.is_device_ready()) {
            Ok(()) => {
                info!("modem already responsive");
                self.enter_to_state(CellularState::DeviceReady);
            }
            Err(e) => {
                debug!(error = %e, "modem not responsive");
                let delay = self.startup_delay();
                if !delay.is_zero() {
                    info!(delay_ms = delay.as_millis() as u64, "startup delay");
                }
                self.enter_to_state(CellularState::PowerOn);
                self.event_timeout = Some(delay);
            }
        }
    }

    fn state_power_on(&mut self) {
        self.device.set_timeout(self.timeouts.power_on);
        info!(timeout_ms = self.timeouts.power_on.as_millis() as u64, "modem power on");
        match self.power().and_then(|p| power_cycle_on(p.as_mut())) {
            Ok(()) => self.enter_to_state(CellularState::DeviceReady),
            Err(e) => {
                self.error = Some(e);
                self.retry_state_or_fail();
            }
        }
    }

    fn state_device_ready(&mut self) {
        self.device.set_timeout(self.timeouts.power_on);
        match self.power().and_then(|p| ok_or_unsupported(p.set_at_mode())) {
            Ok(()) => {
                self.device_ready();
                self.enter_to_state(CellularState::SimPin);
            }
            Err(e) => {
                self.error = Some(e);
                if self.retry_count == 0 {
                    self.register_ready_callback();
                }
                self.retry_state_or_fail();
            }
        }
    }

    fn register_ready_callback(&mut self) {
        let sink = self.urc_sink.clone();
        let callback: DeviceReadyCallback = Arc::new(move || sink(Urc::DeviceReady));
        if let Some(power) = self.power.as_mut() {
            match power.set_device_ready_callback(callback) {
                Ok(()) => self.ready_callback_set = true,
                Err(e) => debug!(error = %e, "device ready callback not available"),
            }
        }
    }

    /// One-time setup once the modem accepts commands. The power handle is
    /// not needed past this point.
    fn device_ready(&mut self) {
        info!("cellular device ready");
        self.error = None;
        self.status_data = None;
        self.send_event(EventKind::DeviceReady);
        self.release_power();

        if let Some(rat) = self.rat {
            match self
                .network()
                .and_then(|n| ok_or_unsupported(n.set_access_technology(rat)))
            {
                Ok(()) => info!(rat = %rat, "radio access technology set"),
                Err(e) => warn!(rat = %rat, error = %e, "failed to set radio access technology"),
            }
        }
    }

    fn state_sim_pin(&mut self) {
        self.device.set_timeout(self.timeouts.sim_pin);
        info!(timeout_ms = self.timeouts.sim_pin.as_millis() as u64, "setup SIM");
        match self.open_sim() {
            Ok(true) => {}
            Ok(false) => {
                self.retry_state_or_fail();
                return;
            }
            Err(e) => {
                self.report_failure(e);
                return;
            }
        }

        if !self.enable_registration_urcs() {
            error!("failed to enable any registration URC");
            self.retry_state_or_fail();
            return;
        }
        self.probe_network_status();
        self.enter_to_state(CellularState::SignalQuality);
    }

    /// `Ok(true)` once the SIM is ready, `Ok(false)` to retry, `Err` when
    /// retrying cannot help.
    fn open_sim(&mut self) -> CellularResult<bool> {
        let sim_state = match self.sim().and_then(|s| s.sim_state()) {
            Ok(sim_state) => sim_state,
            Err(e) => {
                info!(error = %e, "waiting for SIM");
                self.error = Some(e);
                return Ok(false);
            }
        };

        self.error = None;
        self.status_data = Some(StatusData::Sim(sim_state));
        self.send_event(EventKind::SimStatusChanged);

        match sim_state {
            SimState::Ready => Ok(true),
            SimState::PinNeeded => match self.sim_pin.clone() {
                Some(pin) => {
                    info!("entering PIN to open SIM");
                    if let Err(e) = self.sim().and_then(|s| s.set_pin(&pin)) {
                        error!(error = %e, "failed to set PIN");
                        self.error = Some(e);
                    }
                    Ok(false)
                }
                None => {
                    error!("PIN required but no SIM PIN provided");
                    self.retry_count = self.retry.len();
                    Err(CellularError::Parameter)
                }
            },
            SimState::PukNeeded | SimState::Unknown => {
                warn!(sim = %sim_state, "SIM not ready");
                Ok(false)
            }
        }
    }

    /// Any channel enabling is enough. Channels the modem does not support
    /// are skipped; the state only fails on a hard error with nothing enabled.
    fn enable_registration_urcs(&mut self) -> bool {
        let network = match self.network() {
            Ok(network) => network,
            Err(e) => {
                self.error = Some(e);
                return false;
            }
        };

        let mut enabled = false;
        let mut failure = None;
        for reg_type in RegistrationType::ALL {
            match network.set_registration_urc(reg_type, true) {
                Ok(()) => enabled = true,
                Err(CellularError::Unsupported) => {
                    debug!(reg_type = %reg_type, "registration URC unsupported")
                }
                Err(e) => {
                    warn!(reg_type = %reg_type, error = %e, "failed to enable registration URC");
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) if !enabled => {
                self.error = Some(e);
                false
            }
            _ => true,
        }
    }

    fn probe_network_status(&mut self) {
        let known = self.network_status;
        let Ok(network) = self.network() else {
            return;
        };

        let mut found = NetworkStatus::empty();
        if !known.contains(NetworkStatus::ACTIVE_PDP_CONTEXT) {
            if let Ok(true) = network.is_active_context() {
                found.insert(NetworkStatus::ACTIVE_PDP_CONTEXT);
            }
        }
        if !known.contains(NetworkStatus::ATTACHED_TO_NETWORK) {
            if let Ok(AttachStatus::Attached) = network.attach_status() {
                found.insert(NetworkStatus::ATTACHED_TO_NETWORK);
            }
        }

        if found.contains(NetworkStatus::ACTIVE_PDP_CONTEXT) {
            info!("PDP context already active");
            self.network_status.insert(NetworkStatus::ACTIVE_PDP_CONTEXT);
        }
        if found.contains(NetworkStatus::ATTACHED_TO_NETWORK) {
            info!("already attached to network");
            self.network_status.insert(NetworkStatus::ATTACHED_TO_NETWORK);
        }
    }

    fn state_signal_quality(&mut self) {
        debug!("signal quality check reserved, continuing to registration");
        self.enter_to_state(CellularState::RegisteringNetwork);
    }

    fn state_registering(&mut self) {
        self.device.set_timeout(self.timeouts.network);
        info!(
            timeout_ms = self.timeouts.registration.as_millis() as u64,
            plmn = ?self.plmn,
            "network registration"
        );

        if self.is_registered() {
            if !self.command_success {
                self.status_data = Some(StatusData::Registration(
                    RegistrationStatus::AlreadyRegistered,
                ));
            }
            self.error = None;
            self.send_event(EventKind::RegistrationStatusChanged);
            self.enter_to_state(CellularState::AttachingNetwork);
            return;
        }

        self.device.set_timeout(self.timeouts.registration);
        if !self.command_success {
            let plmn = self.plmn.clone();
            match self
                .network()
                .and_then(|n| ok_or_unsupported(n.set_registration(plmn.as_deref())))
            {
                Ok(()) => {
                    info!(plmn = ?plmn, "registration requested");
                    self.command_success = true;
                }
                Err(e) => {
                    warn!(error = %e, "registration request failed");
                    self.error = Some(e);
                }
            }
        }
        self.retry_state_or_fail();
    }

    /// Scans every registration channel, first registered one wins. With a
    /// pinned PLMN the operator must match as well.
    fn is_registered(&mut self) -> bool {
        let plmn = self.plmn.clone();
        let network = match self.network() {
            Ok(network) => network,
            Err(e) => {
                self.error = Some(e);
                return false;
            }
        };

        let mut status = None;
        let mut registered = false;
        for reg_type in RegistrationType::ALL {
            let params = match network.registration_params(reg_type) {
                Ok(params) => params,
                Err(CellularError::Unsupported) => continue,
                Err(e) => {
                    warn!(reg_type = %reg_type, error = %e, "get network registration failed");
                    continue;
                }
            };
            status = Some(params.status);
            match params.status {
                RegistrationStatus::RegisteredSmsOnlyHome
                | RegistrationStatus::RegisteredSmsOnlyRoaming => {
                    warn!("SMS only network registration")
                }
                RegistrationStatus::RegisteredCsfbNotPreferredHome
                | RegistrationStatus::RegisteredCsfbNotPreferredRoaming => {
                    warn!("not preferred network registration")
                }
                RegistrationStatus::AttachedEmergencyOnly => {
                    warn!("emergency only network registration")
                }
                _ => {}
            }
            if params.status.is_roaming() {
                info!("roaming cellular network");
            }
            if params.status.is_registered() {
                registered = true;
                break;
            }
        }

        if registered {
            if let Some(plmn) = plmn.as_deref() {
                registered = plmn::is_registered_to_plmn(network.as_mut(), plmn);
                if !registered {
                    debug!(plmn, "registered to a different operator");
                }
            }
        }

        self.status_data = status.map(StatusData::Registration);
        registered
    }

    fn state_attaching(&mut self) {
        self.device.set_timeout(self.timeouts.connect);
        info!(timeout_ms = self.timeouts.connect.as_millis() as u64, "attaching network");

        let result = if self
            .network_status
            .contains(NetworkStatus::ATTACHED_TO_NETWORK)
        {
            debug!("attach already done, skipping request");
            Ok(())
        } else {
            self.network()
                .and_then(|n| ok_or_unsupported(n.set_attach()))
        };

        match result {
            Ok(()) => {
                self.network_status
                    .insert(NetworkStatus::ATTACHED_TO_NETWORK);
                self.sim = None;
                self.error = None;
                self.status_data = Some(StatusData::Attach(AttachStatus::Attached));
                info!("attached to network");
                self.send_event(EventKind::AttachStatusChanged);
            }
            Err(e) => {
                self.error = Some(e);
                self.retry_state_or_fail();
            }
        }
    }

    // ─── Unsolicited Events ─────────────────────────────────────────────

    pub(crate) fn on_urc(&mut self, urc: Urc) {
        match urc {
            Urc::DeviceReady => self.on_device_ready_urc(),
            Urc::Registration(urc) => self.on_registration_urc(urc),
        }
    }

    fn on_device_ready_urc(&mut self) {
        debug!(state = %self.state, "device ready URC");
        if self.state != CellularState::DeviceReady || self.event_id.is_none() {
            return;
        }
        let at_mode = match self.power.as_mut() {
            Some(power) => ok_or_unsupported(power.set_at_mode()),
            None => return,
        };
        if at_mode.is_err() {
            return;
        }

        self.cancel_pending();
        self.current_event = EventKind::DeviceReady;
        self.device_ready();
        self.advance_after_urc(CellularState::SimPin);
    }

    /// A registration URC while a registration retry is pending wins over
    /// the poll: the pending tick is cancelled before moving on, so the
    /// slower path can only fire as a stale tick.
    fn on_registration_urc(&mut self, urc: RegistrationUrc) {
        debug!(
            state = %self.state,
            reg_type = %urc.reg_type,
            status = %urc.status,
            "registration URC"
        );
        if self.state != CellularState::RegisteringNetwork || self.event_id.is_none() {
            return;
        }
        if urc.error.is_some() || !urc.status.is_registered() {
            return;
        }
        if let Some(plmn) = self.plmn.clone() {
            let matched = match self.network() {
                Ok(network) => plmn::is_registered_to_plmn(network.as_mut(), &plmn),
                Err(_) => false,
            };
            if !matched {
                debug!(plmn = %plmn, "registration URC for a different operator");
                return;
            }
        }

        self.cancel_pending();
        info!(status = %urc.status, "registered, skipping pending retry");
        self.current_event = EventKind::RegistrationStatusChanged;
        self.error = None;
        self.status_data = Some(StatusData::Registration(urc.status));
        self.send_event(EventKind::RegistrationStatusChanged);
        self.advance_after_urc(CellularState::AttachingNetwork);
    }

    fn advance_after_urc(&mut self, next: CellularState) {
        if self.state >= self.target_state {
            self.enter_to_state(next);
            info!(state = %self.state, "target state reached");
        } else {
            self.continue_from_state(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CellularEvent;
    use crate::test_util::{MockModem, ModemCall, Script};
    use crate::types::{OperatorName, OperatorParams};
    use proptest::prelude::*;
    use std::sync::Mutex;

    // ─── Harness ────────────────────────────────────────────────────────

    struct Harness {
        fsm: Fsm,
        modem: MockModem,
        events: Arc<Mutex<Vec<CellularEvent>>>,
        urcs: Arc<Mutex<Vec<Urc>>>,
    }

    fn harness_with(modem: MockModem, configure: impl FnOnce(&mut CellularConfig)) -> Harness {
        let mut config = CellularConfig::default();
        configure(&mut config);

        let urcs = Arc::new(Mutex::new(Vec::new()));
        let sink_urcs = urcs.clone();
        let sink: UrcSink = Arc::new(move |urc| sink_urcs.lock().unwrap().push(urc));

        let events = Arc::new(Mutex::new(Vec::new()));
        let cb_events = events.clone();
        let mut fsm = Fsm::new(Box::new(modem.device()), &config, sink);
        fsm.set_callback(Some(Box::new(move |ev| cb_events.lock().unwrap().push(ev))));

        Harness {
            fsm,
            modem,
            events,
            urcs,
        }
    }

    fn harness() -> Harness {
        harness_with(MockModem::new(), |_| {})
    }

    impl Harness {
        /// Fire the earliest pending tick, ignoring its deadline.
        fn step(&mut self) -> bool {
            match self.fsm.queue.pop_next() {
                Some((id, _)) => {
                    self.fsm.on_tick(id);
                    true
                }
                None => false,
            }
        }

        fn drive(&mut self) -> usize {
            let mut ticks = 0;
            while self.step() {
                ticks += 1;
                assert!(ticks < 500, "state machine did not settle");
            }
            ticks
        }

        fn step_until(&mut self, pred: impl Fn(&Harness) -> bool) {
            for _ in 0..500 {
                if pred(self) {
                    return;
                }
                assert!(self.step(), "queue drained before condition held");
            }
            panic!("condition never held");
        }

        fn status(&self) -> CellularStatus {
            self.fsm.status()
        }

        fn events(&self) -> Vec<CellularEvent> {
            self.events.lock().unwrap().clone()
        }

        fn final_tries(&self) -> Vec<CellularEvent> {
            self.events()
                .into_iter()
                .filter(|e| e.is_final_try())
                .collect()
        }
    }

    fn short_retry(n: usize) -> impl FnOnce(&mut CellularConfig) {
        move |c| c.retry = RetryTable::new(&vec![Duration::from_millis(1); n])
    }

    // ─── Full Bring-up ──────────────────────────────────────────────────

    #[test]
    fn cold_modem_reaches_attached() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        let status = h.status();
        assert_eq!(status.current_state, CellularState::AttachingNetwork);
        assert_eq!(status.target_state, CellularState::AttachingNetwork);
        assert!(!status.final_try);
        assert_eq!(status.last_error, None);
        assert!(h.fsm.queue.is_empty());

        assert_eq!(h.modem.count(&ModemCall::PowerOn), 1);
        assert_eq!(h.modem.count(&ModemCall::SetRegistration(None)), 1);
        assert_eq!(h.modem.count(&ModemCall::SetAttach), 1);

        let last = h.events().last().copied();
        assert!(matches!(
            last,
            Some(CellularEvent::AttachStatusChanged {
                status: Some(AttachStatus::Attached),
                data: EventData { error: None, final_try: false },
            })
        ));
    }

    #[test]
    fn handles_released_as_bring_up_progresses() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        let open = h.modem.open_handles();
        assert_eq!(open.power, 0, "power handle released after device ready");
        assert_eq!(open.sim, 0, "SIM handle released after attach");
        assert_eq!(open.network, 1);
    }

    #[test]
    fn responsive_modem_skips_power_on() {
        let modem = MockModem::new();
        modem.with(|s| s.device_ready = Script::always(Ok(())));
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert_eq!(h.modem.count(&ModemCall::PowerOn), 0);
        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
    }

    #[test]
    fn responsive_modem_stops_at_lower_target() {
        let modem = MockModem::new();
        modem.with(|s| s.device_ready = Script::always(Ok(())));
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::PowerOn);
        h.drive();

        let status = h.status();
        assert_eq!(status.current_state, CellularState::PowerOn);
        assert_eq!(status.next_state, CellularState::DeviceReady);
        assert_eq!(h.modem.count(&ModemCall::SetAtMode), 0);
        assert!(h.events().is_empty());
        assert_eq!(h.modem.open_handles().power, 1);

        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();
        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
        assert_eq!(h.modem.count(&ModemCall::PowerOn), 0);
        assert_eq!(h.modem.count(&ModemCall::SetAtMode), 1);
    }

    #[test]
    fn failed_power_on_cycles_power() {
        let modem = MockModem::new();
        modem.with(|s| {
            s.power_on = Script::always(Ok(())).then([Err(CellularError::DeviceError)])
        });
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::DeviceReady);
        h.drive();

        let power_calls: Vec<ModemCall> = h
            .modem
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ModemCall::PowerOn | ModemCall::PowerOff))
            .collect();
        assert_eq!(
            power_calls,
            vec![ModemCall::PowerOn, ModemCall::PowerOff, ModemCall::PowerOn]
        );
        assert_eq!(h.status().current_state, CellularState::DeviceReady);
    }

    #[test]
    fn timeouts_set_before_each_stage() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        let defaults = OperationTimeouts::default();
        for timeout in [
            defaults.power_on,
            defaults.sim_pin,
            defaults.network,
            defaults.registration,
            defaults.connect,
        ] {
            assert!(
                h.modem.count(&ModemCall::SetTimeout(timeout)) > 0,
                "timeout {timeout:?} never applied"
            );
        }
    }

    // ─── Target Reconciliation ──────────────────────────────────────────

    #[test]
    fn lower_request_does_not_lower_target() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.fsm.run_to_state(CellularState::SimPin);
        assert_eq!(h.status().target_state, CellularState::AttachingNetwork);
    }

    #[test]
    fn repeated_request_schedules_one_tick() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        assert_eq!(h.fsm.queue.len(), 1);

        h.step();
        let pending = h.fsm.queue.len();
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        assert_eq!(h.fsm.queue.len(), pending);
    }

    #[test]
    fn raising_target_while_converging_adds_no_tick() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::DeviceReady);
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        assert_eq!(h.fsm.queue.len(), 1);
        h.drive();
        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
    }

    #[test]
    fn stops_at_intermediate_target_then_continues() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::DeviceReady);
        h.drive();

        let status = h.status();
        assert_eq!(status.current_state, CellularState::DeviceReady);
        assert_eq!(status.next_state, CellularState::SimPin);
        assert_eq!(h.modem.count(&ModemCall::OpenSim), 0);

        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();
        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
        assert_eq!(h.modem.count(&ModemCall::PowerOn), 1, "no restart from Init");
    }

    #[test]
    fn signal_quality_target_terminates() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::SignalQuality);
        h.drive();
        let status = h.status();
        assert_eq!(status.current_state, CellularState::SignalQuality);
        assert_eq!(status.next_state, CellularState::RegisteringNetwork);
        assert_eq!(h.modem.count(&ModemCall::SetRegistration(None)), 0);
    }

    #[test]
    fn request_for_init_is_a_no_op() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::Init);
        assert!(h.fsm.queue.is_empty());
    }

    // ─── Retry / Failure ────────────────────────────────────────────────

    #[test]
    fn retry_exhaustion_reports_final_try_once() {
        let modem = MockModem::new();
        modem.with(|s| s.sim_state = Script::always(Err(CellularError::DeviceError)));
        let mut h = harness_with(modem, short_retry(3));
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert_eq!(h.modem.count(&ModemCall::SimState), 3);
        let finals = h.final_tries();
        assert_eq!(finals.len(), 1);
        assert!(matches!(
            finals[0],
            CellularEvent::SimStatusChanged {
                data: EventData {
                    error: Some(CellularError::DeviceError),
                    final_try: true
                },
                ..
            }
        ));
        assert!(h.fsm.queue.is_empty(), "nothing scheduled after final try");

        let status = h.status();
        assert!(status.final_try);
        assert_eq!(status.current_state, CellularState::SimPin);
        assert_eq!(status.target_state, CellularState::AttachingNetwork);
    }

    #[test]
    fn retry_delays_follow_table() {
        let modem = MockModem::new();
        modem.with(|s| s.sim_state = Script::always(Err(CellularError::DeviceError)));
        let table = [
            Duration::from_secs(1),
            Duration::from_secs(7),
            Duration::from_secs(13),
        ];
        let mut h = harness_with(modem, |c| c.retry = RetryTable::new(&table));
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.step_until(|h| h.fsm.status().current_state == CellularState::SimPin);
        let before = Instant::now();
        h.step();
        let deadline = h.fsm.next_deadline().unwrap();
        assert!(deadline >= before + Duration::from_secs(7));
        assert!(deadline < before + Duration::from_secs(13));
    }

    #[test]
    fn missing_pin_fails_without_retrying() {
        let modem = MockModem::new();
        modem.with(|s| s.sim_state = Script::always(Ok(SimState::PinNeeded)));
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert_eq!(h.modem.count(&ModemCall::SimState), 1);
        let finals = h.final_tries();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].error(), Some(CellularError::Parameter));
        assert_eq!(h.status().last_error, Some(CellularError::Parameter));
    }

    #[test]
    fn configured_pin_is_entered() {
        let modem = MockModem::new();
        modem.with(|s| {
            s.sim_state =
                Script::always(Ok(SimState::Ready)).then([Ok(SimState::PinNeeded)])
        });
        let mut h = harness_with(modem, |c| c.sim_pin = Some("1234".into()));
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert_eq!(h.modem.count(&ModemCall::SetPin("1234".into())), 1);
        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
        let sim_events: Vec<Option<SimState>> = h
            .events()
            .into_iter()
            .filter_map(|e| match e {
                CellularEvent::SimStatusChanged { sim, .. } => Some(sim),
                _ => None,
            })
            .collect();
        assert_eq!(
            sim_events,
            vec![Some(SimState::PinNeeded), Some(SimState::Ready)]
        );
    }

    #[test]
    fn resume_after_final_try_continues_from_failed_state() {
        let modem = MockModem::new();
        modem.with(|s| s.sim_state = Script::always(Err(CellularError::DeviceError)));
        let mut h = harness_with(modem, short_retry(2));
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();
        assert!(h.status().final_try);

        h.modem.with(|s| s.sim_state = Script::always(Ok(SimState::Ready)));
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        assert_eq!(h.fsm.queue.len(), 1);
        assert!(!h.status().final_try);
        h.drive();

        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
        assert_eq!(h.modem.count(&ModemCall::PowerOn), 1, "resumed, not restarted");
    }

    #[test]
    fn queue_exhaustion_is_final() {
        let mut h = harness_with(MockModem::new(), |c| c.queue_capacity = 0);
        h.fsm.run_to_state(CellularState::AttachingNetwork);

        let status = h.status();
        assert!(status.final_try);
        assert_eq!(status.last_error, Some(CellularError::NoMemory));
        assert_eq!(h.final_tries().len(), 1);
    }

    #[test]
    fn urc_enable_failure_on_every_channel_retries() {
        let modem = MockModem::new();
        modem.with(|s| s.registration_urc = Err(CellularError::DeviceError));
        let mut h = harness_with(modem, short_retry(2));
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert!(h.status().final_try);
        assert_eq!(h.status().current_state, CellularState::SimPin);
    }

    #[test]
    fn unsupported_urcs_do_not_block_registration() {
        let modem = MockModem::new();
        modem.with(|s| s.registration_urc = Err(CellularError::Unsupported));
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();
        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
    }

    // ─── Registration ───────────────────────────────────────────────────

    #[test]
    fn already_registered_skips_registration_request() {
        let modem = MockModem::new();
        modem.with(|s| s.registration = RegistrationStatus::RegisteredHomeNetwork);
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert_eq!(
            h.modem
                .count_where(|c| matches!(c, ModemCall::SetRegistration(_))),
            0
        );
        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
        assert!(h.events().iter().any(|e| matches!(
            e,
            CellularEvent::RegistrationStatusChanged {
                status: Some(RegistrationStatus::AlreadyRegistered),
                ..
            }
        )));
    }

    #[test]
    fn circuit_switched_registration_is_detected() {
        let modem = MockModem::new();
        modem.with(|s| {
            s.register_on_request = None;
            s.channel_registration.insert(
                RegistrationType::CircuitSwitched,
                RegistrationStatus::RegisteredHomeNetwork,
            );
        });
        let mut h = harness_with(modem, short_retry(3));
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
        assert!(!h.status().final_try);
        assert_eq!(
            h.modem
                .count_where(|c| matches!(c, ModemCall::SetRegistration(_))),
            0
        );
        assert_eq!(
            h.modem.count(&ModemCall::RegistrationParams(
                RegistrationType::CircuitSwitched
            )),
            1
        );
        assert_eq!(h.modem.count(&ModemCall::SetAttach), 1);
    }

    #[test]
    fn registration_requested_once_per_state() {
        let modem = MockModem::new();
        modem.with(|s| s.register_on_request = None);
        let mut h = harness_with(modem, short_retry(4));
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert_eq!(h.modem.count(&ModemCall::SetRegistration(None)), 1);
        assert!(h.status().final_try);
        assert_eq!(h.status().current_state, CellularState::RegisteringNetwork);
    }

    #[test]
    fn pinned_plmn_rejects_other_operator() {
        let modem = MockModem::new();
        modem.with(|s| {
            s.registration = RegistrationStatus::RegisteredHomeNetwork;
            s.operator = Ok(OperatorParams::numeric("26201"));
        });
        let mut h = harness_with(modem, |c| {
            c.plmn = Some("26202".into());
            c.retry = RetryTable::new(&[Duration::from_millis(1); 3]);
        });
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert_eq!(
            h.modem.count(&ModemCall::SetRegistration(Some("26202".into()))),
            1
        );
        assert_eq!(h.modem.count(&ModemCall::SetAttach), 0);
        assert!(h.status().final_try);
    }

    #[test]
    fn pinned_plmn_matches_by_alpha_name() {
        let modem = MockModem::new();
        modem.with(|s| {
            s.registration = RegistrationStatus::RegisteredRoaming;
            s.operator = Ok(OperatorParams::long_alpha("Vodafone"));
            s.operator_names = Ok(vec![
                OperatorName::new("26201", "Telekom.de"),
                OperatorName::new("26202", "Vodafone"),
            ]);
        });
        let mut h = harness_with(modem, |c| c.plmn = Some("26202".into()));
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
        assert_eq!(h.modem.count(&ModemCall::SetAttach), 1);
    }

    // ─── URC Handling ───────────────────────────────────────────────────

    #[test]
    fn registration_urc_cancels_pending_retry() {
        let modem = MockModem::new();
        modem.with(|s| s.register_on_request = None);
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.step_until(|h| h.modem.count(&ModemCall::SetRegistration(None)) == 1);

        assert_eq!(h.status().current_state, CellularState::RegisteringNetwork);
        let stale = h.fsm.event_id.expect("retry pending");

        assert!(h.modem.fire_registration(RegistrationStatus::RegisteredRoaming));
        let urcs: Vec<Urc> = h.urcs.lock().unwrap().drain(..).collect();
        assert_eq!(urcs.len(), 1);
        for urc in urcs {
            h.fsm.on_urc(urc);
        }

        assert!(!h.fsm.queue.contains(stale));
        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);

        // The cancelled poll firing late must not transition again.
        h.fsm.on_tick(stale);
        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
        assert_eq!(h.modem.count(&ModemCall::SetAttach), 0);

        h.drive();
        assert_eq!(h.modem.count(&ModemCall::SetAttach), 1);
        let registered = h
            .events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    CellularEvent::RegistrationStatusChanged {
                        status: Some(RegistrationStatus::RegisteredRoaming),
                        ..
                    }
                )
            })
            .count();
        assert_eq!(registered, 1);
    }

    #[test]
    fn registration_urc_ignored_outside_registering() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.step_until(|h| h.fsm.status().current_state == CellularState::SignalQuality);

        let pending = h.fsm.event_id;
        h.fsm.on_urc(Urc::Registration(RegistrationUrc {
            reg_type: RegistrationType::Eps,
            status: RegistrationStatus::RegisteredHomeNetwork,
            error: None,
        }));
        assert_eq!(h.fsm.event_id, pending);
        assert_eq!(h.status().current_state, CellularState::SignalQuality);
    }

    #[test]
    fn unregistered_urc_does_not_advance() {
        let modem = MockModem::new();
        modem.with(|s| s.register_on_request = None);
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.step_until(|h| h.modem.count(&ModemCall::SetRegistration(None)) == 1);
        let pending = h.fsm.event_id;

        h.fsm.on_urc(Urc::Registration(RegistrationUrc {
            reg_type: RegistrationType::Eps,
            status: RegistrationStatus::SearchingNetwork,
            error: None,
        }));
        assert_eq!(h.fsm.event_id, pending);
        assert_eq!(h.status().current_state, CellularState::RegisteringNetwork);
    }

    #[test]
    fn registration_urc_for_other_operator_does_not_advance() {
        let modem = MockModem::new();
        modem.with(|s| {
            s.register_on_request = None;
            s.operator = Ok(OperatorParams::numeric("26201"));
        });
        let mut h = harness_with(modem, |c| c.plmn = Some("26202".into()));
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.step_until(|h| {
            h.modem
                .count(&ModemCall::SetRegistration(Some("26202".into())))
                == 1
        });
        let pending = h.fsm.event_id.expect("retry pending");

        assert!(h.modem.fire_registration(RegistrationStatus::RegisteredHomeNetwork));
        let urcs: Vec<Urc> = h.urcs.lock().unwrap().drain(..).collect();
        assert_eq!(urcs.len(), 1);
        for urc in urcs {
            h.fsm.on_urc(urc);
        }

        assert_eq!(h.fsm.event_id, Some(pending));
        assert!(h.fsm.queue.contains(pending));
        assert_eq!(h.status().current_state, CellularState::RegisteringNetwork);
        assert_eq!(h.modem.count(&ModemCall::SetAttach), 0);
        assert!(!h.events().iter().any(|e| matches!(
            e,
            CellularEvent::RegistrationStatusChanged {
                status: Some(RegistrationStatus::RegisteredHomeNetwork),
                ..
            }
        )));
    }

    #[test]
    fn device_ready_urc_skips_pending_retry() {
        let modem = MockModem::new();
        modem.with(|s| {
            s.at_mode = Script::always(Ok(())).then([Err(CellularError::DeviceError)])
        });
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.step_until(|h| h.modem.count(&ModemCall::SetAtMode) == 1);

        assert_eq!(h.status().current_state, CellularState::DeviceReady);
        assert_eq!(h.modem.count(&ModemCall::SetDeviceReadyCallback), 1);
        let stale = h.fsm.event_id.expect("retry pending");

        assert!(h.modem.fire_device_ready());
        let urcs: Vec<Urc> = h.urcs.lock().unwrap().drain(..).collect();
        assert_eq!(urcs, vec![Urc::DeviceReady]);
        h.fsm.on_urc(Urc::DeviceReady);

        assert!(!h.fsm.queue.contains(stale));
        assert_eq!(h.status().current_state, CellularState::SimPin);
        assert_eq!(h.modem.count(&ModemCall::RemoveDeviceReadyCallback), 1);
        assert_eq!(h.modem.open_handles().power, 0);

        h.drive();
        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
    }

    #[test]
    fn stop_releases_power_when_callback_removal_fails() {
        let modem = MockModem::new();
        modem.with(|s| {
            s.at_mode = Script::always(Err(CellularError::DeviceError));
            s.remove_ready_callback = Err(CellularError::DeviceError);
        });
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.step_until(|h| h.modem.count(&ModemCall::SetDeviceReadyCallback) == 1);
        assert_eq!(h.modem.open_handles().power, 1);

        h.fsm.stop();
        assert_eq!(h.modem.count(&ModemCall::RemoveDeviceReadyCallback), 1);
        assert_eq!(h.modem.open_handles(), Default::default());
        assert!(h.fsm.queue.is_empty());

        // A second stop has no callback left to unhook.
        h.fsm.stop();
        assert_eq!(h.modem.count(&ModemCall::RemoveDeviceReadyCallback), 1);
    }

    #[test]
    fn device_ready_callback_registered_once() {
        let modem = MockModem::new();
        modem.with(|s| s.at_mode = Script::always(Err(CellularError::DeviceError)));
        let mut h = harness_with(modem, short_retry(4));
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert_eq!(h.modem.count(&ModemCall::SetAtMode), 4);
        assert_eq!(h.modem.count(&ModemCall::SetDeviceReadyCallback), 1);
        assert!(h.status().final_try);
    }

    // ─── Network Status Flags ───────────────────────────────────────────

    #[test]
    fn existing_attach_skips_attach_request() {
        let modem = MockModem::new();
        modem.with(|s| {
            s.attach_status = Ok(AttachStatus::Attached);
            s.active_context = Ok(true);
        });
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        assert_eq!(h.modem.count(&ModemCall::SetAttach), 0);
        let flags = h.status().network_status;
        assert!(flags.contains(NetworkStatus::ATTACHED_TO_NETWORK));
        assert!(flags.contains(NetworkStatus::ACTIVE_PDP_CONTEXT));
        assert!(matches!(
            h.events().last(),
            Some(CellularEvent::AttachStatusChanged {
                status: Some(AttachStatus::Attached),
                ..
            })
        ));
    }

    #[test]
    fn attach_failure_retries() {
        let modem = MockModem::new();
        modem.with(|s| {
            s.attach = Script::always(Ok(())).then([
                Err(CellularError::DeviceError),
                Err(CellularError::DeviceError),
            ])
        });
        let mut h = harness_with(modem, |_| {});
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();
        assert_eq!(h.modem.count(&ModemCall::SetAttach), 3);
        assert!(!h.status().final_try);
    }

    #[test]
    fn radio_access_technology_applied_after_ready() {
        let mut h = harness_with(MockModem::new(), |c| {
            c.radio_access_technology = Some(RadioAccessTechnology::CatM1)
        });
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();
        assert_eq!(
            h.modem.count(&ModemCall::SetAccessTechnology(
                RadioAccessTechnology::CatM1
            )),
            1
        );
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    #[test]
    fn reset_keeps_handles_and_stop_releases_them() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();

        h.fsm.reset();
        let status = h.status();
        assert_eq!(status.current_state, CellularState::Init);
        assert_eq!(status.next_state, CellularState::Init);
        assert_eq!(status.target_state, CellularState::Init);
        assert!(status.network_status.is_empty());
        assert_eq!(h.modem.open_handles().network, 1);

        h.fsm.stop();
        assert_eq!(h.modem.open_handles(), Default::default());
    }

    #[test]
    fn reset_cancels_pending_tick() {
        let mut h = harness();
        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.step();
        assert!(!h.fsm.queue.is_empty());
        h.fsm.reset();
        assert!(h.fsm.queue.is_empty());
        assert!(h.fsm.event_id.is_none());

        h.fsm.run_to_state(CellularState::AttachingNetwork);
        h.drive();
        assert_eq!(h.status().current_state, CellularState::AttachingNetwork);
    }

    // ─── Properties ─────────────────────────────────────────────────────

    fn any_state() -> impl Strategy<Value = CellularState> {
        (0..CellularState::ALL.len()).prop_map(|i| CellularState::ALL[i])
    }

    proptest! {
        #[test]
        fn target_never_decreases(
            ops in proptest::collection::vec(
                prop_oneof![any_state().prop_map(Some), Just(None)],
                1..40,
            )
        ) {
            let mut h = harness();
            let mut highest = CellularState::Init;
            for op in ops {
                let before = h.status().target_state;
                match op {
                    Some(state) => {
                        h.fsm.run_to_state(state);
                        highest = highest.max(state);
                    }
                    None => {
                        h.step();
                    }
                }
                let after = h.status().target_state;
                prop_assert!(after >= before);
                prop_assert_eq!(after, highest);
                prop_assert!(h.fsm.queue.len() <= 1);
            }
        }
    }
}
