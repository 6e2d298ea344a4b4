//! # Cellular Runtime
//!
//! Owns the bring-up state machine and the worker thread that services it.
//!
//! The worker is the only place the machine is mutated. Everything else
//! reaches it through a bounded crossbeam channel:
//!
//! - **Requests** (`run_to_state`) and collaborator URCs are fire-and-forget.
//!   A full channel refuses the request with [`CellularError::NoMemory`].
//! - **Updates** (setters, `reset`) block until the worker has applied them,
//!   so a following [`CellularStateMachine::current_status`] already
//!   reflects the change.
//!
//! Reads go through a status snapshot behind a mutex that the worker
//! republishes after every message and tick.
//!
//! Requests sent before [`CellularStateMachine::start_dispatch`] wait in the
//! channel. Stopping parks the machine together with the channel receiver,
//! so the worker can be started again later.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::config::{validate_pin, validate_plmn, CellularConfig};
use crate::device::CellularDevice;
use crate::error::{CellularError, CellularResult};
use crate::event::{CellularEvent, StatusCallback};
use crate::fsm::{CellularStatus, Fsm, Urc, UrcSink};
use crate::retry::RetryTable;
use crate::types::CellularState;

/// Messages serviced by the worker thread.
enum Command {
    RunToState(CellularState),
    Urc(Urc),
    Apply(Update, Sender<()>),
    Stop,
}

/// Synchronous changes, acknowledged once applied.
enum Update {
    SimPin(Option<String>),
    Plmn(Option<String>),
    RetryTimeouts(RetryTable),
    Callback(Option<StatusCallback>),
    Reset,
}

type Parked = (Fsm, Receiver<Command>);

/// Owner of a cellular bring-up state machine.
///
/// Dropping it stops the worker and releases every collaborator handle.
pub struct CellularStateMachine {
    control_tx: Sender<Command>,
    status: Arc<Mutex<CellularStatus>>,
    retry: RetryTable,
    parked: Option<Parked>,
    handle: Option<thread::JoinHandle<Parked>>,
}

impl CellularStateMachine {
    pub fn new(device: Box<dyn CellularDevice>, config: CellularConfig) -> Self {
        let (control_tx, control_rx) = bounded(config.queue_capacity.max(1));

        let urc_tx = control_tx.clone();
        let sink: UrcSink = Arc::new(move |urc| match urc_tx.try_send(Command::Urc(urc)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(?urc, "control channel full, URC dropped"),
            Err(TrySendError::Disconnected(_)) => {}
        });

        let fsm = Fsm::new(device, &config, sink);
        let status = Arc::new(Mutex::new(fsm.status()));

        Self {
            control_tx,
            status,
            retry: config.retry,
            parked: Some((fsm, control_rx)),
            handle: None,
        }
    }

    /// Starts the worker thread. Idempotent while it is running.
    pub fn start_dispatch(&mut self) -> CellularResult<()> {
        let Some((fsm, control_rx)) = self.parked.take() else {
            return match self.handle {
                Some(_) => Ok(()),
                None => Err(CellularError::Disconnected),
            };
        };

        let status = self.status.clone();
        let spawned = thread::Builder::new()
            .name("cellular-fsm".into())
            .spawn(move || dispatch_worker(fsm, control_rx, status));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                info!("cellular dispatch started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to spawn cellular worker");
                Err(CellularError::NoMemory)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Cancels any pending work, releases the collaborator handles, resets
    /// the machine to `Init` and halts the worker. Idempotent.
    pub fn stop(&mut self) {
        match self.handle.take() {
            Some(handle) => {
                let _ = self.control_tx.send(Command::Stop);
                match handle.join() {
                    Ok(parked) => self.parked = Some(parked),
                    Err(_) => error!("cellular worker panicked"),
                }
            }
            None => {
                if let Some((fsm, _)) = self.parked.as_mut() {
                    fsm.stop();
                }
            }
        }

        if let Some((fsm, control_rx)) = self.parked.as_mut() {
            discard_pending(fsm, control_rx);
            publish(&self.status, fsm.status());
        }
    }

    /// Back to `Init` without releasing collaborator handles.
    pub fn reset(&mut self) -> CellularResult<()> {
        self.apply(Update::Reset)
    }

    /// Requests that the machine reach at least `state`. Only reports
    /// whether the request was queued; progress is observed through the
    /// status callback and [`Self::current_status`].
    pub fn run_to_state(&self, state: CellularState) -> CellularResult<()> {
        request(&self.control_tx, state)
    }

    pub fn current_status(&self) -> CellularStatus {
        snapshot(&self.status)
    }

    /// Cloneable entry point for other threads.
    pub fn handle(&self) -> CellularHandle {
        CellularHandle {
            control_tx: self.control_tx.clone(),
            status: self.status.clone(),
        }
    }

    // ─── Configuration ──────────────────────────────────────────────────

    /// `None` or blank clears the PIN.
    pub fn set_sim_pin(&mut self, pin: Option<&str>) -> CellularResult<()> {
        let pin = validate_pin(pin).map_err(|e| {
            warn!(error = %e, "SIM PIN rejected");
            CellularError::Parameter
        })?;
        self.apply(Update::SimPin(pin))
    }

    /// Pin registration to a numeric operator code. `None` or blank accepts
    /// any network.
    pub fn set_plmn(&mut self, plmn: Option<&str>) -> CellularResult<()> {
        let plmn = validate_plmn(plmn).map_err(|e| {
            warn!(error = %e, "PLMN rejected");
            CellularError::Parameter
        })?;
        self.apply(Update::Plmn(plmn))
    }

    /// Replaces the retry table. Entries past [`RetryTable::CAPACITY`] are
    /// dropped.
    pub fn set_retry_timeouts(&mut self, timeouts: &[Duration]) -> CellularResult<()> {
        let retry = RetryTable::new(timeouts);
        self.apply(Update::RetryTimeouts(retry.clone()))?;
        self.retry = retry;
        Ok(())
    }

    pub fn retry_timeouts(&self) -> &[Duration] {
        self.retry.as_slice()
    }

    /// Invoked on the worker thread for every status event. Replaces any
    /// previous callback.
    pub fn set_status_callback<F>(&mut self, callback: F) -> CellularResult<()>
    where
        F: FnMut(CellularEvent) + Send + 'static,
    {
        self.apply(Update::Callback(Some(Box::new(callback))))
    }

    pub fn clear_status_callback(&mut self) -> CellularResult<()> {
        self.apply(Update::Callback(None))
    }

    fn apply(&mut self, update: Update) -> CellularResult<()> {
        if let Some((fsm, _)) = self.parked.as_mut() {
            apply_update(fsm, update);
            publish(&self.status, fsm.status());
            return Ok(());
        }

        let (ack_tx, ack_rx) = bounded(1);
        self.control_tx
            .send(Command::Apply(update, ack_tx))
            .map_err(|_| CellularError::Disconnected)?;
        ack_rx.recv().map_err(|_| CellularError::Disconnected)
    }
}

impl Drop for CellularStateMachine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Thread-safe handle for requesting progress and reading status.
#[derive(Clone)]
pub struct CellularHandle {
    control_tx: Sender<Command>,
    status: Arc<Mutex<CellularStatus>>,
}

impl CellularHandle {
    pub fn run_to_state(&self, state: CellularState) -> CellularResult<()> {
        request(&self.control_tx, state)
    }

    pub fn current_status(&self) -> CellularStatus {
        snapshot(&self.status)
    }
}

fn request(control_tx: &Sender<Command>, state: CellularState) -> CellularResult<()> {
    match control_tx.try_send(Command::RunToState(state)) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            warn!(state = %state, "control channel full, request refused");
            Err(CellularError::NoMemory)
        }
        Err(TrySendError::Disconnected(_)) => Err(CellularError::Disconnected),
    }
}

fn snapshot(status: &Mutex<CellularStatus>) -> CellularStatus {
    *status.lock().unwrap_or_else(|e| e.into_inner())
}

fn publish(status: &Mutex<CellularStatus>, value: CellularStatus) {
    *status.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

fn running(fsm: &Fsm) -> CellularStatus {
    CellularStatus {
        running: true,
        ..fsm.status()
    }
}

fn apply_update(fsm: &mut Fsm, update: Update) {
    match update {
        Update::SimPin(pin) => fsm.set_sim_pin(pin),
        Update::Plmn(plmn) => fsm.set_plmn(plmn),
        Update::RetryTimeouts(retry) => fsm.set_retry_timeouts(retry),
        Update::Callback(callback) => fsm.set_callback(callback),
        Update::Reset => fsm.reset(),
    }
}

/// Drops requests and URCs still queued for a stopped machine so a later
/// `start_dispatch` does not resume an abandoned bring-up.
fn discard_pending(fsm: &mut Fsm, control_rx: &Receiver<Command>) {
    let mut dropped = 0usize;
    for command in control_rx.try_iter() {
        match command {
            Command::RunToState(_) | Command::Urc(_) | Command::Stop => dropped += 1,
            Command::Apply(update, ack) => {
                apply_update(fsm, update);
                let _ = ack.send(());
            }
        }
    }
    if dropped > 0 {
        debug!(dropped, "discarded pending cellular requests");
    }
}

fn dispatch_worker(
    mut fsm: Fsm,
    control_rx: Receiver<Command>,
    status: Arc<Mutex<CellularStatus>>,
) -> Parked {
    debug!("cellular worker running");
    publish(&status, running(&fsm));

    loop {
        let received = match fsm.next_deadline() {
            Some(deadline) => control_rx.recv_deadline(deadline),
            None => control_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Command::RunToState(state)) => fsm.run_to_state(state),
            Ok(Command::Urc(urc)) => fsm.on_urc(urc),
            Ok(Command::Apply(update, ack)) => {
                apply_update(&mut fsm, update);
                publish(&status, running(&fsm));
                let _ = ack.send(());
            }
            Ok(Command::Stop) => {
                fsm.stop();
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        fsm.dispatch_due(Instant::now());
        publish(&status, running(&fsm));
    }

    publish(&status, fsm.status());
    debug!("cellular worker parked");
    (fsm, control_rx)
}
