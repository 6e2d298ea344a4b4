//! # Status Events
//!
//! Values handed to the status callback on every transition, sub-status
//! change, and final-try failure. Each event is passed by value; nothing
//! borrowed from the state machine outlives the call.

use std::fmt;

use crate::error::CellularError;
use crate::types::{AttachStatus, RegistrationStatus, SimState};

/// Status callback, invoked synchronously on the state machine worker.
pub type StatusCallback = Box<dyn FnMut(CellularEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DeviceReady,
    SimStatusChanged,
    RegistrationStatusChanged,
    AttachStatusChanged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::DeviceReady => write!(f, "device-ready"),
            EventKind::SimStatusChanged => write!(f, "sim-status"),
            EventKind::RegistrationStatusChanged => write!(f, "registration-status"),
            EventKind::AttachStatusChanged => write!(f, "attach-status"),
        }
    }
}

/// Outcome shared by every event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventData {
    /// Error of the last attempted operation; `None` means it succeeded.
    pub error: Option<CellularError>,
    /// The retry budget is spent; no further automatic attempts will occur.
    pub final_try: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellularEvent {
    DeviceReady {
        data: EventData,
    },
    SimStatusChanged {
        sim: Option<SimState>,
        data: EventData,
    },
    RegistrationStatusChanged {
        status: Option<RegistrationStatus>,
        data: EventData,
    },
    AttachStatusChanged {
        status: Option<AttachStatus>,
        data: EventData,
    },
}

impl CellularEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CellularEvent::DeviceReady { .. } => EventKind::DeviceReady,
            CellularEvent::SimStatusChanged { .. } => EventKind::SimStatusChanged,
            CellularEvent::RegistrationStatusChanged { .. } => {
                EventKind::RegistrationStatusChanged
            }
            CellularEvent::AttachStatusChanged { .. } => EventKind::AttachStatusChanged,
        }
    }

    pub fn data(&self) -> EventData {
        match self {
            CellularEvent::DeviceReady { data }
            | CellularEvent::SimStatusChanged { data, .. }
            | CellularEvent::RegistrationStatusChanged { data, .. }
            | CellularEvent::AttachStatusChanged { data, .. } => *data,
        }
    }

    pub fn is_final_try(&self) -> bool {
        self.data().final_try
    }

    pub fn error(&self) -> Option<CellularError> {
        self.data().error
    }
}

/// Status payload cached between a collaborator read and the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusData {
    Sim(SimState),
    Registration(RegistrationStatus),
    Attach(AttachStatus),
}

/// Builds the event for `kind` from the cached payload and outcome.
pub(crate) fn build_event(
    kind: EventKind,
    status: Option<StatusData>,
    data: EventData,
) -> CellularEvent {
    match kind {
        EventKind::DeviceReady => CellularEvent::DeviceReady { data },
        EventKind::SimStatusChanged => CellularEvent::SimStatusChanged {
            sim: match status {
                Some(StatusData::Sim(s)) => Some(s),
                _ => None,
            },
            data,
        },
        EventKind::RegistrationStatusChanged => CellularEvent::RegistrationStatusChanged {
            status: match status {
                Some(StatusData::Registration(s)) => Some(s),
                _ => None,
            },
            data,
        },
        EventKind::AttachStatusChanged => CellularEvent::AttachStatusChanged {
            status: match status {
                Some(StatusData::Attach(s)) => Some(s),
                _ => None,
            },
            data,
        },
    }
}
