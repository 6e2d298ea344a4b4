//! # strata-cellular
//!
//! Cellular modem bring-up for Strata field units: power-on, SIM unlock,
//! network registration and packet attach, driven as a retrying state
//! machine on its own worker thread.
//!
//! ## Crate structure
//!
//! - [`types`]: States, SIM/registration/attach statuses, operator identity
//! - [`error`]: `CellularError` taxonomy and config errors
//! - [`retry`]: Bounded retry timeout table
//! - [`plmn`]: Operator/PLMN matching
//! - [`device`]: Collaborator traits the machine drives
//! - [`event`]: Status events handed to the caller's callback
//! - [`queue`]: Cooperative timer queue
//! - [`fsm`]: Bring-up state machine core
//! - [`runtime`]: `CellularStateMachine` owner, worker thread and handles
//! - [`config`]: TOML configuration
//! - [`test_util`]: Scriptable in-memory modem

pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod fsm;
pub mod plmn;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod test_util;
pub mod types;

pub use config::CellularConfig;
pub use error::{CellularError, CellularResult, ConfigError};
pub use event::{CellularEvent, EventData, EventKind};
pub use fsm::CellularStatus;
pub use runtime::{CellularHandle, CellularStateMachine};
pub use types::CellularState;
