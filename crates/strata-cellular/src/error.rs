use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

/// Outcome of a collaborator operation or a scheduling request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CellularError {
    /// The collaborator cannot perform the operation. Non-fatal: the caller
    /// proceeds as if the step was skipped.
    #[error("operation not supported by the modem")]
    Unsupported,
    /// The collaborator reported a hard failure. Counts as a failed attempt.
    #[error("modem reported a device error")]
    DeviceError,
    /// Scheduling or allocation failed. Always final.
    #[error("out of queue capacity")]
    NoMemory,
    /// Caller configuration error. Always final; retrying cannot help.
    #[error("invalid parameter")]
    Parameter,
    /// The state machine worker is gone.
    #[error("state machine worker is not available")]
    Disconnected,
}

pub type CellularResult<T> = Result<T, CellularError>;

/// `Unsupported` is treated as success for optional steps.
pub(crate) fn ok_or_unsupported(result: CellularResult<()>) -> CellularResult<()> {
    match result {
        Err(CellularError::Unsupported) => Ok(()),
        other => other,
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("SIM PIN must be 4-8 digits")]
    InvalidPin,
    #[error("PLMN must be 5-6 digits, got {0:?}")]
    InvalidPlmn(String),
}
