//! # Cellular Domain Types
//!
//! State enumeration of the bring-up machine plus the value types exchanged
//! with the power, SIM and network collaborators.

use std::fmt;

use serde::Deserialize;

// ─── Bring-up State ─────────────────────────────────────────────────────────

/// Ordered bring-up states. Ordering is significant: a requested state
/// is "behind" or "ahead of" the current progress by plain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum CellularState {
    #[default]
    Init,
    PowerOn,
    DeviceReady,
    SimPin,
    /// Reserved. Passes straight through to [`CellularState::RegisteringNetwork`].
    SignalQuality,
    RegisteringNetwork,
    AttachingNetwork,
}

impl CellularState {
    pub const ALL: [CellularState; 7] = [
        CellularState::Init,
        CellularState::PowerOn,
        CellularState::DeviceReady,
        CellularState::SimPin,
        CellularState::SignalQuality,
        CellularState::RegisteringNetwork,
        CellularState::AttachingNetwork,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CellularState::Init => "Init",
            CellularState::PowerOn => "Power ON",
            CellularState::DeviceReady => "Device ready",
            CellularState::SimPin => "SIM pin",
            CellularState::SignalQuality => "Signal quality",
            CellularState::RegisteringNetwork => "Registering network",
            CellularState::AttachingNetwork => "Attaching network",
        }
    }
}

impl fmt::Display for CellularState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── SIM ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimState {
    Ready,
    PinNeeded,
    PukNeeded,
    Unknown,
}

impl fmt::Display for SimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimState::Ready => write!(f, "ready"),
            SimState::PinNeeded => write!(f, "PIN needed"),
            SimState::PukNeeded => write!(f, "PUK needed"),
            SimState::Unknown => write!(f, "unknown"),
        }
    }
}

// ─── Registration ───────────────────────────────────────────────────────────

/// Registration channel reported by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationType {
    /// EPS (LTE) packet-switched registration (`+CEREG`).
    Eps,
    /// GPRS packet-switched registration (`+CGREG`).
    Gprs,
    /// Circuit-switched registration (`+CREG`).
    CircuitSwitched,
}

impl RegistrationType {
    /// Every channel, in the order registration is polled.
    pub const ALL: [RegistrationType; 3] = [
        RegistrationType::Eps,
        RegistrationType::Gprs,
        RegistrationType::CircuitSwitched,
    ];
}

impl fmt::Display for RegistrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationType::Eps => write!(f, "EPS"),
            RegistrationType::Gprs => write!(f, "GPRS"),
            RegistrationType::CircuitSwitched => write!(f, "CS"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RegistrationStatus {
    #[default]
    NotRegistered,
    RegisteredHomeNetwork,
    SearchingNetwork,
    RegistrationDenied,
    Unknown,
    RegisteredRoaming,
    RegisteredSmsOnlyHome,
    RegisteredSmsOnlyRoaming,
    AttachedEmergencyOnly,
    RegisteredCsfbNotPreferredHome,
    RegisteredCsfbNotPreferredRoaming,
    /// The modem was registered before any registration request was issued.
    AlreadyRegistered,
}

impl RegistrationStatus {
    /// Whether packet data can proceed on this registration.
    pub fn is_registered(&self) -> bool {
        matches!(
            self,
            RegistrationStatus::RegisteredHomeNetwork
                | RegistrationStatus::RegisteredRoaming
                | RegistrationStatus::AlreadyRegistered
        )
    }

    pub fn is_roaming(&self) -> bool {
        matches!(
            self,
            RegistrationStatus::RegisteredRoaming
                | RegistrationStatus::RegisteredSmsOnlyRoaming
                | RegistrationStatus::RegisteredCsfbNotPreferredRoaming
        )
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationStatus::NotRegistered => "not registered",
            RegistrationStatus::RegisteredHomeNetwork => "registered (home)",
            RegistrationStatus::SearchingNetwork => "searching",
            RegistrationStatus::RegistrationDenied => "denied",
            RegistrationStatus::Unknown => "unknown",
            RegistrationStatus::RegisteredRoaming => "registered (roaming)",
            RegistrationStatus::RegisteredSmsOnlyHome => "SMS only (home)",
            RegistrationStatus::RegisteredSmsOnlyRoaming => "SMS only (roaming)",
            RegistrationStatus::AttachedEmergencyOnly => "emergency only",
            RegistrationStatus::RegisteredCsfbNotPreferredHome => "CSFB not preferred (home)",
            RegistrationStatus::RegisteredCsfbNotPreferredRoaming => {
                "CSFB not preferred (roaming)"
            }
            RegistrationStatus::AlreadyRegistered => "already registered",
        };
        f.write_str(s)
    }
}

/// Registration status plus the cell metadata the modem reports with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistrationParams {
    pub status: RegistrationStatus,
    pub act: Option<RadioAccessTechnology>,
    pub cell_id: Option<u32>,
    pub lac: Option<u16>,
}

impl RegistrationParams {
    pub fn with_status(status: RegistrationStatus) -> Self {
        RegistrationParams {
            status,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachStatus {
    Detached,
    Attached,
}

impl fmt::Display for AttachStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachStatus::Detached => write!(f, "detached"),
            AttachStatus::Attached => write!(f, "attached"),
        }
    }
}

/// Radio access technology the modem can be pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RadioAccessTechnology {
    Gsm,
    Utran,
    Eutran,
    CatM1,
    Nb1,
}

impl fmt::Display for RadioAccessTechnology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioAccessTechnology::Gsm => write!(f, "GSM"),
            RadioAccessTechnology::Utran => write!(f, "UTRAN"),
            RadioAccessTechnology::Eutran => write!(f, "E-UTRAN"),
            RadioAccessTechnology::CatM1 => write!(f, "LTE-M"),
            RadioAccessTechnology::Nb1 => write!(f, "NB-IoT"),
        }
    }
}

// ─── Network Status Flags ───────────────────────────────────────────────────

/// Facts discovered once per bring-up and never re-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkStatus(u8);

impl NetworkStatus {
    pub const ACTIVE_PDP_CONTEXT: NetworkStatus = NetworkStatus(0x01);
    pub const ATTACHED_TO_NETWORK: NetworkStatus = NetworkStatus(0x02);

    pub const fn empty() -> Self {
        NetworkStatus(0)
    }

    pub fn contains(&self, flag: NetworkStatus) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn insert(&mut self, flag: NetworkStatus) {
        self.0 |= flag.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

// ─── Operator Identity ──────────────────────────────────────────────────────

/// Encoding the modem used when reporting the current operator (`+COPS` format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorFormat {
    LongAlpha = 0,
    ShortAlpha = 1,
    Numeric = 2,
}

/// Current operator as reported by the network collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorParams {
    pub format: OperatorFormat,
    pub long_name: String,
    pub short_name: String,
    pub numeric: String,
}

impl OperatorParams {
    pub fn numeric(plmn: &str) -> Self {
        OperatorParams {
            format: OperatorFormat::Numeric,
            long_name: String::new(),
            short_name: String::new(),
            numeric: plmn.to_string(),
        }
    }

    pub fn long_alpha(name: &str) -> Self {
        OperatorParams {
            format: OperatorFormat::LongAlpha,
            long_name: name.to_string(),
            short_name: String::new(),
            numeric: String::new(),
        }
    }

    pub fn short_alpha(name: &str) -> Self {
        OperatorParams {
            format: OperatorFormat::ShortAlpha,
            long_name: String::new(),
            short_name: name.to_string(),
            numeric: String::new(),
        }
    }
}

/// One numeric↔alpha pair from the modem's operator-name table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorName {
    pub numeric: String,
    pub alpha: String,
}

impl OperatorName {
    pub fn new(numeric: &str, alpha: &str) -> Self {
        OperatorName {
            numeric: numeric.to_string(),
            alpha: alpha.to_string(),
        }
    }
}
