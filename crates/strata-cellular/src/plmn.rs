//! # Operator / PLMN Matching
//!
//! Decides whether the modem is registered to the operator the caller pinned,
//! rather than to any network at all.
//!
//! The modem reports the current operator in one of three encodings. A
//! numeric report is compared directly; an alphanumeric one is first mapped
//! back to its numeric code through the modem's operator-name table.
//!
//! Fails closed: any collaborator error means "no match". Never retries
//! internally; the calling state owns retry policy.

use tracing::{debug, warn};

use crate::device::Network;
use crate::types::{OperatorFormat, OperatorName, OperatorParams};

/// Whether the operator currently reported by `network` is `plmn`.
pub fn is_registered_to_plmn(network: &mut dyn Network, plmn: &str) -> bool {
    let params = match network.operator_params() {
        Ok(params) => params,
        Err(e) => {
            warn!(error = %e, "failed to read operator params");
            return false;
        }
    };

    if params.format == OperatorFormat::Numeric {
        return params.numeric == plmn;
    }

    let names = match network.operator_names() {
        Ok(names) => names,
        Err(e) => {
            warn!(error = %e, "failed to read operator names");
            return false;
        }
    };

    matches_plmn(&params, &names, plmn)
}

/// Pure matching step over an already-fetched operator report and name table.
pub fn matches_plmn(params: &OperatorParams, names: &[OperatorName], plmn: &str) -> bool {
    let alpha = match params.format {
        OperatorFormat::Numeric => return params.numeric == plmn,
        OperatorFormat::LongAlpha => params.long_name.as_str(),
        OperatorFormat::ShortAlpha => params.short_name.as_str(),
    };

    match names.iter().find(|n| n.alpha == alpha) {
        Some(entry) => {
            debug!(operator = alpha, numeric = %entry.numeric, plmn, "operator name resolved");
            entry.numeric == plmn
        }
        None => {
            debug!(operator = alpha, "operator not in name table");
            false
        }
    }
}
