//! Charge estimation and cell health classification.
//!
//! The charge curve is a two-segment linear approximation of a LiFePO4
//! discharge curve. It is a voltage-only estimate, not coulomb counting.

use crate::types::HealthStatus;

/// Voltage mapped to 0% charge
pub const EMPTY_VOLTAGE: f64 = 2.5;

/// Knee of the discharge curve, mapped to 50% charge
pub const KNEE_VOLTAGE: f64 = 3.2;

/// Voltage mapped to 100% charge
pub const FULL_VOLTAGE: f64 = 3.65;

/// Below this a cell is critical
pub const CRITICAL_VOLTAGE: f64 = 3.0;

/// Below this (and at or above [`CRITICAL_VOLTAGE`]) a cell is in warning
pub const WARNING_VOLTAGE: f64 = 3.1;

/// Estimate state of charge in percent from a cell voltage
///
/// Clamped to `0..=100`; monotonically non-decreasing in `voltage`.
#[must_use]
pub fn charge_percentage(voltage: f64) -> u8 {
    let percent = if voltage.is_nan() || voltage <= EMPTY_VOLTAGE {
        0.0
    } else if voltage < KNEE_VOLTAGE {
        (voltage - EMPTY_VOLTAGE) / (KNEE_VOLTAGE - EMPTY_VOLTAGE) * 50.0
    } else if voltage < FULL_VOLTAGE {
        50.0 + (voltage - KNEE_VOLTAGE) / (FULL_VOLTAGE - KNEE_VOLTAGE) * 50.0
    } else {
        100.0
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let percent = percent.round().clamp(0.0, 100.0) as u8;
    percent
}

/// Classify a cell by voltage
#[must_use]
pub fn classify(voltage: f64) -> HealthStatus {
    if voltage < CRITICAL_VOLTAGE {
        HealthStatus::Critical
    } else if voltage < WARNING_VOLTAGE {
        HealthStatus::Warning
    } else {
        HealthStatus::Normal
    }
}

/// Round to two decimal places
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
