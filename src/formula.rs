//! Derived-metric formulas
//!
//! Formula metrics have no inbound topic; they recompute from dependency
//! metrics whenever one of them updates. Each formula is a pure function
//! over the dependency map plus a small rolling state record. Returning
//! `None` means "nothing to publish this cycle" and leaves the metric's
//! current value untouched.

use crate::metric::Metric;
use std::collections::HashMap;
use std::time::Instant;

/// Maximum interval one reading may contribute to the rolling sum. Readings
/// arrive at least once per 30 s keepalive cycle; larger gaps mean data loss
/// and must not be integrated.
const LRS_MAX_INTERVAL_SECS: f64 = 30.0;

/// A formula function: dependency metrics in, updated value out.
pub(crate) type FormulaFn =
    fn(&HashMap<String, Metric>, &mut FormulaState, Instant) -> Option<f64>;

/// Rolling state carried between formula invocations.
#[derive(Debug, Default)]
pub(crate) struct FormulaState {
    last: Option<LastReading>,
    accumulated: f64,
}

#[derive(Debug)]
struct LastReading {
    timestamp: Instant,
    value: f64,
}

/// Resolve a formula function by the last segment of its `$$func/` topic.
pub(crate) fn formula_by_name(name: &str) -> Option<FormulaFn> {
    match name {
        "battery_charged_energy" => Some(battery_charged_energy),
        "battery_discharged_energy" => Some(battery_discharged_energy),
        _ => None,
    }
}

/// The single input value for a left-Riemann-sum formula.
fn lrs_input(depends_on: &HashMap<String, Metric>) -> Option<f64> {
    let metric = depends_on.values().next()?;
    metric.value()?.as_f64()
}

/// Advance the rolling Left Riemann Sum by one reading.
///
/// The left (previous) value is integrated over the elapsed interval, capped
/// at [`LRS_MAX_INTERVAL_SECS`]; the result accumulates in watt-hours when
/// the input is in watts.
fn accumulate(state: &mut FormulaState, reading: f64, now: Instant) -> f64 {
    let reading = reading.max(0.0);
    match state.last.take() {
        None => {
            state.last = Some(LastReading {
                timestamp: now,
                value: reading,
            });
        }
        Some(last) => {
            let dt = now
                .duration_since(last.timestamp)
                .as_secs_f64()
                .min(LRS_MAX_INTERVAL_SECS);
            let dt_hours = dt / 3600.0;
            if last.value > 0.0 {
                state.accumulated += last.value * dt_hours;
            }
            state.last = Some(LastReading {
                timestamp: now,
                value: reading,
            });
        }
    }
    state.accumulated
}

/// Energy flowing into the battery, integrated from system battery power.
pub(crate) fn battery_charged_energy(
    depends_on: &HashMap<String, Metric>,
    state: &mut FormulaState,
    now: Instant,
) -> Option<f64> {
    let power = lrs_input(depends_on)?;
    // Only charging power accumulates
    let charging = if power < 0.0 { 0.0 } else { power };
    Some(accumulate(state, charging, now))
}

/// Energy flowing out of the battery, integrated from system battery power.
pub(crate) fn battery_discharged_energy(
    depends_on: &HashMap<String, Metric>,
    state: &mut FormulaState,
    now: Instant,
) -> Option<f64> {
    let power = lrs_input(depends_on)?;
    // Discharge is reported negative; flip it and ignore charging
    let discharging = if power > 0.0 { 0.0 } else { -power };
    Some(accumulate(state, discharging, now))
}
