/*!
 * Built-in instrument drivers.
 *
 * Every driver here is registered in [`builtin_source`], which the scanner
 * inspects like any other driver source. Family modules declare a base
 * contract that model drivers overlay with their own envelopes.
 */
use std::sync::Arc;

use benchflow_core::types::Value;

use crate::contract::{member_matches, CallArgs};
use crate::driver::DriverFactory;
use crate::sources::StaticDriverSource;

pub mod awg;
pub mod daq;
pub mod dmm;
pub mod generic;
pub mod lockin;
pub mod sourcemeter;

pub use awg::{Agilent81150aFactory, Agilent81150a};
pub use daq::{Usb231Factory, Usb231};
pub use dmm::{Keithley193aFactory, Keithley193a};
pub use generic::{GenericScpi, GenericScpiFactory};
pub use lockin::{Sr830, Sr830Factory};
pub use sourcemeter::{Keithley2400, Keithley2400Factory};

/// Name of the compiled-in driver source
pub const BUILTIN_SOURCE: &str = "builtin";

/// Factories of every auto-selectable built-in driver
pub fn builtin_factories() -> Vec<Arc<dyn DriverFactory>> {
    vec![
        Arc::new(Sr830Factory),
        Arc::new(Agilent81150aFactory),
        Arc::new(Keithley2400Factory),
        Arc::new(Keithley193aFactory),
        Arc::new(Usb231Factory),
    ]
}

/// The compiled-in driver source
///
/// The generic SCPI driver carries no identity markers; it is included so
/// that it can be loaded by class path, and the scanner skips it.
pub fn builtin_source() -> StaticDriverSource {
    builtin_factories().into_iter().fold(
        StaticDriverSource::new(BUILTIN_SOURCE).with(generic_factory()),
        StaticDriverSource::with,
    )
}

/// Fallback driver for unidentified stream devices
pub fn generic_factory() -> Arc<dyn DriverFactory> {
    Arc::new(GenericScpiFactory)
}

/// Index of `value` within an instrument's enumerated setting table
///
/// Small settings can all fall within the absolute tolerance of one
/// another, so numeric values pick the nearest matching member.
pub(crate) fn position<T>(members: &[T], value: &Value) -> Option<usize>
where
    T: Into<Value> + Copy,
{
    let candidates = members
        .iter()
        .enumerate()
        .map(|(i, member)| (i, (*member).into()))
        .filter(|(_, member): &(usize, Value)| member_matches(member, value));

    match value.to_f64() {
        Some(v) => candidates
            .filter_map(|(i, member)| member.to_f64().map(|m| (i, (m - v).abs())))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i),
        None => candidates.map(|(i, _)| i).next(),
    }
}

/// Channel argument, defaulting to `default` when unspecified
pub(crate) fn channel(args: &CallArgs, default: i64) -> i64 {
    args.get("channel")
        .and_then(|v| v.to_f64())
        .map(|v| v as i64)
        .unwrap_or(default)
}

/// `ON`/`OFF` keyword for a switch argument
pub(crate) fn on_off(value: &Value) -> &'static str {
    let enabled = match value {
        Value::Bool(b) => *b,
        other => matches!(other.normalized().as_str(), "1" | "on" | "true"),
    };
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}
