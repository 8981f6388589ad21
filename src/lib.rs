//! # Hesperus - Venus OS MQTT client library
//!
//! An async Rust client for the MQTT broker embedded in Victron Energy
//! Venus OS devices (Cerbo GX and friends). Hesperus subscribes to a
//! declaratively-described set of topics and exposes the device state as a
//! tree of devices and metrics with typed values, human-readable names and
//! optional write-back support.
//!
//! ## Features
//!
//! - **Topic resolution engine**: hundreds of topic patterns with
//!   wildcards, placeholders, phase rotation and numeric ranges resolve to
//!   uniquely-identified metrics, created exactly once
//! - **Full-publish barrier**: metric creation is synchronized with the
//!   device's "full publish completed" signal, so dependency ordering and
//!   adjustable-flag correlation always resolve
//! - **Typed values**: ints, floats, strings, booleans, enums, bitmasks,
//!   timestamps and duration conversions, decoded fail-closed
//! - **Derived metrics**: formula metrics (battery energy integrals)
//!   recompute reactively from their dependency metrics
//! - **Write-back**: switches, selects and numbers publish to their `W/`
//!   counterpart topic
//! - **Change callbacks**: per-metric update notifications and a hub-wide
//!   new-metric notification, dispatched off the message path
//!
//! ## Architecture
//!
//! - `config`: hub options and validation
//! - `logging`: structured logging and tracing
//! - `enums`: Victron device types and wire enums
//! - `topics`: topic descriptors and the built-in topic table
//! - `topic_parser`: incoming topic parsing and normalization
//! - `topic_map`: pattern expansion, filtering and lookup
//! - `codec`: JSON payload decode/encode
//! - `device` / `metric`: the runtime object graph
//! - `formula`: rolling-sum derived metrics
//! - `engine`: placeholder buffering and barrier commits
//! - `transport` / `hub`: MQTT lifecycle and the public entry point
//! - `testing`: broker-less test helpers

pub mod codec;
pub mod config;
pub mod device;
mod engine;
pub mod enums;
pub mod error;
mod formula;
pub mod hub;
pub mod logging;
pub mod metric;
pub mod testing;
pub mod topic_map;
pub mod topic_parser;
pub mod topics;
mod transport;

// Re-export commonly used types
pub use codec::MetricValue;
pub use config::{HubOptions, LoggingConfig, OperationMode};
pub use device::Device;
pub use enums::DeviceType;
pub use error::{HubError, Result};
pub use hub::Hub;
pub use metric::{Metric, WritableMetric};
pub use topics::{MetricKind, MetricNature, MetricType, RangeType, ValueType};
