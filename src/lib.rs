//! # ratemon
//!
//! A per-packet IPv4 rate monitor. Traffic rates are tracked as fixed-point
//! EWMAs bucketed by address prefix, one tree level per octet: a bucket whose
//! rate crosses the configured threshold *zooms in*, growing a finer-grained
//! child level, and cold subtrees are *folded* back when memory pressure
//! rises. Buckets can also stamp passing packets with a time-bounded
//! annotation byte.
//!
//! The monitor is a passive element: the host hands packets in on the push
//! or pull path and forwards them afterwards, and drives the operator
//! surface through named string handlers (`look`, `mem`, `memmax`, `thresh`,
//! `anno_level`, `reset`).
//!
//! ## Example
//!
//! ```rust
//! use ratemon::{MonitorConfig, RateMonitor, RawPacket};
//!
//! let monitor = RateMonitor::new(MonitorConfig::default()).unwrap();
//!
//! let mut pkt = RawPacket::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64);
//! monitor.push(0, &mut pkt);
//!
//! let table = monitor.read_handler("look").unwrap();
//! assert!(table.contains("10"));
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

pub mod clock;
pub mod ewma;
pub mod handlers;
pub mod monitor;
pub mod packet;
mod tree;

#[cfg(test)]
mod proptests;

pub use clock::{ManualClock, SystemClock, TickClock};
pub use handlers::HandlerError;
pub use monitor::{
    ConfigError, CountMode, MonitorConfig, RateMonitor, MEMMAX_MIN_KIB, RATIO_ONE,
};
pub use packet::{Packet, RawPacket};
