//! ferry: a durable retry queue for outbound mail relay.
//!
//! Jobs are persisted by [`ferry_queue`], retried with exponential backoff by
//! [`ferry_delivery`] and managed through [`ferry_control`]. This crate wires
//! them together from a RON configuration file.

pub mod controller;

pub use controller::{Assembly, Ferry, SHUTDOWN_BROADCAST};
