//! Porttrap - a low-interaction TCP honeypot
//!
//! Listens on a contiguous range of TCP ports, tracks per-port and
//! per-connection statistics, optionally answers connections with a
//! configured payload, attributes peers with geolocation data, and shuts
//! every listener down cleanly on a termination signal.

pub mod config;
pub mod connection;
pub mod enrich;
pub mod events;
pub mod listener;
pub mod manager;
pub mod sink;
