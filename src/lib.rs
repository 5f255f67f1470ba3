//! RS-485 gateway for heat-pump controllers.
//!
//! Sits on the field bus next to the master display panel, takes part in
//! the panel's token-arbitrated protocol, mirrors the controller's
//! parameter set into an in-memory cache and serves it over a small REST
//! API. Layering, bottom up: [`protocol`] (framing + CRC), [`codec`]
//! (value types), [`transport`] (the serial port task), [`handler`] (the
//! bus engine: token, correlator, discovery, polling, writes, alarms),
//! with [`cache`], [`cycling`] and [`api`] around it.

pub mod api;
pub mod cache;
pub mod codec;
pub mod config;
pub mod cycling;
pub mod error;
pub mod handler;
pub mod model;
pub mod protocol;
pub mod transport;
