//! Core session lifecycle logic for the client-relationship bot's messaging gateway.
//!
//! This crate is intentionally transport-agnostic. The messaging network, the
//! HTTP surface and the chat front end live behind ports (traits) implemented in
//! adapter crates.

pub mod config;
pub mod credentials;
pub mod domain;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod health;
pub mod limiter;
pub mod logging;
pub mod network;
pub mod persistence;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod timers;
pub mod utils;

pub use errors::{Error, Result};
