// src/lib.rs
//! PhishGuard-Core: domain access decisions for outgoing navigations.
//!
//! - `services` holds the building blocks (store, cache, unlocks, gate,
//!   classifier clients, verifier, refresh, messaging, audit).
//! - `commands` wires them into an owned [`Engine`] with a start/shutdown
//!   lifecycle.

pub mod clock;
pub mod commands;
pub mod config;
pub mod domain;
pub mod error;
pub mod services;

pub use commands::{Engine, EngineBuilder};
pub use error::{EngineError, ErrorKind};
