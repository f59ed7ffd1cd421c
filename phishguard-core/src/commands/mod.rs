// src/commands/mod.rs
pub mod init;
mod engine;

pub use engine::{Engine, EngineBuilder};
pub use init::{ensure_initialized, ensure_initialized_once, phishguard_root, InitReport};
