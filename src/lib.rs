//! crew-forge: an orchestration kernel for evolving, autonomous
//! multi-agent crews behind a Model Context Protocol tool surface.

pub mod agent;
pub mod config;
pub mod crew;
pub mod crew_manager;
pub mod dispatcher;
pub mod error;
pub mod evolution;
pub mod ids;
pub mod instructions;
pub mod security;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod workflow;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
