// ABOUTME: Library root for conveyor - exposes public types for testing.
// ABOUTME: The main binary is in main.rs.

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod deploy;
pub mod error;
pub mod health;
pub mod hooks;
pub mod output;
pub mod plan;
pub mod registry;
pub mod resolve;
pub mod retry;
pub mod types;
