//! abot - a plugin-driven assistant
//!
//! A central router dispatches commands tied to a conversation identity to
//! packages that claim them through trigger keywords. The installer fetches,
//! pins and builds the plugins listed in `plugins.json`.
//!
//! This library exposes the core functionality of abot for both
//! the CLI binary and integration testing.

pub mod codegen;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod installer;
pub mod manifest;
pub mod message;
pub mod onboard;
pub mod package;
pub mod pinner;
pub mod server;
pub mod telemetry;
pub mod workcopy;
