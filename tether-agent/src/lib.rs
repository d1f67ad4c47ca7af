//! # tether-agent
//!
//! Long-running agent that keeps one managed link to the GUI host and
//! streams module data over it.
//!
//! - **config**: `AgentConfig`, loaded from TOML with env overrides
//! - **service**: `AgentService`, which runs the link and the modules
//! - **modules**: built-in producers (`system`)

pub mod config;
pub mod modules;
pub mod service;
