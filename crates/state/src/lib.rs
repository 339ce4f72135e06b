//! Environment and configuration helpers.
//!
//! All runtime knobs the gateway reads from the environment live here, so the
//! rest of the workspace never touches `std::env` directly.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Error type for state operations.
pub type Error = anyhow::Error;
/// Result type for state operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable readers and default knobs.
pub mod env;

pub use env::{
    chat_api_key, chat_base_url, discovery_status_ttl, env_install_enabled, home_dir,
    session_gc_interval, session_high_water_mark,
};
