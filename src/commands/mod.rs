//! Subcommand implementations

pub mod check_config;
pub mod nonce;
pub mod paper;
