//! # snapvault
//!
//! Server and CLI around [`snapvault_core`]. The binary in `main.rs` only
//! initializes logging and dispatches to [`cli::execute`].

pub mod api;
pub mod cli;
pub mod config;
