//! # Configuration
//!
//! Layered configuration for the ClassChat server: profile defaults, an optional
//! configuration file, `CLASSCHAT_*` environment overrides and CLI flags.

pub mod server;
