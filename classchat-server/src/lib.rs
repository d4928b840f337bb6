#![cfg_attr(not(test), forbid(unsafe_code))]

//! ClassChat read-state engine: unread counters, read pointers, seen-by reconciliation,
//! message windows and real-time fan-out of upstream hub events.

pub mod app_state;
pub mod bridge;
pub mod cache;
pub mod db;
pub mod handlers;
pub mod http;
pub mod middleware;
pub mod openapi;
pub mod routes;
pub mod server;
pub mod services;
pub mod store;
mod tracer;

#[cfg(test)]
mod fixtures;

pub use server::{StartupError, run, run_reconciliation};
