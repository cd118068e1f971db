//! Programmable HTTP/SOCKS proxy core.
//!
//! A [`server::Server`] accepts client connections and, per request,
//! dispatches to one of four modes: direct, chained through an upstream
//! HTTP(S) proxy, chained through a SOCKS4/4a/5/5h proxy, or intercepted by
//! a caller-supplied synthetic response. See [`prepare`] for the hook that
//! drives this decision and [`helpers`] for the higher-level
//! anonymize/tunnel surface built on top of it.

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod headers;
pub mod helpers;
pub mod prepare;
pub mod redact;
pub mod server;
pub mod socks;
pub mod stats;
pub mod tls;
