//! Rule-routed HTTP/HTTPS forward-proxy load balancer.
//!
//! Clients point an HTTP/1.1 user agent at one of the listener ports. Each
//! request's destination host is matched against an ordered rule table to
//! pick a pool of upstream proxies, one upstream is sampled from the pool,
//! the request is tunneled through it, and a telemetry record is written
//! per request.

pub mod api;
pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod router;
pub mod telemetry;
pub mod upstream;
pub mod wire;
