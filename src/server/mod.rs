//! HTTP server exposing memory usage and cache state.
//!
//! - [`api`]: Response types and route handlers

pub mod api;
