//! Binds C7 (coordinator manager) to C8 (transport/dispatch), exposing C2
//! and C6 as network-addressable services behind a framed TCP listener, plus
//! an axum health/metrics surface alongside it.

pub mod config;
pub mod handlers;
