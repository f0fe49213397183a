//! Slipstream Web - JSON API Server

#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
//!
//! Exposes races, pauses, background tasks, configuration and the pause
//! database over HTTP. Every route is a thin adapter over
//! [`slipstream_core::RaceService`].

pub mod error;
pub mod handlers;
pub mod server;

// Re-export main types
pub use error::ApiError;
pub use server::{AppState, router, run_server};
