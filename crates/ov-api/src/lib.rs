//! ov-api: HTTP API for the Overseer control plane
//!
//! Thin axum layer over [`ov_supervisor::ControlPlane`]: job submission and
//! control, learning and pattern operations, and read-only store views.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use error::{ApiError, Result};
pub use server::{AppState, app, start_server};
