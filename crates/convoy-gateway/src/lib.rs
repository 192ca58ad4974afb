//! HTTP and WebSocket API for Convoy.
//!
//! Exposes task submission, event publishing and streaming, the approval
//! workflow and governance reports over axum, behind rate limiting and
//! JWT/API-key authentication.

pub mod approvals;
pub mod error;
pub mod events;
pub mod governance;
pub mod middleware;
pub mod server;
pub mod system;
pub mod tasks;

pub use error::{ApiError, ApiResponse, ApiResult};
pub use server::{sweep_approvals, AppState, GatewayServer, Maintenance};
