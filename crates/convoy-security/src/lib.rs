//! Security primitives for the Convoy API boundary.
//!
//! Provides request rate limiting, caller authentication and role checks,
//! and the audit trail used by the gateway.
//!
//! # Main types
//!
//! - [`RateLimiter`]: Store-backed sliding-window limiter with a local fallback.
//! - [`Authenticator`]: HS256 JWT and API key verification.
//! - [`Role`] / [`Identity`]: Authenticated callers and their privileges.
//! - [`AuditLog`]: Append-only audit trail persisted to disk.

/// Audit logging module.
pub mod audit;
/// Authentication and roles.
pub mod auth;
/// Sliding-window rate limiting.
pub mod rate_limit;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use auth::{
    constant_time_eq, key_fingerprint, require_role, AuthConfig, AuthMethod, Authenticator,
    Claims, Identity, Role,
};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
