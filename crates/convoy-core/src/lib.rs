//! Core types and error definitions for Convoy.
//!
//! This crate provides the data model shared by every Convoy crate: the task
//! and event schema that crosses agent boundaries, approval records for the
//! human-in-the-loop gate, governance records, and the unified error type.
//!
//! # Main types
//!
//! - [`ConvoyError`]: Unified error enum, including the typed authorization
//!   denials (permission, budget, policy).
//! - [`ConvoyResult`]: Convenience alias for `Result<T, ConvoyError>`.
//! - [`Task`]: A unit of cross-agent work.
//! - [`Event`]: An immutable fact broadcast on the event bus.
//! - [`ApprovalRequest`]: A pending or resolved HITL approval.
//! - [`ReputationRecord`] / [`PermissionLevel`]: Agent trust.
//! - [`CostMetrics`] / [`BudgetPeriod`]: Usage accounting windows.

/// Approval types for human-in-the-loop workflows.
pub mod approval;
/// Error types.
pub mod error;
/// Event schema and event type catalogue.
pub mod event;
/// Cost and reputation records.
pub mod governance;
/// Task schema and lifecycle.
pub mod task;

pub use approval::{ApprovalRequest, ApprovalStatus, RiskLevel};
pub use error::{ConvoyError, ConvoyResult};
pub use event::{Event, EventPriority, EventType, EVENT_CHANNEL_PREFIX, WILDCARD_CHANNEL};
pub use governance::{BudgetPeriod, CostMetrics, PermissionLevel, ReputationRecord};
pub use task::{Priority, Sla, Task, TaskStatus, TaskType};
