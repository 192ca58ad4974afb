//! Task orchestration for Convoy.
//!
//! Tasks enter a store-backed priority queue, are routed to the agent that
//! owns their type, pass the human-in-the-loop gate when they are risky, and
//! are executed by polling workers. Every lifecycle step is broadcast on the
//! event bus so agents can react to each other without direct coupling.
//!
//! # Main types
//!
//! - [`TaskQueue`]: Priority queue with FIFO order inside each priority bucket.
//! - [`EventBus`]: Publish/subscribe over typed event channels.
//! - [`TaskRouter`]: Task type → agent table.
//! - [`HitlGate`]: Approval requests for high-risk tasks.
//! - [`AgentWorker`]: Polling loop dispatching tasks to [`AgentHandler`]s.

/// Event publish/subscribe.
pub mod event_bus;
/// Human-in-the-loop approval gate.
pub mod hitl;
/// Task routing table.
pub mod router;
/// Priority task queue.
pub mod task_queue;
/// Agent worker loop.
pub mod worker;

pub use event_bus::{EventBus, EventHandler, EventStream, SubscriptionId};
pub use hitl::{HitlConfig, HitlGate};
pub use router::{RoutingConfig, TaskRouter, DEFAULT_FALLBACK_AGENT};
pub use task_queue::{QueueConfig, QueueStats, TaskQueue};
pub use worker::{AgentHandler, AgentWorker, Backoff, PollOutcome};
