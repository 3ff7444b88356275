//! Agent messaging and coordination primitives.
//!
//! A topic-keyed publish/subscribe bus with role-based access control,
//! a bounded message log, per-agent mailboxes, and one-shot coordination
//! primitives used by agents to rendezvous during a run.
//!
//! # Main types
//!
//! - [`EventBus`]: Synchronous pub/sub with RBAC, size cap and ring-buffer log.
//! - [`TopicAcl`]: Static table of topic prefixes to permitted roles.
//! - [`AgentMailbox`]: Capability-scoped façade binding one agent to the bus.
//! - [`Barrier`]: N-of-N rendezvous keyed by id.
//! - [`SignalFlag`] / [`SignalBoard`]: One-shot notification flags.

/// Topic access control.
pub mod acl;
/// Event bus and messages.
pub mod bus;
/// Barriers and signal flags.
pub mod coordination;
/// Per-agent mailbox.
pub mod mailbox;

pub use acl::{AclAction, TopicAcl, TopicPattern, TopicRule};
pub use bus::{
    AgentMessage, BusConfig, BusRejection, BusStats, EventBus, MessageDraft, SubscriptionId,
};
pub use coordination::{Barrier, BarrierStats, CoordinationError, SignalBoard, SignalFlag};
pub use mailbox::AgentMailbox;
