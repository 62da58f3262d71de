//! Core runtime for drover: the per-agent control loop, the coordinator,
//! and the seams they depend on (heartbeat directives, bounded memory,
//! the oracle client, instruction parsing, role classification, and the
//! supervisor spawn adapter).
//!
//! All durable coordination goes through `drover-db`; nothing in this
//! crate shares in-process state across components.

pub mod coordinator;
pub mod heartbeat;
pub mod instructions;
pub mod memory;
pub mod oracle;
pub mod runtime;
pub mod spawn;
